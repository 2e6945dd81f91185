//! 工具模块

pub mod config;
pub mod duration;

pub use config::{ConfigError, RouteConfig, ServiceConfig, SourceConfig, StartPosition};
pub use duration::{parse_duration, parse_point_in_time, DurationError};
