//! 配置管理模块
//!
//! 配置来源：
//! - TOML 文件（`--config`）
//! - JSON 路由数组（`--routes`），与文件中的路由合并
//!
//! ```toml
//! host = "0.0.0.0"
//! port = 4444
//!
//! [[routes]]
//! path = "/events"
//! capacity = 100000
//! start = "1h"
//! source = { type = "lines", path = "/var/log/events.jsonl", follow = true }
//! ```

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::duration::parse_duration;
use crate::consumer::lines::STDIN_PATH;
use crate::consumer::InitialPosition;

/// 默认端口
pub const DEFAULT_PORT: u16 = 4444;

/// 每个路由默认保留的事件数
pub const DEFAULT_CAPACITY: usize = 100_000;

/// 配置错误
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Unable to parse routes: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_host")]
    pub host: String,

    /// 0 表示由系统分配端口
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_http_workers")]
    pub http_workers: usize,

    /// 停止时等待连接关闭的秒数
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// worker ID 前缀，后接随机 UUID
    #[serde(default = "default_app_name_prefix")]
    pub app_name_prefix: String,

    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            http_workers: default_http_workers(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            app_name_prefix: default_app_name_prefix(),
            routes: Vec::new(),
        }
    }
}

impl ServiceConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// 生成本进程的 worker ID
    pub fn worker_id(&self) -> String {
        format!("{}-{}", self.app_name_prefix, uuid::Uuid::new_v4())
    }

    pub fn shutdown_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// 校验整体配置
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.app_name_prefix.is_empty() {
            return Err(ConfigError::Invalid(
                "app name prefix cannot be empty".to_string(),
            ));
        }
        if self.http_workers == 0 {
            return Err(ConfigError::Invalid(
                "http_workers must be greater than 0".to_string(),
            ));
        }
        if self.routes.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one route must be specified".to_string(),
            ));
        }
        let mut paths = HashSet::new();
        let mut stdin_route: Option<&str> = None;
        for (i, route) in self.routes.iter().enumerate() {
            route.validate(i)?;

            if !paths.insert(route.path.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "route at index {} duplicates path {}",
                    i, route.path
                )));
            }

            // stdin 只能被一个路由读取
            if route.source.is_stdin() {
                if let Some(first) = stdin_route {
                    return Err(ConfigError::Invalid(format!(
                        "routes {} and {} both read from stdin",
                        first, route.path
                    )));
                }
                stdin_route = Some(route.path.as_str());
            }
        }
        Ok(())
    }
}

/// 单个路由配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// 挂载路径，例如 `/events`
    pub path: String,

    /// 0 表示默认容量
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    #[serde(default)]
    pub start: StartPosition,

    #[serde(default)]
    pub source: SourceConfig,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_partition_sync_interval")]
    pub partition_sync_interval_ms: u64,

    #[serde(default = "default_max_records")]
    pub max_records: usize,
}

impl RouteConfig {
    pub fn new(path: impl Into<String>, source: SourceConfig) -> Self {
        Self {
            path: path.into(),
            capacity: default_capacity(),
            start: StartPosition::default(),
            source,
            poll_interval_ms: default_poll_interval(),
            partition_sync_interval_ms: default_partition_sync_interval(),
            max_records: default_max_records(),
        }
    }

    /// 实际使用的容量
    pub fn effective_capacity(&self) -> usize {
        if self.capacity == 0 {
            DEFAULT_CAPACITY
        } else {
            self.capacity
        }
    }

    fn validate(&self, index: usize) -> Result<(), ConfigError> {
        if self.path.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "route at index {} has an empty \"path\"",
                index
            )));
        }
        if !self.path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "route at index {} has a \"path\" without a leading '/': {}",
                index, self.path
            )));
        }
        if self.max_records == 0 {
            return Err(ConfigError::Invalid(format!(
                "route at index {} has \"max_records\" = 0",
                index
            )));
        }
        if let SourceConfig::Lines { path, .. } = &self.source {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "route at index {} has an empty source path",
                    index
                )));
            }
        }
        Ok(())
    }
}

/// 路由的数据来源
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceConfig {
    /// 按行读取 JSON；`path = "-"` 表示 stdin
    Lines {
        path: PathBuf,
        #[serde(default)]
        follow: bool,
    },
    /// 无外部输入，由嵌入方直接写入
    Memory,
}

impl SourceConfig {
    pub fn is_stdin(&self) -> bool {
        matches!(self, SourceConfig::Lines { path, .. } if path.as_os_str() == STDIN_PATH)
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig::Lines {
            path: PathBuf::from(STDIN_PATH),
            follow: false,
        }
    }
}

/// 路由起始位置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum StartPosition {
    #[default]
    Latest,
    TrimHorizon,
    At(DateTime<Utc>),
    /// 相对启动时刻往前推
    Ago(Duration),
}

impl StartPosition {
    /// 解析为 worker 的初始位置；相对时长以 `now` 为基准
    pub fn resolve(&self, now: DateTime<Utc>) -> InitialPosition {
        match self {
            StartPosition::Latest => InitialPosition::Latest,
            StartPosition::TrimHorizon => InitialPosition::Earliest,
            StartPosition::At(ts) => InitialPosition::AtTimestamp(*ts),
            StartPosition::Ago(ago) => InitialPosition::AtTimestamp(
                now.checked_sub_signed(*ago).unwrap_or(DateTime::<Utc>::MIN_UTC),
            ),
        }
    }
}

impl FromStr for StartPosition {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "LATEST" | "latest" => return Ok(StartPosition::Latest),
            "TRIM_HORIZON" | "earliest" => return Ok(StartPosition::TrimHorizon),
            _ => {}
        }

        if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
            return Ok(StartPosition::At(ts.with_timezone(&Utc)));
        }

        parse_duration(s)
            .map(StartPosition::Ago)
            .map_err(|e| ConfigError::Invalid(format!("invalid start position {:?}: {}", s, e)))
    }
}

impl TryFrom<String> for StartPosition {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StartPosition> for String {
    fn from(value: StartPosition) -> Self {
        value.to_string()
    }
}

impl fmt::Display for StartPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartPosition::Latest => f.write_str("LATEST"),
            StartPosition::TrimHorizon => f.write_str("TRIM_HORIZON"),
            StartPosition::At(ts) => f.write_str(&ts.to_rfc3339()),
            StartPosition::Ago(ago) => write!(f, "{}ms", ago.num_milliseconds()),
        }
    }
}

/// 解析 `--routes` 传入的 JSON 数组
pub fn parse_routes_json(json: &str) -> Result<Vec<RouteConfig>, ConfigError> {
    Ok(serde_json::from_str(json)?)
}

// 默认值函数
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_http_workers() -> usize {
    2
}
fn default_shutdown_timeout() -> u64 {
    5
}
fn default_app_name_prefix() -> String {
    "stream2sse".to_string()
}
fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}
fn default_poll_interval() -> u64 {
    1000
}
fn default_partition_sync_interval() -> u64 {
    1000
}
fn default_max_records() -> usize {
    10_000
}
