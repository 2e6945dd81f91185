//! SSE 帧编码
//!
//! ```text
//! :ok\n\n                  连接建立后的注释帧
//! data: {"a":1}\n\n        每条事件一帧
//! data: line1\ndata: line2\n\n   多行负载逐行加前缀
//! ```

use bytes::{BufMut, Bytes, BytesMut};

/// 连接建立后立即发送的注释帧
pub const OK_FRAME: &[u8] = b":ok\n\n";

/// SSE 的 Content-Type
pub const CONTENT_TYPE: &str = "text/event-stream";

pub fn ok_frame() -> Bytes {
    Bytes::from_static(OK_FRAME)
}

/// 把一条负载编码为 `data:` 帧
pub fn data_frame(payload: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(payload.len() + 8);

    for line in payload.split(|b| *b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        frame.put_slice(b"data: ");
        frame.put_slice(line);
        frame.put_u8(b'\n');
    }
    frame.put_u8(b'\n');

    frame.freeze()
}
