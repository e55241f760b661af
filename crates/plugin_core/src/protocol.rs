//! Wire contract between the host and a plugin child process.
//!
//! Frames are length-prefixed JSON: a 4-byte big-endian length followed by
//! that many bytes of a UTF-8 JSON document. Framing is self-synchronizing,
//! so either stdio or a local socket works as the transport.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Current protocol version the host expects a child to speak.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Largest frame the host will read from a child before treating it as a
/// transport violation. Guards against a runaway or malicious child.
const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

/// `hello` frame sent by the host immediately after spawn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub protocol_version: String,
    pub config: Value,
}

/// `ready` frame the child must reply with during the handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ready {
    pub name: String,
    pub version: String,
}

/// One request frame sent from the host to a child.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub request_id: u64,
    pub method: String,
    #[serde(default)]
    pub payload: Value,
}

/// One response frame: exactly one of `result` or `error` is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub request_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseFrame {
    pub fn ok(request_id: u64, result: Value) -> Self {
        Self {
            request_id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(request_id: u64, message: impl Into<String>) -> Self {
        Self {
            request_id,
            result: None,
            error: Some(message.into()),
        }
    }

    /// Turns the frame into a plain `Result`, discarding the id.
    pub fn into_result(self) -> Result<Value, String> {
        match (self.result, self.error) {
            (Some(v), _) => Ok(v),
            (None, Some(e)) => Err(e),
            (None, None) => Err("response carried neither result nor error".into()),
        }
    }
}

/// Method names a child is required to implement.
pub mod methods {
    pub const EXECUTE: &str = "execute";
    pub const GET_SCHEMA: &str = "get_schema";
    pub const IS_AVAILABLE: &str = "is_available";
    pub const GET_CURRENT_CONFIG: &str = "get_current_config";
    pub const INITIALIZE: &str = "initialize";
    pub const SHUTDOWN: &str = "shutdown";
}

/// Writes one length-prefixed JSON frame.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> std::io::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(body.len())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "frame too large"))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await
}

/// Reads one length-prefixed JSON frame, or `Ok(None)` on clean EOF before
/// any bytes of the next frame arrive (the child exited).
pub async fn read_frame<R, T>(reader: &mut R) -> std::io::Result<Option<T>>
where
    R: tokio::io::AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    let value = serde_json::from_slice(&body)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trips() {
        let mut buf: Vec<u8> = Vec::new();
        let req = RequestFrame {
            request_id: 7,
            method: "execute".into(),
            payload: serde_json::json!({"a": 1}),
        };
        write_frame(&mut buf, &req).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let read: RequestFrame = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(read.request_id, 7);
        assert_eq!(read.method, "execute");
        assert_eq!(read.payload["a"], 1);
    }

    #[tokio::test]
    async fn clean_eof_yields_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        let read: Option<RequestFrame> = read_frame(&mut cursor).await.unwrap();
        assert!(read.is_none());
    }

    #[test]
    fn response_frame_ok_and_err() {
        let ok = ResponseFrame::ok(1, serde_json::json!(42));
        assert_eq!(ok.into_result().unwrap(), serde_json::json!(42));

        let err = ResponseFrame::err(2, "boom");
        assert_eq!(err.into_result().unwrap_err(), "boom");
    }
}
