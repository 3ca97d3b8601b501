//! JSON-RPC framing over a byte stream.
//!
//! Language servers frame every message as `Content-Length: N\r\n\r\n`
//! followed by N bytes of UTF-8 JSON. [`FrameReader`] and [`FrameWriter`]
//! are the two halves of that codec; the session gives each half to a
//! dedicated task so reads and writes stay strictly serialized.

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Upper bound on a single frame body (8 MiB). Anything larger is treated
/// as a malformed frame rather than an allocation request.
const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Errors produced while reading or writing frames.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Headers or body did not follow the wire format.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    /// The underlying stream failed.
    #[error("frame I/O: {0}")]
    Io(#[from] std::io::Error),
}

impl CodecError {
    fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedFrame(msg.into())
    }
}

/// Reads framed JSON-RPC messages from an async byte stream.
pub struct FrameReader<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
        }
    }

    /// Read the next frame, returning `Ok(None)` on clean EOF (the stream
    /// ended on a frame boundary).
    pub async fn read_frame(&mut self) -> Result<Option<Value>, CodecError> {
        let Some(len) = self.read_headers().await? else {
            return Ok(None);
        };

        if len > MAX_FRAME_BYTES {
            return Err(CodecError::malformed(format!(
                "Content-Length {len} exceeds limit of {MAX_FRAME_BYTES}"
            )));
        }

        let mut body = vec![0u8; len];
        self.reader.read_exact(&mut body).await?;

        let value = serde_json::from_slice(&body)
            .map_err(|e| CodecError::malformed(format!("invalid JSON body: {e}")))?;
        Ok(Some(value))
    }

    /// Consume header lines up to the blank separator and return the
    /// announced body length. `None` means EOF before any header byte.
    async fn read_headers(&mut self) -> Result<Option<usize>, CodecError> {
        let mut content_length = None;
        let mut line = String::new();
        let mut started = false;

        loop {
            line.clear();
            let n = self.reader.read_line(&mut line).await?;
            if n == 0 {
                // EOF between frames is a normal shutdown; EOF after a
                // partial header block is not.
                if started {
                    return Err(CodecError::malformed("EOF inside frame headers"));
                }
                return Ok(None);
            }
            started = true;

            let trimmed = line.trim_end_matches(['\r', '\n']);
            if trimmed.is_empty() {
                break;
            }

            let Some((name, value)) = trimmed.split_once(':') else {
                return Err(CodecError::malformed(format!(
                    "header without colon: {trimmed:?}"
                )));
            };
            // Content-Type and any other header are tolerated and skipped.
            if name.trim().eq_ignore_ascii_case("content-length") {
                let len = value.trim().parse::<usize>().map_err(|_| {
                    CodecError::malformed(format!(
                        "non-numeric Content-Length: {:?}",
                        value.trim()
                    ))
                })?;
                content_length = Some(len);
            }
        }

        content_length
            .map(Some)
            .ok_or_else(|| CodecError::malformed("missing Content-Length header"))
    }
}

/// Writes framed JSON-RPC messages to an async byte stream.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Serialize `msg` and write header plus body as one buffered write.
    pub async fn write_frame(&mut self, msg: &Value) -> Result<(), CodecError> {
        let body = serde_json::to_vec(msg)
            .map_err(|e| CodecError::malformed(format!("unserializable message: {e}")))?;

        let mut frame = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
        frame.extend_from_slice(&body);

        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn roundtrip_preserves_message() {
        let msg = json!({
            "jsonrpc": "2.0",
            "id": 7,
            "method": "workspace/symbol",
            "params": { "query": "" }
        });

        let mut buf = Vec::new();
        FrameWriter::new(&mut buf).write_frame(&msg).await.unwrap();

        let mut reader = FrameReader::new(buf.as_slice());
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), msg);
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn consecutive_frames_keep_boundaries() {
        let first = json!({"jsonrpc": "2.0", "id": 1, "result": null});
        let second = json!({"jsonrpc": "2.0", "method": "exit"});

        let mut buf = Vec::new();
        {
            let mut writer = FrameWriter::new(&mut buf);
            writer.write_frame(&first).await.unwrap();
            writer.write_frame(&second).await.unwrap();
        }

        let mut reader = FrameReader::new(buf.as_slice());
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), first);
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), second);
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn content_length_counts_bytes_not_chars() {
        // "é" is two bytes; the header must reflect the byte count.
        let msg = json!({"text": "é"});
        let mut buf = Vec::new();
        FrameWriter::new(&mut buf).write_frame(&msg).await.unwrap();

        let body = serde_json::to_vec(&msg).unwrap();
        let text = String::from_utf8(buf.clone()).unwrap();
        assert!(text.starts_with(&format!("Content-Length: {}\r\n\r\n", body.len())));

        let mut reader = FrameReader::new(buf.as_slice());
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), msg);
    }

    #[tokio::test]
    async fn eof_at_boundary_is_clean() {
        let mut reader = FrameReader::new(&b""[..]);
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_inside_headers_is_malformed() {
        let mut reader = FrameReader::new(&b"Content-Length: 10\r\n"[..]);
        assert!(matches!(
            reader.read_frame().await,
            Err(CodecError::MalformedFrame(_))
        ));
    }

    #[tokio::test]
    async fn eof_inside_body_is_io_error() {
        let mut reader = FrameReader::new(&b"Content-Length: 50\r\n\r\n{\"tr"[..]);
        assert!(matches!(reader.read_frame().await, Err(CodecError::Io(_))));
    }

    #[tokio::test]
    async fn missing_content_length_rejected() {
        let mut reader = FrameReader::new(&b"Content-Type: application/json\r\n\r\n{}"[..]);
        let err = reader.read_frame().await.unwrap_err();
        assert!(err.to_string().contains("missing Content-Length"));
    }

    #[tokio::test]
    async fn non_numeric_length_rejected() {
        let mut reader = FrameReader::new(&b"Content-Length: banana\r\n\r\n"[..]);
        assert!(matches!(
            reader.read_frame().await,
            Err(CodecError::MalformedFrame(_))
        ));
    }

    #[tokio::test]
    async fn header_name_is_case_insensitive() {
        let body = br#"{"jsonrpc":"2.0","id":3}"#;
        let frame = format!("content-length: {}\r\n\r\n", body.len());
        let mut bytes = frame.into_bytes();
        bytes.extend_from_slice(body);

        let mut reader = FrameReader::new(bytes.as_slice());
        let msg = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(msg["id"], 3);
    }

    #[tokio::test]
    async fn extra_headers_are_skipped() {
        let body = br#"{"jsonrpc":"2.0","id":4}"#;
        let frame = format!(
            "Content-Type: application/vscode-jsonrpc; charset=utf-8\r\nContent-Length: {}\r\n\r\n",
            body.len()
        );
        let mut bytes = frame.into_bytes();
        bytes.extend_from_slice(body);

        let mut reader = FrameReader::new(bytes.as_slice());
        let msg = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(msg["id"], 4);
    }

    #[tokio::test]
    async fn invalid_json_body_is_malformed() {
        let body = b"this is not json";
        let frame = format!("Content-Length: {}\r\n\r\n", body.len());
        let mut bytes = frame.into_bytes();
        bytes.extend_from_slice(body);

        let mut reader = FrameReader::new(bytes.as_slice());
        assert!(matches!(
            reader.read_frame().await,
            Err(CodecError::MalformedFrame(_))
        ));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let frame = format!("Content-Length: {}\r\n\r\n", MAX_FRAME_BYTES + 1);
        let mut reader = FrameReader::new(frame.as_bytes());
        assert!(matches!(
            reader.read_frame().await,
            Err(CodecError::MalformedFrame(_))
        ));
    }
}
