//! `Content-Length` framing over an async byte stream.
//!
//! ```text
//! Content-Length: 123\r\n
//! \r\n
//! { ...json... }
//! ```

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::{DapError, Result};
use crate::protocol::ProtocolMessage;

/// Maximum allowed payload size (in bytes) of a single message.
///
/// Caps the incoming `Content-Length` so a broken adapter can't make us allocate
/// an arbitrarily large buffer before reading the body.
pub const MAX_DAP_MESSAGE_BYTES: usize = 16 * 1024 * 1024; // 16 MiB

/// Maximum allowed size of a single header line (in bytes).
pub const MAX_DAP_HEADER_LINE_BYTES: usize = 8 * 1024; // 8 KiB

pub(crate) fn sanitize_json_error_message(message: &str) -> String {
    // `serde_json::Error` display strings can include scalar values from the payload
    // (`invalid type: string "..."`). Adapter payloads carry launch args, env and
    // evaluated values, so keep them out of logs.
    let mut out = String::with_capacity(message.len());
    let mut rest = message;
    while let Some(start) = rest.find('"') {
        out.push_str(&rest[..start + 1]);
        rest = &rest[start + 1..];

        let Some(end) = rest.find('"') else {
            out.push_str(rest);
            return out;
        };
        out.push_str("<redacted>\"");
        rest = &rest[end + 1..];
    }
    out.push_str(rest);

    // `unknown field `secret`, expected ...`
    if let Some(start) = out.find('`') {
        if let Some(end_rel) = out[start + 1..].find('`') {
            let end = start + 1 + end_rel;
            out.replace_range(start + 1..end, "<redacted>");
        }
    }

    out
}

pub struct DapReader<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin> DapReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
        }
    }

    async fn read_header_line(&mut self, buf: &mut Vec<u8>) -> Result<bool> {
        buf.clear();
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(!buf.is_empty());
            }

            let newline_pos = available.iter().position(|&b| b == b'\n');
            let take = newline_pos.map(|pos| pos + 1).unwrap_or(available.len());
            if buf.len() + take > MAX_DAP_HEADER_LINE_BYTES {
                return Err(DapError::Protocol(format!(
                    "DAP header line exceeds maximum size ({MAX_DAP_HEADER_LINE_BYTES} bytes)"
                )));
            }

            buf.extend_from_slice(&available[..take]);
            self.reader.consume(take);
            if newline_pos.is_some() {
                return Ok(true);
            }
        }
    }

    /// Read one framed payload.
    ///
    /// Returns `Ok(None)` on a clean end of stream (EOF before any header byte).
    /// EOF anywhere inside a message is an error.
    pub async fn read_raw(&mut self) -> Result<Option<Vec<u8>>> {
        let mut content_length: Option<usize> = None;
        let mut saw_header_line = false;
        let mut line = Vec::new();

        loop {
            if !self.read_header_line(&mut line).await? {
                if !saw_header_line {
                    return Ok(None);
                }
                return Err(DapError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "EOF while reading DAP headers",
                )));
            }
            saw_header_line = true;

            let text = std::str::from_utf8(&line)
                .map_err(|_| DapError::Protocol("DAP header line is not UTF-8".to_string()))?;
            let text = text.trim_end_matches(['\r', '\n']);
            if text.is_empty() {
                break;
            }

            let Some((name, value)) = text.split_once(':') else {
                continue;
            };

            if name.eq_ignore_ascii_case("Content-Length") {
                let value = value.trim();
                content_length = Some(value.parse::<usize>().map_err(|e| {
                    DapError::Protocol(format!("invalid Content-Length {value:?}: {e}"))
                })?);
            }
        }

        let Some(len) = content_length else {
            return Err(DapError::Protocol(
                "missing Content-Length header".to_string(),
            ));
        };

        if len > MAX_DAP_MESSAGE_BYTES {
            return Err(DapError::Protocol(format!(
                "DAP message Content-Length {len} exceeds maximum allowed size {MAX_DAP_MESSAGE_BYTES}"
            )));
        }

        let mut buf = vec![0u8; len];
        self.reader.read_exact(&mut buf).await?;
        Ok(Some(buf))
    }

    pub async fn read_value(&mut self) -> Result<Option<Value>> {
        let Some(bytes) = self.read_raw().await? else {
            return Ok(None);
        };
        let value = serde_json::from_slice(&bytes)
            .map_err(|err| DapError::Protocol(sanitize_json_error_message(&err.to_string())))?;
        Ok(Some(value))
    }

    pub async fn read_message(&mut self) -> Result<Option<ProtocolMessage>> {
        let Some(bytes) = self.read_raw().await? else {
            return Ok(None);
        };
        let message = serde_json::from_slice(&bytes)
            .map_err(|err| DapError::Protocol(sanitize_json_error_message(&err.to_string())))?;
        Ok(Some(message))
    }
}

pub struct DapWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> DapWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write_raw(&mut self, json_bytes: &[u8]) -> Result<()> {
        self.writer
            .write_all(format!("Content-Length: {}\r\n\r\n", json_bytes.len()).as_bytes())
            .await?;
        self.writer.write_all(json_bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn write_json<T: Serialize>(&mut self, message: &T) -> Result<()> {
        let bytes = serde_json::to_vec(message)?;
        self.write_raw(&bytes).await
    }

    pub async fn write_message(&mut self, message: &ProtocolMessage) -> Result<()> {
        self.write_json(message).await
    }

    /// Flush and close our half of the stream so the peer reads a clean EOF.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
