//! Newline-delimited JSON framing.
//!
//! One JSON-RPC message per line. A line that fails to decode turns into a
//! [`TransportError`] for that line only; the next line parses normally.

use crate::config::{EncodingErrorPolicy, StdioServerConfig, TextEncoding};
use crate::error::{McpError, TransportError};
use crate::protocol::{JsonRpcMessage, JSONRPC_VERSION};
use bytes::{BufMut, BytesMut};
use std::borrow::Cow;
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

/// One decoded unit: a message, or the reason a line was rejected.
pub type Frame = Result<JsonRpcMessage, TransportError>;

/// Encodes messages to lines and splits incoming bytes back into messages.
#[derive(Debug, Default)]
pub struct Framer {
    encoding: TextEncoding,
    errors: EncodingErrorPolicy,
    /// Bytes received since the last newline, used by [`Framer::feed`].
    carry: BytesMut,
}

impl Framer {
    /// Create a framer with an explicit encoding and error policy.
    pub fn new(encoding: TextEncoding, errors: EncodingErrorPolicy) -> Self {
        Self {
            encoding,
            errors,
            carry: BytesMut::new(),
        }
    }

    /// Create a framer matching a server's launch configuration.
    pub fn for_server(config: &StdioServerConfig) -> Self {
        Self::new(config.encoding, config.encoding_error_handler)
    }

    /// Serialize a message without the trailing newline.
    pub fn to_json(message: &JsonRpcMessage) -> Result<String, McpError> {
        Ok(serde_json::to_string(message)?)
    }

    /// Serialize a message to one newline-terminated line.
    pub fn encode_message(&self, message: &JsonRpcMessage) -> Result<Vec<u8>, McpError> {
        let mut line = match self.encoding {
            TextEncoding::Utf8 => serde_json::to_vec(message)?,
        };
        line.push(b'\n');
        Ok(line)
    }

    /// Feed a chunk of bytes and collect every complete line it finishes.
    ///
    /// The trailing partial line is kept until a later chunk completes it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Frame> {
        let mut carry = std::mem::take(&mut self.carry);
        carry.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame(&mut carry) {
            frames.push(frame);
        }

        self.carry = carry;
        frames
    }

    /// Take the first complete line off `buf` and decode it.
    ///
    /// Shared by [`Framer::feed`] and the [`Decoder`] impl, so both split the
    /// stream identically.
    fn next_frame(&self, buf: &mut BytesMut) -> Option<Frame> {
        let pos = buf.iter().position(|b| *b == b'\n')?;
        let line = buf.split_to(pos + 1);
        Some(self.decode_line(&line[..pos]))
    }

    /// Number of buffered bytes waiting for a newline.
    pub fn pending_len(&self) -> usize {
        self.carry.len()
    }

    /// Parse one line (without its newline).
    pub fn decode_line(&self, line: &[u8]) -> Frame {
        let text = self.decode_text(line)?;
        Self::parse_message(&text)
    }

    /// Parse a complete text frame, as received from a WebSocket.
    pub fn parse_message(text: &str) -> Frame {
        let message: JsonRpcMessage =
            serde_json::from_str(text).map_err(|e| TransportError::MalformedMessage {
                reason: e.to_string(),
                raw: text.to_string(),
            })?;

        if message.version() != JSONRPC_VERSION {
            return Err(TransportError::MalformedMessage {
                reason: format!("unsupported jsonrpc version: {}", message.version()),
                raw: text.to_string(),
            });
        }

        Ok(message)
    }

    fn decode_text<'a>(&self, bytes: &'a [u8]) -> Result<Cow<'a, str>, TransportError> {
        match self.encoding {
            TextEncoding::Utf8 => match self.errors {
                EncodingErrorPolicy::Strict => std::str::from_utf8(bytes)
                    .map(Cow::Borrowed)
                    .map_err(|e| TransportError::Decode(e.to_string())),
                EncodingErrorPolicy::Replace => Ok(String::from_utf8_lossy(bytes)),
                EncodingErrorPolicy::Ignore => Ok(decode_utf8_ignoring(bytes)),
            },
        }
    }
}

/// Decode UTF-8, dropping every invalid sequence.
fn decode_utf8_ignoring(mut bytes: &[u8]) -> Cow<'_, str> {
    if let Ok(text) = std::str::from_utf8(bytes) {
        return Cow::Borrowed(text);
    }

    let mut out = String::with_capacity(bytes.len());
    loop {
        match std::str::from_utf8(bytes) {
            Ok(text) => {
                out.push_str(text);
                return Cow::Owned(out);
            }
            Err(e) => {
                let (valid, rest) = bytes.split_at(e.valid_up_to());
                out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                let skip = e.error_len().unwrap_or(rest.len());
                bytes = &rest[skip..];
            }
        }
    }
}

impl Decoder for Framer {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.next_frame(src))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if !src.is_empty() {
            debug!(bytes = src.len(), "Discarding unterminated line at end of stream");
            src.clear();
        }
        Ok(None)
    }
}

impl Encoder<JsonRpcMessage> for Framer {
    type Error = McpError;

    fn encode(&mut self, item: JsonRpcMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = self.encode_message(&item)?;
        dst.reserve(line.len());
        dst.put_slice(&line);
        Ok(())
    }
}
