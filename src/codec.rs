//! Line-delimited JSON wire codec.
//!
//! Every message is one compact JSON object terminated by `\r\n`. The `act`
//! field tags the message kind:
//!
//! ```text
//! {"act":"login","password":"rrr"}
//! {"act":"cmd","rid":7,"name":"inc","args":[5],"kargs":{}}
//! {"act":"res","rid":7,"res":6}
//! {"act":"err","rid":7,"cls":"NameError","args":["No such command"]}
//! {"act":"hb"}
//! ```
//!
//! Decoding is deliberately forgiving: a line that is not JSON, not an
//! object, or not a recognizable message is dropped without any error so the
//! stream resynchronizes on the next newline. Peers are allowed to interleave
//! stray text (boot banners, debug prints) with protocol frames.

use std::io;

use serde::{Deserialize, Serialize};
use serde_json::ser::Formatter;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{trace, warn};

use crate::error::RpcError;

/// Frame terminator appended by [`encode`].
pub const LINE_TERMINATOR: &str = "\r\n";

/// Longest accepted frame (16MB). Longer lines are skipped.
pub const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

/// Identifier correlating a call with its response.
pub type RequestId = u64;

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "act")]
pub enum Message {
    /// Client credentials, sent once right after connecting.
    #[serde(rename = "login")]
    Login { password: String },

    /// Invoke a named command on the peer.
    #[serde(rename = "cmd")]
    Call {
        rid: RequestId,
        name: String,
        #[serde(default)]
        args: Vec<Value>,
        #[serde(default)]
        kargs: Map<String, Value>,
    },

    /// Successful result of a call.
    #[serde(rename = "res")]
    Response {
        rid: RequestId,
        #[serde(default)]
        res: Value,
    },

    /// Failed result of a call.
    #[serde(rename = "err")]
    Error {
        rid: RequestId,
        cls: String,
        #[serde(default)]
        args: Vec<Value>,
    },

    /// Liveness marker.
    #[serde(rename = "hb")]
    Heartbeat,

    /// Any other `act` value. Never sent.
    #[serde(other)]
    Unknown,
}

impl Message {
    /// Short name of the message kind, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Login { .. } => "login",
            Message::Call { .. } => "cmd",
            Message::Response { .. } => "res",
            Message::Error { .. } => "err",
            Message::Heartbeat => "hb",
            Message::Unknown => "unknown",
        }
    }
}

/// Serialize a message into one wire line, terminator included.
///
/// The line is pure ASCII: non-ASCII characters are written as `\uXXXX`
/// escapes (surrogate pairs above the BMP), matching peers that read frames
/// as ISO-8859-1.
///
/// # Errors
///
/// Returns [`RpcError::Encode`] if the message cannot be serialized.
pub fn encode(message: &Message) -> Result<String, RpcError> {
    let mut line = Vec::with_capacity(64);
    let mut serializer = serde_json::Serializer::with_formatter(&mut line, AsciiFormatter);
    message.serialize(&mut serializer).map_err(RpcError::Encode)?;
    line.extend_from_slice(LINE_TERMINATOR.as_bytes());
    String::from_utf8(line)
        .map_err(|e| RpcError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))
}

/// Compact JSON formatter escaping everything outside ASCII.
struct AsciiFormatter;

impl Formatter for AsciiFormatter {
    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        let mut start = 0;
        for (index, ch) in fragment.char_indices() {
            if ch.is_ascii() {
                continue;
            }
            writer.write_all(fragment[start..index].as_bytes())?;
            let mut units = [0u16; 2];
            for unit in ch.encode_utf16(&mut units) {
                write!(writer, "\\u{:04x}", unit)?;
            }
            start = index + ch.len_utf8();
        }
        writer.write_all(fragment[start..].as_bytes())
    }
}

/// Parse one wire line.
///
/// Returns `None` for anything that is not a well-formed message. This is
/// not an error: the caller simply moves on to the next line.
pub fn decode(line: &[u8]) -> Option<Message> {
    let value: Value = serde_json::from_slice(line.trim_ascii()).ok()?;
    if !value.is_object() {
        return None;
    }
    serde_json::from_value(value).ok()
}

/// Write one message as a single frame and flush it.
///
/// Callers sharing a writer must serialize calls to this function so frames
/// never interleave.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), RpcError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let line = encode(message)?;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Buffered reader yielding decoded messages from a byte stream.
pub struct FrameReader<R> {
    reader: BufReader<R>,
    line: Vec<u8>,
    /// Set while skipping the remainder of an oversized line.
    skipping: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            line: Vec::new(),
            skipping: false,
        }
    }

    /// Read until the next decodable message.
    ///
    /// Undecodable lines are skipped silently.
    ///
    /// # Errors
    ///
    /// - [`RpcError::ConnectionClosed`] on EOF, including EOF in the middle
    ///   of a line (a truncated final line is treated as end of stream)
    /// - [`RpcError::Io`] if the underlying read fails
    pub async fn next_message(&mut self) -> Result<Message, RpcError> {
        loop {
            self.next_line().await?;
            match decode(&self.line) {
                Some(message) => return Ok(message),
                None => self.discard(),
            }
        }
    }

    /// Read until the next line holding a JSON object, whatever its fields.
    ///
    /// Used where the exact shape of a frame matters more than whether it
    /// is a well-formed [`Message`], such as the login handshake. Errors are
    /// the same as for [`FrameReader::next_message`].
    pub async fn next_object(&mut self) -> Result<Map<String, Value>, RpcError> {
        loop {
            self.next_line().await?;
            match serde_json::from_slice::<Value>(self.line.trim_ascii()) {
                Ok(Value::Object(object)) => return Ok(object),
                _ => self.discard(),
            }
        }
    }

    /// Fill `self.line` with the next complete line, skipping oversized ones.
    async fn next_line(&mut self) -> Result<(), RpcError> {
        loop {
            self.line.clear();
            let read = (&mut self.reader)
                .take(MAX_LINE_LENGTH as u64)
                .read_until(b'\n', &mut self.line)
                .await?;

            if read == 0 {
                return Err(RpcError::ConnectionClosed);
            }

            if self.line.last() != Some(&b'\n') {
                if read < MAX_LINE_LENGTH {
                    trace!("Discarding truncated final line ({} bytes)", read);
                    return Err(RpcError::ConnectionClosed);
                }
                if !self.skipping {
                    warn!("Skipping line longer than {} bytes", MAX_LINE_LENGTH);
                }
                self.skipping = true;
                continue;
            }

            // Tail of an oversized line
            if std::mem::take(&mut self.skipping) {
                continue;
            }
            return Ok(());
        }
    }

    fn discard(&self) {
        trace!(
            "Discarding non-protocol line: {}",
            String::from_utf8_lossy(&self.line).trim_end()
        );
    }
}
