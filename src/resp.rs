//! RESP protocol support.
//!
//! A single module covering both directions of the wire:
//! - serializing replies and outgoing commands (`RespValue`)
//! - parsing full frames from monitored instances (`parse_value`)
//! - parsing client commands on the listening port (`parse_command`)

use bytes::{Bytes, BytesMut};

/// RESP protocol value, zero-copy where possible.
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// Simple string: `+OK\r\n`
    SimpleString(Bytes),
    /// Error: `-ERR message\r\n`
    Error(Bytes),
    /// Integer: `:1000\r\n`
    Integer(i64),
    /// Bulk string: `$5\r\nhello\r\n`
    BulkString(Bytes),
    /// Null bulk string: `$-1\r\n`
    Null,
    /// Null array: `*-1\r\n`
    NullArray,
    /// Array: `*2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n`
    Array(Vec<RespValue>),
}

impl RespValue {
    #[inline]
    pub fn ok() -> Self {
        Self::SimpleString(Bytes::from_static(b"OK"))
    }

    #[inline]
    pub fn error(msg: &str) -> Self {
        Self::Error(Bytes::copy_from_slice(msg.as_bytes()))
    }

    #[inline]
    pub fn bulk(s: &str) -> Self {
        Self::BulkString(Bytes::copy_from_slice(s.as_bytes()))
    }

    /// Build the usual `command arg arg ...` array of bulk strings.
    pub fn command(parts: &[&str]) -> Self {
        Self::Array(parts.iter().map(|p| Self::bulk(p)).collect())
    }

    /// Serialize to RESP wire format.
    pub fn serialize(&self) -> Bytes {
        let mut buf = Vec::with_capacity(64);
        self.write_to(&mut buf);
        Bytes::from(buf)
    }

    /// Write to an existing buffer, avoiding intermediate allocations.
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        match self {
            RespValue::SimpleString(s) => {
                buf.push(b'+');
                buf.extend_from_slice(s);
                buf.extend_from_slice(b"\r\n");
            }
            RespValue::Error(e) => {
                buf.push(b'-');
                buf.extend_from_slice(e);
                buf.extend_from_slice(b"\r\n");
            }
            RespValue::Integer(n) => {
                buf.push(b':');
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            RespValue::BulkString(data) => {
                buf.push(b'$');
                buf.extend_from_slice(data.len().to_string().as_bytes());
                buf.extend_from_slice(b"\r\n");
                buf.extend_from_slice(data);
                buf.extend_from_slice(b"\r\n");
            }
            RespValue::Null => buf.extend_from_slice(b"$-1\r\n"),
            RespValue::NullArray => buf.extend_from_slice(b"*-1\r\n"),
            RespValue::Array(items) => {
                buf.push(b'*');
                buf.extend_from_slice(items.len().to_string().as_bytes());
                buf.extend_from_slice(b"\r\n");
                for item in items {
                    item.write_to(buf);
                }
            }
        }
    }

    /// Borrow the payload of a simple/error/bulk string.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            RespValue::SimpleString(b) | RespValue::Error(b) | RespValue::BulkString(b) => Some(b),
            _ => None,
        }
    }
}

/// Parse error types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Need more data to complete parsing.
    Incomplete,
    /// Invalid RESP format.
    Invalid(String),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Incomplete => write!(f, "incomplete data"),
            Self::Invalid(msg) => write!(f, "invalid format: {}", msg),
        }
    }
}

impl std::error::Error for ParseError {}

/// Parse one complete RESP frame of any type from the buffer.
///
/// Returns `(value, bytes_consumed)`, or `ParseError::Incomplete` when the
/// buffer does not yet hold a full frame. The caller advances the buffer.
pub fn parse_value(buf: &[u8]) -> Result<(RespValue, usize), ParseError> {
    if buf.is_empty() {
        return Err(ParseError::Incomplete);
    }

    match buf[0] {
        b'+' => {
            let (line, consumed) = read_line(&buf[1..])?;
            Ok((
                RespValue::SimpleString(Bytes::copy_from_slice(line)),
                1 + consumed,
            ))
        }
        b'-' => {
            let (line, consumed) = read_line(&buf[1..])?;
            Ok((RespValue::Error(Bytes::copy_from_slice(line)), 1 + consumed))
        }
        b':' => {
            let (line, consumed) = read_line(&buf[1..])?;
            let n = parse_i64(line)?;
            Ok((RespValue::Integer(n), 1 + consumed))
        }
        b'$' => {
            let (line, consumed) = read_line(&buf[1..])?;
            let len = parse_i64(line)?;
            if len < 0 {
                return Ok((RespValue::Null, 1 + consumed));
            }
            let len = len as usize;
            let start = 1 + consumed;
            if buf.len() < start + len + 2 {
                return Err(ParseError::Incomplete);
            }
            if &buf[start + len..start + len + 2] != b"\r\n" {
                return Err(ParseError::Invalid("bulk string not CRLF terminated".into()));
            }
            Ok((
                RespValue::BulkString(Bytes::copy_from_slice(&buf[start..start + len])),
                start + len + 2,
            ))
        }
        b'*' => {
            let (line, consumed) = read_line(&buf[1..])?;
            let len = parse_i64(line)?;
            if len < 0 {
                return Ok((RespValue::NullArray, 1 + consumed));
            }
            let mut items = Vec::with_capacity(len as usize);
            let mut pos = 1 + consumed;
            for _ in 0..len {
                let (item, used) = parse_value(&buf[pos..])?;
                items.push(item);
                pos += used;
            }
            Ok((RespValue::Array(items), pos))
        }
        _ => Err(ParseError::Invalid(format!(
            "unexpected type byte {:#x}",
            buf[0]
        ))),
    }
}

/// Parse a client command from a buffer.
///
/// Returns `(command_args, bytes_consumed)` on success. Accepts both RESP
/// arrays of bulk strings and inline (telnet-style) commands.
pub fn parse_command(buffer: &BytesMut) -> Result<(Vec<Bytes>, usize), ParseError> {
    if buffer.is_empty() {
        return Err(ParseError::Incomplete);
    }

    if buffer[0] != b'*' {
        return parse_inline_command(buffer);
    }

    let (value, consumed) = parse_value(buffer)?;
    match value {
        RespValue::Array(items) => {
            let mut args = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    RespValue::BulkString(b) => args.push(b),
                    other => {
                        return Err(ParseError::Invalid(format!(
                            "expected bulk string in command array, got {:?}",
                            other
                        )));
                    }
                }
            }
            Ok((args, consumed))
        }
        RespValue::NullArray => Ok((Vec::new(), consumed)),
        _ => Err(ParseError::Invalid("expected command array".into())),
    }
}

/// Inline command: `PING\r\n` or `GET-MASTER-ADDR-BY-NAME mymaster\r\n`.
fn parse_inline_command(buffer: &BytesMut) -> Result<(Vec<Bytes>, usize), ParseError> {
    let (line, consumed) = read_line(buffer)?;
    let args = line
        .split(|&b| b == b' ' || b == b'\t')
        .filter(|part| !part.is_empty())
        .map(Bytes::copy_from_slice)
        .collect();
    Ok((args, consumed))
}

/// Read up to CRLF; returns the line (without CRLF) and bytes consumed
/// including the terminator.
fn read_line(buf: &[u8]) -> Result<(&[u8], usize), ParseError> {
    let mut i = 0;
    while i + 1 < buf.len() {
        if buf[i] == b'\r' && buf[i + 1] == b'\n' {
            return Ok((&buf[..i], i + 2));
        }
        i += 1;
    }
    Err(ParseError::Incomplete)
}

fn parse_i64(line: &[u8]) -> Result<i64, ParseError> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ParseError::Invalid("bad integer".into()))
}
