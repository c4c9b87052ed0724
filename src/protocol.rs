//! Wire protocol helpers shared by both sides of a replication link.
//!
//! Commands travel as multibulk frames (`*N\r\n` then `$len\r\n<arg>\r\n`
//! per argument). A frame is encoded exactly once per fan-out and cheaply
//! cloned per replica. Monitors receive a human-readable trace line
//! instead of frames.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use once_cell::sync::Lazy;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Instant};

use crate::error::{Error, Result};

/// Bound on any single status/size line read off a replication socket.
pub const LINE_MAX: usize = 1024;
/// Write budget for each step of the blocking-style handshake.
pub const HANDSHAKE_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
/// Read budget for a handshake status line.
pub const HANDSHAKE_READ_TIMEOUT: Duration = Duration::from_secs(3600);

/// One argument of a command to be framed. Integer-encoded values are
/// stringified decimally on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandArg {
    Int(i64),
    Bulk(Bytes),
}

impl CommandArg {
    pub fn bulk(bytes: impl Into<Bytes>) -> Self {
        CommandArg::Bulk(bytes.into())
    }
}

impl From<i64> for CommandArg {
    fn from(v: i64) -> Self {
        CommandArg::Int(v)
    }
}

impl From<&str> for CommandArg {
    fn from(v: &str) -> Self {
        CommandArg::Bulk(Bytes::copy_from_slice(v.as_bytes()))
    }
}

/// Encode `argv` as a single multibulk frame.
pub fn encode_multibulk(argv: &[CommandArg]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(format!("*{}\r\n", argv.len()).as_bytes());
    for arg in argv {
        match arg {
            CommandArg::Bulk(bytes) => {
                buf.extend_from_slice(format!("${}\r\n", bytes.len()).as_bytes());
                buf.extend_from_slice(bytes);
            }
            CommandArg::Int(v) => {
                let repr = v.to_string();
                buf.extend_from_slice(format!("${}\r\n", repr.len()).as_bytes());
                buf.extend_from_slice(repr.as_bytes());
            }
        }
        buf.extend_from_slice(b"\r\n");
    }
    buf.freeze()
}

// Replicas switch database context often enough that the frames for the
// low db ids are worth pre-building.
static SHARED_SELECT: Lazy<[Bytes; 10]> =
    Lazy::new(|| std::array::from_fn(|db| build_select(db as u32)));

fn build_select(db: u32) -> Bytes {
    encode_multibulk(&[
        CommandArg::Bulk(Bytes::from_static(b"SELECT")),
        CommandArg::Int(db as i64),
    ])
}

/// `SELECT <db>` frame, shared for db 0..=9, built on demand above that.
pub fn select_frame(db: u32) -> Bytes {
    match SHARED_SELECT.get(db as usize) {
        Some(frame) => frame.clone(),
        None => build_select(db),
    }
}

/// Format the monitor trace line for one executed command:
/// `+<sec>.<usec> [(db N)] "arg" "arg"...\r\n`.
pub fn format_trace(db: u32, argv: &[CommandArg], now: SystemTime) -> Bytes {
    let since_epoch = now.duration_since(UNIX_EPOCH).unwrap_or_default();
    let mut line = Vec::with_capacity(64);
    line.extend_from_slice(
        format!("+{}.{:06} ", since_epoch.as_secs(), since_epoch.subsec_micros()).as_bytes(),
    );
    if db != 0 {
        line.extend_from_slice(format!("(db {db}) ").as_bytes());
    }
    for (i, arg) in argv.iter().enumerate() {
        if i != 0 {
            line.push(b' ');
        }
        match arg {
            CommandArg::Int(v) => line.extend_from_slice(format!("\"{v}\"").as_bytes()),
            CommandArg::Bulk(bytes) => quote_bytes(&mut line, bytes),
        }
    }
    line.extend_from_slice(b"\r\n");
    Bytes::from(line)
}

fn quote_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.push(b'"');
    for &b in bytes {
        match b {
            b'\\' => out.extend_from_slice(b"\\\\"),
            b'"' => out.extend_from_slice(b"\\\""),
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            b'\t' => out.extend_from_slice(b"\\t"),
            0x07 => out.extend_from_slice(b"\\a"),
            0x08 => out.extend_from_slice(b"\\b"),
            b if b.is_ascii_graphic() || b == b' ' => out.push(b),
            b => out.extend_from_slice(format!("\\x{b:02x}").as_bytes()),
        }
    }
    out.push(b'"');
}

/// One unit read off the primary's stream by a connected replica.
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound {
    /// A parsed command, multibulk or inline.
    Command(Vec<Bytes>),
    /// A bare newline; only refreshes the link liveness clock.
    Keepalive,
    Eof,
}

/// Read the next command, keep-alive or EOF from the primary's stream.
pub async fn read_inbound<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Inbound> {
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(Inbound::Eof);
    }
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return Ok(Inbound::Keepalive);
    }
    if let Some(count) = line.strip_prefix('*') {
        let count: usize = count
            .parse()
            .map_err(|_| Error::BadProtocol(format!("bad multibulk count {line:?}")))?;
        let mut argv = Vec::with_capacity(count);
        for _ in 0..count {
            argv.push(read_bulk(reader).await?);
        }
        return Ok(Inbound::Command(argv));
    }
    // Inline command (the primary pings online replicas with `PING\r\n`).
    Ok(Inbound::Command(
        line.split_whitespace()
            .map(|word| Bytes::copy_from_slice(word.as_bytes()))
            .collect(),
    ))
}

async fn read_bulk<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Bytes> {
    let mut header = String::new();
    if reader.read_line(&mut header).await? == 0 {
        return Err(Error::BadProtocol("eof inside multibulk frame".into()));
    }
    let header = header.trim_end_matches(['\r', '\n']);
    let len: usize = header
        .strip_prefix('$')
        .and_then(|len| len.parse().ok())
        .ok_or_else(|| Error::BadProtocol(format!("bad bulk header {header:?}")))?;
    let mut buf = vec![0u8; len + 2];
    reader.read_exact(&mut buf).await?;
    if !buf.ends_with(b"\r\n") {
        return Err(Error::BadProtocol("bulk argument not CRLF-terminated".into()));
    }
    buf.truncate(len);
    Ok(Bytes::from(buf))
}

/// Write with a deadline; used only during the handshake, before the link
/// joins the normal event-driven paths.
pub(crate) async fn write_timeout<W: AsyncWrite + Unpin>(
    writer: &mut W,
    buf: &[u8],
    budget: Duration,
) -> Result<()> {
    timeout(budget, writer.write_all(buf))
        .await
        .map_err(|_| Error::Timeout("writing to primary"))??;
    Ok(())
}

/// Read one `\n`-terminated line, one byte at a time so nothing past the
/// newline is consumed (the snapshot payload follows the size header on
/// the same socket). The trailing CR/LF is stripped.
pub(crate) async fn read_line_limited<R: AsyncRead + Unpin>(
    reader: &mut R,
    max: usize,
    budget: Duration,
) -> Result<String> {
    let deadline = Instant::now() + budget;
    let mut line = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        let n = tokio::time::timeout_at(deadline, reader.read(&mut byte))
            .await
            .map_err(|_| Error::Timeout("reading line from primary"))??;
        if n == 0 {
            return Err(Error::LinkClosed);
        }
        if byte[0] == b'\n' {
            break;
        }
        if line.len() == max {
            return Err(Error::BadProtocol("line from primary too long".into()));
        }
        line.push(byte[0]);
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line).map_err(|_| Error::BadProtocol("line from primary not utf-8".into()))
}
