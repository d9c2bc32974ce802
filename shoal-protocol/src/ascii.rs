//! ASCII protocol lines.
//!
//! Commands this codec emits:
//!
//! ```text
//! gets <k1> <k2> ...\r\n
//! set|add|replace|append|prepend <key> <flags> <exptime> <bytes>\r\n<value>\r\n
//! cas <key> <flags> <exptime> <bytes> <cas>\r\n<value>\r\n
//! delete <key>\r\n
//! incr|decr <key> <delta>\r\n
//! flush_all <exptime>\r\n
//! stats\r\n
//! version\r\n
//! verbosity <level>\r\n
//! ```
//!
//! Reads always use `gets` rather than `get`: the extra CAS column is cheap
//! and makes the version id available on every hit.
//!
//! Reply lines are parsed strictly. A `VALUE` line must have exactly the
//! five-token `gets` shape; single-token store/delete outcomes are closed
//! sets with anything else handed back to the caller as a server error
//! payload.

use bytes::BytesMut;

use crate::{MAX_VALUE_LENGTH, ParseError};

/// Terminator line for `gets` and `stats` reply streams.
pub const END: &str = "END";

/// Reply line for flush_all and verbosity.
pub const OK: &str = "OK";

/// Storage command family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreCommand {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
}

impl StoreCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreCommand::Set => "set",
            StoreCommand::Add => "add",
            StoreCommand::Replace => "replace",
            StoreCommand::Append => "append",
            StoreCommand::Prepend => "prepend",
        }
    }

    /// Only `set` has a CAS twin (`cas`); the rest of the family cannot
    /// express a version check on this protocol.
    pub fn supports_cas(&self) -> bool {
        matches!(self, StoreCommand::Set)
    }
}

/// Counter command family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterCommand {
    Incr,
    Decr,
}

impl CounterCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            CounterCommand::Incr => "incr",
            CounterCommand::Decr => "decr",
        }
    }
}

// -- Command writers ---------------------------------------------------------

/// Append `gets k1 k2 ...\r\n`. Keys must be pre-validated and nonempty.
pub fn write_gets(buf: &mut BytesMut, keys: &[&str]) {
    buf.extend_from_slice(b"gets");
    for key in keys {
        buf.extend_from_slice(b" ");
        buf.extend_from_slice(key.as_bytes());
    }
    buf.extend_from_slice(b"\r\n");
}

/// Append a storage command and its value block.
///
/// A nonzero `cas` switches the line to the `cas` command; callers must
/// have already rejected nonzero CAS for commands without a CAS twin.
pub fn write_store(
    buf: &mut BytesMut,
    cmd: StoreCommand,
    key: &str,
    flags: u32,
    exptime: u32,
    cas: u64,
    value: &[u8],
) {
    let line = if cas != 0 {
        format!("cas {key} {flags} {exptime} {} {cas}\r\n", value.len())
    } else {
        format!("{} {key} {flags} {exptime} {}\r\n", cmd.as_str(), value.len())
    };
    buf.extend_from_slice(line.as_bytes());
    buf.extend_from_slice(value);
    buf.extend_from_slice(b"\r\n");
}

/// Append `delete <key>\r\n`.
pub fn write_delete(buf: &mut BytesMut, key: &str) {
    buf.extend_from_slice(format!("delete {key}\r\n").as_bytes());
}

/// Append `incr|decr <key> <delta>\r\n`.
pub fn write_counter(buf: &mut BytesMut, cmd: CounterCommand, key: &str, delta: u64) {
    buf.extend_from_slice(format!("{} {key} {delta}\r\n", cmd.as_str()).as_bytes());
}

/// Append `flush_all <exptime>\r\n`.
pub fn write_flush_all(buf: &mut BytesMut, exptime: u32) {
    buf.extend_from_slice(format!("flush_all {exptime}\r\n").as_bytes());
}

/// Append `stats\r\n`.
pub fn write_stats(buf: &mut BytesMut) {
    buf.extend_from_slice(b"stats\r\n");
}

/// Append `version\r\n`.
pub fn write_version(buf: &mut BytesMut) {
    buf.extend_from_slice(b"version\r\n");
}

/// Append `verbosity <level>\r\n`.
pub fn write_verbosity(buf: &mut BytesMut, level: u32) {
    buf.extend_from_slice(format!("verbosity {level}\r\n").as_bytes());
}

// -- Reply parsers -----------------------------------------------------------

/// Header of one `gets` hit: `VALUE <key> <flags> <bytes> <cas>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueHeader {
    pub key: String,
    pub flags: u32,
    pub len: usize,
    pub cas: u64,
}

/// One line of a `gets` reply stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetLine {
    Value(ValueHeader),
    End,
}

impl GetLine {
    /// Parse a `gets` reply line.
    ///
    /// Only the exact five-token `VALUE` shape and `END` are legal; a
    /// four-token line (the `get` shape) or anything else means the reply
    /// stream cannot be trusted and the connection is desynced.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        if line == END {
            return Ok(GetLine::End);
        }

        let malformed = || ParseError::MalformedLine(line.to_owned());

        let tokens: Vec<&str> = line.split(' ').collect();
        if tokens.len() != 5 || tokens[0] != "VALUE" {
            return Err(malformed());
        }

        let flags: u32 = tokens[2].parse().map_err(|_| malformed())?;
        let len: usize = tokens[3].parse().map_err(|_| malformed())?;
        let cas: u64 = tokens[4].parse().map_err(|_| malformed())?;
        if len > MAX_VALUE_LENGTH {
            return Err(malformed());
        }

        Ok(GetLine::Value(ValueHeader {
            key: tokens[1].to_owned(),
            flags,
            len,
            cas,
        }))
    }
}

/// Single-token outcome of a storage command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreReply {
    Stored,
    NotStored,
    NotFound,
    Exists,
}

impl StoreReply {
    /// `None` means the line is not a storage outcome; the caller should
    /// treat it as a server error payload.
    pub fn parse(line: &str) -> Option<Self> {
        match line {
            "STORED" => Some(StoreReply::Stored),
            "NOT_STORED" => Some(StoreReply::NotStored),
            "NOT_FOUND" => Some(StoreReply::NotFound),
            "EXISTS" => Some(StoreReply::Exists),
            _ => None,
        }
    }
}

/// Single-token outcome of a delete command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteReply {
    Deleted,
    NotFound,
}

impl DeleteReply {
    /// `None` means the line is not a delete outcome (server error payload).
    pub fn parse(line: &str) -> Option<Self> {
        match line {
            "DELETED" => Some(DeleteReply::Deleted),
            "NOT_FOUND" => Some(DeleteReply::NotFound),
            _ => None,
        }
    }
}

/// Reply to `incr`/`decr`: the new counter value or a miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterReply {
    Value(u64),
    NotFound,
}

impl CounterReply {
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        if line == "NOT_FOUND" {
            return Ok(CounterReply::NotFound);
        }
        line.parse()
            .map(CounterReply::Value)
            .map_err(|_| ParseError::InvalidNumber)
    }
}

/// One line of a `stats` reply stream: `STAT <key> <value>` or `END`.
///
/// The value is everything after the second space, so stat values may
/// themselves contain spaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatLine {
    Entry { key: String, value: String },
    End,
}

impl StatLine {
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        if line == END {
            return Ok(StatLine::End);
        }

        let mut tokens = line.splitn(3, ' ');
        match (tokens.next(), tokens.next(), tokens.next()) {
            (Some("STAT"), Some(key), Some(value)) => Ok(StatLine::Entry {
                key: key.to_owned(),
                value: value.to_owned(),
            }),
            _ => Err(ParseError::MalformedLine(line.to_owned())),
        }
    }
}

/// Extract the version string from a `VERSION x.y.z` line.
///
/// `None` means the line is not a version reply (server error payload).
pub fn parse_version_line(line: &str) -> Option<&str> {
    line.strip_prefix("VERSION ")
}
