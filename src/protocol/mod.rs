/// Memcached text protocol requests and responses
///
/// Only the subset of the ASCII protocol the cluster client speaks is modelled
/// here: retrieval, storage, delete, counters, flush, stats and version.
pub mod parser;

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::str;

pub use parser::ResponseParser;

use crate::core::Item;

/// Storage command flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
    Cas,
}

impl StoreMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreMode::Set => "set",
            StoreMode::Add => "add",
            StoreMode::Replace => "replace",
            StoreMode::Append => "append",
            StoreMode::Prepend => "prepend",
            StoreMode::Cas => "cas",
        }
    }
}

impl fmt::Display for StoreMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single command sent to one server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Get {
        keys: Vec<String>,
        with_cas: bool,
    },
    Store {
        mode: StoreMode,
        key: String,
        flags: u32,
        exptime: u32,
        data: Bytes,
        /// Required for `StoreMode::Cas`, ignored otherwise
        cas: Option<u64>,
    },
    Delete {
        key: String,
    },
    Incr {
        key: String,
        delta: u64,
    },
    Decr {
        key: String,
        delta: u64,
    },
    FlushAll,
    /// `stats`, `stats items`, `stats slabs`, `stats cachedump <id> <limit>`
    Stats(Option<String>),
    Version,
}

/// Which reply shape a request expects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Values,
    Storage,
    Delete,
    Numeric,
    Ok,
    Stats,
    Version,
}

/// Error class reported by the server itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerErrorKind {
    /// `ERROR`: unknown command
    Command,
    /// `CLIENT_ERROR`: the request was malformed
    Client,
    /// `SERVER_ERROR`: the server could not fulfil the request
    Server,
}

/// A complete reply from one server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Values(Vec<Item>),
    Stored,
    NotStored,
    Exists,
    NotFound,
    Deleted,
    Numeric(u64),
    Ok,
    /// `STAT name value` lines, or `ITEM key info` lines for cachedump
    Stats(Vec<(String, String)>),
    Version(String),
    Error {
        kind: ServerErrorKind,
        message: String,
    },
}

/// Parse error types
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid response format: {0}")]
    InvalidFormat(String),
    #[error("Invalid UTF-8: {0}")]
    InvalidUtf8(#[from] str::Utf8Error),
    #[error("Unexpected reply to {expected:?}: {line}")]
    Unexpected { expected: ReplyKind, line: String },
}

impl From<ProtocolError> for crate::error::MemcacheError {
    fn from(err: ProtocolError) -> Self {
        crate::error::MemcacheError::Protocol(err.to_string())
    }
}

impl Request {
    /// Name used in logs
    pub fn command_name(&self) -> &'static str {
        match self {
            Request::Get { with_cas: false, .. } => "get",
            Request::Get { with_cas: true, .. } => "gets",
            Request::Store { mode, .. } => mode.as_str(),
            Request::Delete { .. } => "delete",
            Request::Incr { .. } => "incr",
            Request::Decr { .. } => "decr",
            Request::FlushAll => "flush_all",
            Request::Stats(_) => "stats",
            Request::Version => "version",
        }
    }

    pub fn reply_kind(&self) -> ReplyKind {
        match self {
            Request::Get { .. } => ReplyKind::Values,
            Request::Store { .. } => ReplyKind::Storage,
            Request::Delete { .. } => ReplyKind::Delete,
            Request::Incr { .. } | Request::Decr { .. } => ReplyKind::Numeric,
            Request::FlushAll => ReplyKind::Ok,
            Request::Stats(_) => ReplyKind::Stats,
            Request::Version => ReplyKind::Version,
        }
    }

    /// Encode the request into a fresh buffer
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Encode the request into an existing buffer
    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Request::Get { keys, .. } => {
                buf.extend_from_slice(self.command_name().as_bytes());
                for key in keys {
                    buf.put_u8(b' ');
                    buf.extend_from_slice(key.as_bytes());
                }
                buf.put_slice(b"\r\n");
            }
            Request::Store {
                mode,
                key,
                flags,
                exptime,
                data,
                cas,
            } => {
                let header = match (mode, cas) {
                    (StoreMode::Cas, Some(cas)) => format!(
                        "cas {} {} {} {} {}\r\n",
                        key,
                        flags,
                        exptime,
                        data.len(),
                        cas
                    ),
                    _ => format!("{} {} {} {} {}\r\n", mode, key, flags, exptime, data.len()),
                };
                buf.extend_from_slice(header.as_bytes());
                buf.extend_from_slice(data);
                buf.put_slice(b"\r\n");
            }
            Request::Delete { key } => {
                buf.extend_from_slice(format!("delete {}\r\n", key).as_bytes());
            }
            Request::Incr { key, delta } => {
                buf.extend_from_slice(format!("incr {} {}\r\n", key, delta).as_bytes());
            }
            Request::Decr { key, delta } => {
                buf.extend_from_slice(format!("decr {} {}\r\n", key, delta).as_bytes());
            }
            Request::FlushAll => buf.put_slice(b"flush_all\r\n"),
            Request::Stats(None) => buf.put_slice(b"stats\r\n"),
            Request::Stats(Some(arg)) => {
                buf.extend_from_slice(format!("stats {}\r\n", arg).as_bytes());
            }
            Request::Version => buf.put_slice(b"version\r\n"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_get_and_gets() {
        let request = Request::Get {
            keys: vec!["a".to_string(), "b".to_string()],
            with_cas: false,
        };
        assert_eq!(request.encode(), Bytes::from("get a b\r\n"));

        let request = Request::Get {
            keys: vec!["a".to_string()],
            with_cas: true,
        };
        assert_eq!(request.encode(), Bytes::from("gets a\r\n"));
    }

    #[test]
    fn test_encode_storage_commands() {
        let request = Request::Store {
            mode: StoreMode::Add,
            key: "user:1".to_string(),
            flags: 5,
            exptime: 0,
            data: Bytes::from_static(b"hello"),
            cas: None,
        };
        assert_eq!(request.encode(), Bytes::from("add user:1 5 0 5\r\nhello\r\n"));

        let request = Request::Store {
            mode: StoreMode::Cas,
            key: "k".to_string(),
            flags: 0,
            exptime: 1700000000,
            data: Bytes::from_static(b"v"),
            cas: Some(99),
        };
        assert_eq!(
            request.encode(),
            Bytes::from("cas k 0 1700000000 1 99\r\nv\r\n")
        );
    }

    #[test]
    fn test_encode_misc_commands() {
        assert_eq!(
            Request::Incr {
                key: "n".to_string(),
                delta: 3
            }
            .encode(),
            Bytes::from("incr n 3\r\n")
        );
        assert_eq!(
            Request::Delete {
                key: "n".to_string()
            }
            .encode(),
            Bytes::from("delete n\r\n")
        );
        assert_eq!(Request::FlushAll.encode(), Bytes::from("flush_all\r\n"));
        assert_eq!(
            Request::Stats(Some("cachedump 1 10".to_string())).encode(),
            Bytes::from("stats cachedump 1 10\r\n")
        );
        assert_eq!(Request::Version.encode(), Bytes::from("version\r\n"));
    }

    #[test]
    fn test_reply_kinds() {
        assert_eq!(Request::Version.reply_kind(), ReplyKind::Version);
        assert_eq!(Request::FlushAll.reply_kind(), ReplyKind::Ok);
        assert_eq!(
            Request::Decr {
                key: "k".to_string(),
                delta: 1
            }
            .reply_kind(),
            ReplyKind::Numeric
        );
    }
}
