/// Core value types shared by routing, pooling and the client facade
use bytes::Bytes;
use std::fmt;

/// One physical memcached server of a cluster
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerSpec {
    /// `host:port`
    pub addr: String,
    /// Relative share of the key space; 0 keeps the server out of the distribution table
    pub weight: u32,
}

impl ServerSpec {
    pub fn new<S: Into<String>>(addr: S, weight: u32) -> Self {
        Self {
            addr: addr.into(),
            weight,
        }
    }
}

impl fmt::Display for ServerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr)
    }
}

/// A value read back from a server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub key: String,
    pub flags: u32,
    pub data: Bytes,
    /// CAS token; present only for `gets`
    pub cas: Option<u64>,
}

impl Item {
    pub fn new<K: Into<String>>(key: K, flags: u32, data: Bytes, cas: Option<u64>) -> Self {
        Self {
            key: key.into(),
            flags,
            data,
            cas,
        }
    }

    /// Interpret the value as a decimal counter
    pub fn as_counter(&self) -> Option<u64> {
        std::str::from_utf8(&self.data).ok()?.trim().parse().ok()
    }
}
