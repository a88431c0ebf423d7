/// TCP transport speaking the memcached text protocol
use async_trait::async_trait;
use bytes::BytesMut;
use socket2::SockRef;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{ConnectionResult, Connector, Transport};
use crate::core::ServerSpec;
use crate::error::{MemcacheError, MemcacheResult};
use crate::protocol::{Request, Response, ResponseParser};

/// Opens TCP connections to memcached servers
#[derive(Debug, Clone)]
pub struct TcpConnector {
    /// Connection timeout
    connect_timeout: Duration,
    /// Read timeout for a single round trip
    read_timeout: Duration,
    /// Leave Nagle's algorithm on
    nagle: bool,
    /// Initial read buffer size
    buffer_size: usize,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration, read_timeout: Duration, nagle: bool) -> Self {
        Self {
            connect_timeout,
            read_timeout,
            nagle,
            buffer_size: 8192, // 8KB buffer by default
        }
    }

    /// Connector matching a cluster's socket settings
    pub fn from_cluster(config: &crate::config::ClusterConfig) -> Self {
        Self::new(config.connect_timeout(), config.socket_timeout(), config.nagle)
    }

    /// Update read buffer size for new connections
    pub fn set_buffer_size(&mut self, buffer_size: usize) {
        self.buffer_size = buffer_size;
    }

    fn configure_stream(&self, stream: &TcpStream) -> Result<(), io::Error> {
        stream.set_nodelay(!self.nagle)?;
        SockRef::from(stream).set_keepalive(true)?;
        Ok(())
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(3), Duration::from_secs(3), true)
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, server: &ServerSpec) -> ConnectionResult {
        debug!("Connecting to memcached server {}", server.addr);

        match timeout(self.connect_timeout, TcpStream::connect(server.addr.as_str())).await {
            Ok(Ok(stream)) => {
                if let Err(e) = self.configure_stream(&stream) {
                    warn!("Failed to configure stream to {}: {}", server.addr, e);
                }

                debug!("Connected to memcached server {}", server.addr);
                ConnectionResult::Success(Box::new(TcpTransport::new(
                    stream,
                    server.addr.clone(),
                    self.read_timeout,
                    self.buffer_size,
                )))
            }
            Ok(Err(e)) => match e.kind() {
                io::ErrorKind::ConnectionRefused => {
                    debug!("Connection refused by {}", server.addr);
                    ConnectionResult::ConnectionRefused
                }
                _ => {
                    debug!("Network error connecting to {}: {}", server.addr, e);
                    ConnectionResult::NetworkError(e)
                }
            },
            Err(_) => {
                debug!("Timeout connecting to {}", server.addr);
                ConnectionResult::Timeout
            }
        }
    }
}

/// An established connection to one server
pub struct TcpTransport {
    stream: TcpStream,
    server: String,
    read_timeout: Duration,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl TcpTransport {
    pub fn new(stream: TcpStream, server: String, read_timeout: Duration, buffer_size: usize) -> Self {
        Self {
            stream,
            server,
            read_timeout,
            read_buf: BytesMut::with_capacity(buffer_size),
            write_buf: BytesMut::with_capacity(buffer_size),
        }
    }

    async fn exchange(&mut self, request: &Request) -> MemcacheResult<Response> {
        self.write_buf.clear();
        request.encode_into(&mut self.write_buf);
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;

        let mut parser = ResponseParser::new(request.reply_kind());
        loop {
            if let Some(response) = parser.resume(&mut self.read_buf)? {
                return Ok(response);
            }
            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(MemcacheError::Network(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("{} closed the connection", self.server),
                )));
            }
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn round_trip(&mut self, request: &Request) -> MemcacheResult<Response> {
        match timeout(self.read_timeout, self.exchange(request)).await {
            Ok(result) => result,
            Err(_) => Err(MemcacheError::timeout(format!(
                "{} on {}",
                request.command_name(),
                self.server
            ))),
        }
    }
}
