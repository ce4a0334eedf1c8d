//! Transport seam between the engine and concrete transports.
//!
//! A [`ChannelProvider`] binds acceptors and opens outbound channels for a
//! [`Location`]. Every channel is a byte stream implementing [`ChannelIo`].
//! The engine wraps it in a [`Channel`] that buffers inbound bytes until a
//! read consumes them and outbound bytes until a flush.

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream},
    net::TcpStream,
};

use crate::{
    ast::{Location, StreamOption},
    error::ConnectionError,
};

/// Bidirectional byte stream usable as a channel.
pub trait ChannelIo: AsyncRead + AsyncWrite + Send + Unpin {
    /// Apply a transport option to a connected channel.
    fn set_option(&mut self, name: &str, value: &str) -> Result<(), ConnectionError> {
        let _ = value;
        Err(ConnectionError::UnsupportedOption { name: name.to_string() })
    }
}

impl ChannelIo for DuplexStream {}

impl ChannelIo for TcpStream {
    fn set_option(&mut self, name: &str, value: &str) -> Result<(), ConnectionError> {
        match name {
            "nodelay" => {
                let enabled = parse_bool(name, value)?;
                self.set_nodelay(enabled).map_err(ConnectionError::from)
            },
            "ttl" => {
                let ttl = value.parse().map_err(|_| invalid(name, value))?;
                self.set_ttl(ttl).map_err(ConnectionError::from)
            },
            _ => Err(ConnectionError::UnsupportedOption { name: name.to_string() }),
        }
    }
}

/// Parse a boolean option value.
pub fn parse_bool(name: &str, value: &str) -> Result<bool, ConnectionError> {
    match value {
        "true" | "on" | "1" => Ok(true),
        "false" | "off" | "0" => Ok(false),
        _ => Err(invalid(name, value)),
    }
}

fn invalid(name: &str, value: &str) -> ConnectionError {
    ConnectionError::InvalidOption { name: name.to_string(), value: value.to_string() }
}

/// Boxed channel stream.
pub type BoxedIo = Box<dyn ChannelIo>;

/// Source of inbound channels for one bound location.
#[async_trait]
pub trait Acceptor: Send {
    /// Wait for the next inbound channel.
    async fn accept(&mut self) -> Result<BoxedIo, ConnectionError>;
}

/// Factory for acceptors and outbound channels.
///
/// Options are opaque to the engine; providers reject the ones they do not
/// understand.
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    /// Bind an acceptor at `location`.
    async fn bind(
        &self,
        location: &Location,
        options: &[StreamOption],
    ) -> Result<Box<dyn Acceptor>, ConnectionError>;

    /// Open a channel to `location`.
    async fn connect(
        &self,
        location: &Location,
        options: &[StreamOption],
    ) -> Result<BoxedIo, ConnectionError>;
}

/// Connected channel with engine-side buffering.
pub struct Channel {
    io: BoxedIo,
    inbound: BytesMut,
    outbound: BytesMut,
    eof: bool,
    output_shutdown: bool,
    closed: bool,
}

impl Channel {
    /// Wrap a connected stream.
    pub fn new(io: BoxedIo) -> Self {
        Self {
            io,
            inbound: BytesMut::with_capacity(4096),
            outbound: BytesMut::new(),
            eof: false,
            output_shutdown: false,
            closed: false,
        }
    }

    /// Received bytes not yet consumed by a read.
    pub fn inbound(&self) -> &[u8] {
        &self.inbound
    }

    /// Drop `n` consumed bytes from the front of the inbound buffer.
    pub fn consume(&mut self, n: usize) {
        let _ = self.inbound.split_to(n.min(self.inbound.len()));
    }

    /// True once the peer closed its output.
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// True once closed locally.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Read more bytes from the transport. Returns the number of bytes read;
    /// zero means end of stream.
    pub async fn fill(&mut self) -> Result<usize, ConnectionError> {
        if self.eof {
            return Ok(0);
        }
        let n = self.io.read_buf(&mut self.inbound).await?;
        if n == 0 {
            self.eof = true;
        }
        Ok(n)
    }

    /// Queue bytes for the next flush.
    pub fn write(&mut self, bytes: &[u8]) {
        self.outbound.extend_from_slice(bytes);
    }

    /// Send queued bytes.
    pub async fn flush(&mut self) -> Result<(), ConnectionError> {
        if !self.outbound.is_empty() {
            let pending = self.outbound.split();
            self.io.write_all(&pending).await?;
        }
        self.io.flush().await?;
        Ok(())
    }

    /// Flush and close the outbound direction.
    pub async fn shutdown_output(&mut self) -> Result<(), ConnectionError> {
        if self.output_shutdown {
            return Ok(());
        }
        self.flush().await?;
        self.io.shutdown().await?;
        self.output_shutdown = true;
        Ok(())
    }

    /// Close locally. Pending output is flushed first.
    pub async fn close(&mut self) -> Result<(), ConnectionError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.shutdown_output().await
    }

    /// Apply a transport option.
    pub fn set_option(&mut self, name: &str, value: &str) -> Result<(), ConnectionError> {
        self.io.set_option(name, value)
    }
}
