//! Fault-injecting channel provider.
//!
//! Every channel a [`FaultyProvider`] hands out panics on its first write.
//! Reads see end of stream and shutdown succeeds, so the only fault a script
//! observes is the panic inside the handler that flushes.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use wirescript_core::{
    ConnectionError,
    ast::{Location, StreamOption},
    engine::{Acceptor, BoxedIo, ChannelIo, ChannelProvider},
};

/// Provider whose channels panic on write.
#[derive(Debug, Clone, Copy, Default)]
pub struct FaultyProvider;

#[async_trait]
impl ChannelProvider for FaultyProvider {
    async fn bind(
        &self,
        _location: &Location,
        _options: &[StreamOption],
    ) -> Result<Box<dyn Acceptor>, ConnectionError> {
        Ok(Box::new(FaultyAcceptor))
    }

    async fn connect(
        &self,
        _location: &Location,
        _options: &[StreamOption],
    ) -> Result<BoxedIo, ConnectionError> {
        Ok(Box::new(PanickingIo))
    }
}

struct FaultyAcceptor;

#[async_trait]
impl Acceptor for FaultyAcceptor {
    async fn accept(&mut self) -> Result<BoxedIo, ConnectionError> {
        Ok(Box::new(PanickingIo))
    }
}

/// Channel that panics when written to.
#[derive(Debug)]
pub struct PanickingIo;

impl AsyncRead for PanickingIo {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for PanickingIo {
    #[allow(clippy::panic)]
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        panic!("channel exploded writing {} bytes", buf.len());
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl ChannelIo for PanickingIo {}
