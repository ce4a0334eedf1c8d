//! TCP channel provider.
//!
//! Serves `tcp` and `http` locations. Http framing happens in the script
//! passes, so both schemes are plain byte streams here. Supported options
//! are `nodelay` and `ttl`, applied to every channel.

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;
use wirescript_core::{
    ConnectionError,
    ast::{Location, StreamOption},
    engine::{Acceptor, BoxedIo, ChannelIo, ChannelProvider, parse_bool},
};

const SUPPORTED_SCHEMES: [&str; 2] = ["tcp", "http"];

/// Channel provider over real TCP sockets.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProvider;

impl TcpProvider {
    /// New provider.
    pub fn new() -> Self {
        Self
    }
}

/// `host:port` to bind or dial for `location`.
///
/// # Errors
///
/// `ConnectionError::UnsupportedScheme` for schemes other than `tcp` and
/// `http`.
pub fn socket_address(location: &Location) -> Result<String, ConnectionError> {
    let scheme = location.scheme.to_ascii_lowercase();
    if !SUPPORTED_SCHEMES.contains(&scheme.as_str()) {
        return Err(ConnectionError::UnsupportedScheme(location.scheme.clone()));
    }
    if location.host() == location.authority && scheme == "http" {
        return Ok(format!("{}:80", location.authority));
    }
    Ok(location.authority.clone())
}

fn validate(options: &[StreamOption]) -> Result<(), ConnectionError> {
    for option in options {
        match option.name.as_str() {
            "nodelay" => {
                parse_bool(&option.name, &option.value)?;
            },
            "ttl" => {
                option.value.parse::<u32>().map_err(|_| ConnectionError::InvalidOption {
                    name: option.name.clone(),
                    value: option.value.clone(),
                })?;
            },
            _ => return Err(ConnectionError::UnsupportedOption { name: option.name.clone() }),
        }
    }
    Ok(())
}

fn configure(mut stream: TcpStream, options: &[StreamOption]) -> Result<BoxedIo, ConnectionError> {
    for option in options {
        stream.set_option(&option.name, &option.value)?;
    }
    Ok(Box::new(stream))
}

#[async_trait]
impl ChannelProvider for TcpProvider {
    async fn bind(
        &self,
        location: &Location,
        options: &[StreamOption],
    ) -> Result<Box<dyn Acceptor>, ConnectionError> {
        let address = socket_address(location)?;
        validate(options)?;
        let listener = TcpListener::bind(&address).await.map_err(|err| match err.kind() {
            std::io::ErrorKind::AddrInUse => ConnectionError::AddressInUse(address.clone()),
            _ => ConnectionError::from(err),
        })?;
        debug!(%address, "tcp acceptor bound");
        Ok(Box::new(TcpAcceptor { listener, options: options.to_vec() }))
    }

    async fn connect(
        &self,
        location: &Location,
        options: &[StreamOption],
    ) -> Result<BoxedIo, ConnectionError> {
        let address = socket_address(location)?;
        validate(options)?;
        let stream = TcpStream::connect(&address).await.map_err(|err| match err.kind() {
            std::io::ErrorKind::ConnectionRefused => ConnectionError::Refused(address.clone()),
            _ => ConnectionError::from(err),
        })?;
        debug!(%address, "tcp channel connected");
        configure(stream, options)
    }
}

struct TcpAcceptor {
    listener: TcpListener,
    options: Vec<StreamOption>,
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&mut self) -> Result<BoxedIo, ConnectionError> {
        let (stream, peer) = self.listener.accept().await?;
        debug!(%peer, "tcp channel accepted");
        configure(stream, &self.options)
    }
}
