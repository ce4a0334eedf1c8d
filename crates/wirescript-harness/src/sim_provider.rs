//! In-memory channel provider.
//!
//! `SimProvider` implements [`ChannelProvider`] over `tokio::io::duplex`
//! pairs. Bound locations live in a shared registry, so scripts and test
//! code can reach each other by location exactly as they would over TCP:
//! a script's accept stream is reached with [`SimProvider::dial`], and a
//! script's connect stream lands on [`SimProvider::listen`].

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use tokio::{
    io::{DuplexStream, duplex},
    sync::mpsc,
};
use tracing::debug;
use wirescript_core::{
    ConnectionError,
    ast::{Location, StreamOption},
    engine::{Acceptor, BoxedIo, ChannelProvider},
};

use crate::journal::{Journal, RecordingIo};

/// Buffer size of each direction of an in-memory channel.
pub const DEFAULT_CAPACITY: usize = 64 * 1024;

#[derive(Default)]
struct Registry {
    listeners: BTreeMap<Location, mpsc::UnboundedSender<DuplexStream>>,
}

/// Shared in-memory network.
#[derive(Clone)]
pub struct SimProvider {
    registry: Arc<Mutex<Registry>>,
    options: Arc<BTreeSet<String>>,
    journal: Option<Journal>,
    capacity: usize,
}

impl Default for SimProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SimProvider {
    /// Empty network that rejects every stream option.
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            options: Arc::new(BTreeSet::new()),
            journal: None,
            capacity: DEFAULT_CAPACITY,
        }
    }

    /// Accept stream options with these names.
    #[must_use]
    pub fn with_options<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options = Arc::new(names.into_iter().map(Into::into).collect());
        self
    }

    /// Record every byte the script sends and receives.
    #[must_use]
    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Per-direction buffer size of new channels.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_options(&self, options: &[StreamOption]) -> Result<(), ConnectionError> {
        match options.iter().find(|option| !self.options.contains(&option.name)) {
            Some(option) => Err(ConnectionError::UnsupportedOption { name: option.name.clone() }),
            None => Ok(()),
        }
    }

    fn register(
        &self,
        location: &Location,
    ) -> Result<mpsc::UnboundedReceiver<DuplexStream>, ConnectionError> {
        let key = location.effective();
        let mut registry = self.registry();
        if registry.listeners.get(&key).is_some_and(|tx| !tx.is_closed()) {
            return Err(ConnectionError::AddressInUse(key.to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        registry.listeners.insert(key, tx);
        Ok(rx)
    }

    /// Open a raw channel to `location`, as a peer of the script would.
    ///
    /// # Errors
    ///
    /// `ConnectionError::Refused` if nothing listens at `location`.
    pub fn dial(&self, location: &Location) -> Result<DuplexStream, ConnectionError> {
        let key = location.effective();
        let registry = self.registry();
        let tx = registry
            .listeners
            .get(&key)
            .ok_or_else(|| ConnectionError::Refused(key.to_string()))?;
        let (near, far) = duplex(self.capacity);
        tx.send(far).map_err(|_| ConnectionError::Refused(key.to_string()))?;
        debug!(location = %key, "dialed");
        Ok(near)
    }

    /// Listen at `location` for channels opened by the script.
    ///
    /// # Errors
    ///
    /// `ConnectionError::AddressInUse` if something already listens there.
    pub fn listen(&self, location: &Location) -> Result<SimListener, ConnectionError> {
        let rx = self.register(location)?;
        Ok(SimListener { rx, location: location.effective() })
    }
}

#[async_trait]
impl ChannelProvider for SimProvider {
    async fn bind(
        &self,
        location: &Location,
        options: &[StreamOption],
    ) -> Result<Box<dyn Acceptor>, ConnectionError> {
        self.check_options(options)?;
        let rx = self.register(location)?;
        debug!(%location, "bound");
        let listener = SimListener { rx, location: location.effective() };
        Ok(Box::new(SimAcceptor { listener, journal: self.journal.clone() }))
    }

    async fn connect(
        &self,
        location: &Location,
        options: &[StreamOption],
    ) -> Result<BoxedIo, ConnectionError> {
        self.check_options(options)?;
        let io = self.dial(location)?;
        Ok(journaled(self.journal.as_ref(), io, location))
    }
}

fn journaled(journal: Option<&Journal>, io: DuplexStream, location: &Location) -> BoxedIo {
    match journal {
        Some(journal) => Box::new(RecordingIo::new(io, location.to_string(), journal.clone())),
        None => Box::new(io),
    }
}

/// Test-side listener for channels opened by a script's connect streams.
pub struct SimListener {
    rx: mpsc::UnboundedReceiver<DuplexStream>,
    location: Location,
}

impl SimListener {
    /// Wait for the next inbound channel.
    ///
    /// # Errors
    ///
    /// `ConnectionError::AcceptorClosed` once the network is dropped.
    pub async fn accept(&mut self) -> Result<DuplexStream, ConnectionError> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| ConnectionError::AcceptorClosed(self.location.to_string()))
    }
}

struct SimAcceptor {
    listener: SimListener,
    journal: Option<Journal>,
}

#[async_trait]
impl Acceptor for SimAcceptor {
    async fn accept(&mut self) -> Result<BoxedIo, ConnectionError> {
        let io = self.listener.accept().await?;
        Ok(journaled(self.journal.as_ref(), io, &self.listener.location))
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    fn location(text: &str) -> Location {
        Location::parse(text).unwrap()
    }

    #[tokio::test]
    async fn connect_without_listener_is_refused() {
        let provider = SimProvider::new();
        let result = provider.connect(&location("tcp://localhost:1"), &[]).await;
        assert!(matches!(result, Err(ConnectionError::Refused(_))));
    }

    #[tokio::test]
    async fn double_bind_is_rejected() {
        let provider = SimProvider::new();
        let _first = provider.bind(&location("tcp://localhost:2"), &[]).await.unwrap();
        let second = provider.bind(&location("tcp://localhost:2"), &[]).await;
        assert!(matches!(second, Err(ConnectionError::AddressInUse(_))));
    }

    #[tokio::test]
    async fn unknown_options_are_rejected() {
        let provider = SimProvider::new().with_options(["window"]);
        let options = [StreamOption { name: "nodelay".to_string(), value: "true".to_string() }];
        let result = provider.bind(&location("tcp://localhost:3"), &options).await;
        assert!(matches!(
            result,
            Err(ConnectionError::UnsupportedOption { name }) if name == "nodelay"
        ));
    }

    #[tokio::test]
    async fn dial_reaches_acceptor() {
        let provider = SimProvider::new();
        let mut acceptor = provider.bind(&location("tcp://localhost:4"), &[]).await.unwrap();

        let mut peer = provider.dial(&location("tcp://localhost:4")).unwrap();
        peer.write_all(b"hi").await.unwrap();

        let mut accepted = acceptor.accept().await.unwrap();
        let mut buf = [0u8; 2];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }
}
