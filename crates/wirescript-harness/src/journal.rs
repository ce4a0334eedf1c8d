//! Event journal for ordering assertions.
//!
//! `RecordingIo` wraps a channel and appends every chunk it reads or writes
//! to a shared [`Journal`]. [`Journal::watch_barriers`] adds an entry each
//! time a run's barrier is notified. Every entry is stamped with a logical
//! clock taken under the journal lock, so entries from different streams
//! are totally ordered by when they happened.

use std::{
    io,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    task::{Context, Poll},
};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use wirescript_core::{RunHandle, engine::ChannelIo};

/// Direction of a journaled chunk, seen from the script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Bytes the script received
    Inbound,
    /// Bytes the script sent
    Outbound,
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A chunk crossed a channel
    Io {
        /// Location of the channel
        location: String,
        /// Which way the bytes went
        direction: Direction,
        /// The bytes
        bytes: Bytes,
    },
    /// A barrier reached the notified state
    Notified(String),
}

/// One journaled event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Logical time; strictly increasing across the journal
    pub clock: u64,
    /// The event
    pub event: Event,
}

/// Shared, append-only record of script I/O and barrier notifications.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<Entry>>>,
}

impl Journal {
    /// Empty journal.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, event: Event) {
        let mut entries = self.lock();
        let clock = entries.len() as u64;
        entries.push(Entry { clock, event });
    }

    fn record(&self, location: &str, direction: Direction, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.push(Event::Io {
            location: location.to_string(),
            direction,
            bytes: Bytes::copy_from_slice(bytes),
        });
    }

    /// Record a barrier notification.
    pub fn record_notified(&self, barrier: &str) {
        self.push(Event::Notified(barrier.to_string()));
    }

    /// Record every user-visible barrier of `run` when it is notified.
    pub fn watch_barriers(&self, run: &RunHandle) {
        for name in run.user_barriers() {
            let Some(barrier) = run.barrier(&name) else {
                continue;
            };
            let journal = self.clone();
            barrier.add_listener(move |outcome| {
                if outcome.is_ok() {
                    journal.record_notified(&name);
                }
            });
        }
    }

    /// Snapshot of every entry so far.
    pub fn entries(&self) -> Vec<Entry> {
        self.lock().clone()
    }

    /// Concatenated outbound bytes, in send order.
    pub fn outbound(&self) -> Vec<u8> {
        self.lock()
            .iter()
            .filter_map(|e| match &e.event {
                Event::Io { direction: Direction::Outbound, bytes, .. } => Some(bytes.clone()),
                _ => None,
            })
            .flat_map(|bytes| bytes.to_vec())
            .collect()
    }

    /// Clock of the first chunk in `direction` whose bytes contain `needle`.
    pub fn position(&self, direction: Direction, needle: &[u8]) -> Option<u64> {
        self.lock().iter().find_map(|e| match &e.event {
            Event::Io { direction: d, bytes, .. }
                if *d == direction
                    && (needle.is_empty() || bytes.windows(needle.len()).any(|w| w == needle)) =>
            {
                Some(e.clock)
            },
            _ => None,
        })
    }

    /// Clock at which `barrier` was notified.
    pub fn notified_at(&self, barrier: &str) -> Option<u64> {
        self.lock().iter().find_map(|e| match &e.event {
            Event::Notified(name) if name == barrier => Some(e.clock),
            _ => None,
        })
    }

    /// Clocks of every chunk sent by the script on `location`.
    pub fn sent_on(&self, location: &str) -> Vec<u64> {
        self.lock()
            .iter()
            .filter_map(|e| match &e.event {
                Event::Io { location: l, direction: Direction::Outbound, .. } if l == location => {
                    Some(e.clock)
                },
                _ => None,
            })
            .collect()
    }
}

/// Channel wrapper that journals every chunk.
#[derive(Debug)]
pub struct RecordingIo {
    inner: DuplexStream,
    location: String,
    journal: Journal,
}

impl RecordingIo {
    /// Wrap `inner`, recording under `location`.
    pub fn new(inner: DuplexStream, location: String, journal: Journal) -> Self {
        Self { inner, location, journal }
    }
}

impl AsyncRead for RecordingIo {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let polled = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &polled {
            self.journal.record(&self.location, Direction::Inbound, &buf.filled()[before..]);
        }
        polled
    }
}

impl AsyncWrite for RecordingIo {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let polled = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &polled {
            self.journal.record(&self.location, Direction::Outbound, &buf[..*n]);
        }
        polled
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl ChannelIo for RecordingIo {}
