//! Deterministic test harness for wirescript.
//!
//! [`SimProvider`] is an in-memory [`ChannelProvider`] built on
//! `tokio::io::duplex`, so scripts run end to end without sockets. Test code
//! plays the implementation under test through [`SimProvider::dial`] and
//! [`SimProvider::listen`] and the helpers in [`peer`]. A [`Journal`]
//! records every byte the script exchanges and every barrier notification
//! on one logical clock, for assertions about cross-stream ordering.
//! [`FaultyProvider`] hands out channels that panic on write.
//!
//! [`ChannelProvider`]: wirescript_core::engine::ChannelProvider

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod faulty;
pub mod journal;
pub mod peer;
pub mod sim_provider;

pub use faulty::FaultyProvider;
pub use journal::{Direction, Entry, Event, Journal, RecordingIo};
pub use sim_provider::{DEFAULT_CAPACITY, SimListener, SimProvider};
