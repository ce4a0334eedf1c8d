//! # wirescript control protocol: wire format
//!
//! This crate implements the text framing used between an external test
//! controller and a wirescript robot. A controller prepares a script, starts
//! it, notifies barriers, and receives the result; the robot answers with
//! `PREPARED`, `STARTED`, `NOTIFIED`, `FINISHED` or `ERROR`.
//!
//! ## Wire Format
//!
//! ```text
//! <KIND>\n
//! <header-name>:<header-value>\n      (zero or more)
//! \n
//! <content bytes>                     (only when content-length is present)
//! ```
//!
//! Absent content and empty content are distinct: the former has no
//! `content-length` header, the latter carries `content-length:0`.
//!
//! ## Implementation Notes
//!
//! - **Incremental decoding**: [`ControlMessage::decode`] consumes from a
//!   `BytesMut` and returns `Ok(None)` until a full message is buffered, so
//!   the same codec serves socket readers and in-memory tests.
//! - **Bounded buffering**: message heads are capped at
//!   [`ControlMessage::MAX_HEAD_SIZE`] and content at
//!   [`ControlMessage::MAX_CONTENT_SIZE`]; larger inputs are rejected before
//!   any allocation for the content.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod errors;
pub mod kind;
pub mod message;

pub use errors::{ProtocolError, Result};
pub use kind::MessageKind;
pub use message::{ControlMessage, Header, headers};
