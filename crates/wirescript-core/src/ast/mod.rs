//! Immutable script model.
//!
//! A [`Script`] is a list of property bindings and a list of streams. Each
//! [`Stream`] is an ordered list of [`Operation`]s. Every transformation pass
//! consumes a `Script` and produces a new one; nothing here is mutated once a
//! run is prepared.
//!
//! Operation and matcher kinds are closed enums. Passes and the engine match
//! on them exhaustively, so adding a variant is a compile error everywhere it
//! needs handling.

mod render;

use std::{collections::BTreeSet, fmt};

use bytes::Bytes;

pub use self::render::{render_bytes, render_explicit};

/// Barrier names starting with this character are synthesized by the passes
/// and never reported to the controller.
pub const INTERNAL_PREFIX: char = '~';

/// True if `name` is a synthesized barrier name.
pub fn is_internal(name: &str) -> bool {
    name.starts_with(INTERNAL_PREFIX)
}

/// Source position of a construct. Synthesized constructs inherit the region
/// of the construct that caused them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Region {
    /// 1-based line
    pub line: u32,
    /// 1-based column
    pub column: u32,
}

impl Region {
    /// Create a region.
    pub const fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Which side of a connection a stream plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Listen at the location and take one inbound channel
    Accept,
    /// Open a channel to the location
    Connect,
}

impl Role {
    /// Keyword used in script text.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Connect => "connect",
        }
    }
}

/// Transport address: `scheme://authority/path`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Location {
    /// Transport scheme (`tcp`, `http`, ...)
    pub scheme: String,
    /// `host:port`
    pub authority: String,
    /// Path, possibly empty
    pub path: String,
}

impl Location {
    /// Parse `scheme://authority[/path]`. `None` if the text has no scheme
    /// separator or an empty authority.
    pub fn parse(text: &str) -> Option<Self> {
        let (scheme, rest) = text.split_once("://")?;
        let valid = |c: char| c.is_ascii_alphanumeric() || c == '+' || c == '-';
        if scheme.is_empty() || !scheme.chars().all(valid) {
            return None;
        }

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };
        if authority.is_empty() {
            return None;
        }

        Some(Self {
            scheme: scheme.to_string(),
            authority: authority.to_string(),
            path: path.to_string(),
        })
    }

    /// Normalized form used to compare locations: scheme and authority are
    /// lowercased and an empty path becomes `/`.
    pub fn effective(&self) -> Self {
        Self {
            scheme: self.scheme.to_ascii_lowercase(),
            authority: self.authority.to_ascii_lowercase(),
            path: if self.path.is_empty() { "/".to_string() } else { self.path.clone() },
        }
    }

    /// Host part of the authority, without the port.
    pub fn host(&self) -> &str {
        match self.authority.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
            _ => &self.authority,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}{}", self.scheme, self.authority, self.path)
    }
}

/// Shared tag stamped on an accept stream and the connect stream paired
/// with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AssociationId(pub u32);

impl fmt::Display for AssociationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Opaque transport option. Interpreted by the channel provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamOption {
    /// Option name
    pub name: String,
    /// Option value as written
    pub value: String,
}

/// Top-level `property name value` binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    /// Variable name
    pub name: String,
    /// Bound value
    pub value: Bytes,
    /// Declaration
    pub region: Region,
}

/// One accept or connect stream and its operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stream {
    /// Accept or connect
    pub role: Role,
    /// Address to bind or dial
    pub location: Location,
    /// For accept streams, the name other streams use to refer to it
    /// (`as NAME`). For connect streams, the accept stream it must pair
    /// with (`peer NAME`).
    pub accept_peer: Option<String>,
    /// Transport options declared on the stream line
    pub options: Vec<StreamOption>,
    /// Ordered operations
    pub operations: Vec<Operation>,
    /// Stream declaration
    pub region: Region,
    /// Set by stream association
    pub association: Option<AssociationId>,
}

impl Stream {
    /// New stream with no operations.
    pub fn new(role: Role, location: Location, region: Region) -> Self {
        Self {
            role,
            location,
            accept_peer: None,
            options: Vec::new(),
            operations: Vec::new(),
            region,
            association: None,
        }
    }

    /// Short label used in logs and outcome reports.
    pub fn label(&self) -> String {
        format!("{} {} ({})", self.role.as_str(), self.location, self.region)
    }

    /// True if the stream's transport is http-framed.
    pub fn is_http(&self) -> bool {
        self.location.scheme.eq_ignore_ascii_case("http")
    }
}

/// One step of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    /// What the step does
    pub kind: OperationKind,
    /// Source position (inherited for synthesized steps)
    pub region: Region,
    /// True if a pass synthesized this step
    pub implicit: bool,
}

impl Operation {
    /// Operation written in the script.
    pub fn new(kind: OperationKind, region: Region) -> Self {
        Self { kind, region, implicit: false }
    }

    /// Operation synthesized by a pass.
    pub fn implicit(kind: OperationKind, region: Region) -> Self {
        Self { kind, region, implicit: true }
    }
}

/// Closed set of operation kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationKind {
    /// Read inbound bytes matching every matcher in sequence
    ReadEvent(Vec<Matcher>),
    /// Write the concatenated output of every generator
    WriteCommand(Vec<ValueGenerator>),
    /// Transport option applied at this point of the stream
    OptionConfig {
        /// Option name
        name: String,
        /// Option value
        value: String,
    },
    /// Wait until the barrier is notified
    BarrierAwait(String),
    /// Notify the barrier
    BarrierNotify(String),
    /// Close the channel locally
    Close,
    /// Half-close: no more writes on this channel
    WriteClose,
    /// Push buffered writes to the transport
    Flush,
    /// Send an out-of-band advisory to the associated peer
    Advise {
        /// Advisory name
        name: String,
        /// Payload generators
        values: Vec<ValueGenerator>,
    },
    /// Wait for an out-of-band advisory from the associated peer
    Advised {
        /// Advisory name
        name: String,
        /// Payload matchers
        matchers: Vec<Matcher>,
    },
    /// Expected framed-protocol metadata on the inbound side
    ReadConfig(HttpConfig),
    /// Framed-protocol metadata to emit on the outbound side
    WriteConfig(HttpConfig),
    /// Channel object exists
    Opened,
    /// Acceptor bound
    Bound,
    /// Channel connected
    Connected,
    /// Channel fully closed
    Closed,
    /// Peer disconnected
    Disconnected,
}

impl OperationKind {
    /// Barrier name for await/notify operations.
    pub fn barrier(&self) -> Option<&str> {
        match self {
            Self::BarrierAwait(name) | Self::BarrierNotify(name) => Some(name),
            _ => None,
        }
    }

    /// Writes that produce outbound bytes.
    pub fn is_write(&self) -> bool {
        matches!(self, Self::WriteCommand(_) | Self::WriteConfig(_))
    }

    /// Operations that end a stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Disconnected)
    }

    /// Keyword naming this kind in logs and diagnostics.
    pub fn keyword(&self) -> &'static str {
        match self {
            Self::ReadEvent(_) => "read",
            Self::WriteCommand(_) => "write",
            Self::OptionConfig { .. } => "option",
            Self::BarrierAwait(_) => "await",
            Self::BarrierNotify(_) => "notify",
            Self::Close => "close",
            Self::WriteClose => "write close",
            Self::Flush => "flush",
            Self::Advise { .. } => "advise",
            Self::Advised { .. } => "advised",
            Self::ReadConfig(_) => "read config",
            Self::WriteConfig(_) => "write config",
            Self::Opened => "opened",
            Self::Bound => "bound",
            Self::Connected => "connected",
            Self::Closed => "closed",
            Self::Disconnected => "disconnected",
        }
    }
}

/// Framed-protocol metadata for http streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpConfig {
    /// Request method
    Method(String),
    /// Protocol version (`HTTP/1.1`)
    Version(String),
    /// Header line
    Header {
        /// Header name
        name: String,
        /// Header value
        value: String,
    },
    /// Response status
    Status {
        /// Status code
        code: u16,
        /// Reason phrase
        reason: String,
    },
}

/// Width of a big-endian integer matcher or generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntWidth {
    /// 1 byte
    Byte,
    /// 2 bytes
    Short,
    /// 4 bytes
    Int,
    /// 8 bytes
    Long,
}

impl IntWidth {
    /// Encoded size in bytes.
    pub fn size(self) -> usize {
        match self {
            Self::Byte => 1,
            Self::Short => 2,
            Self::Int => 4,
            Self::Long => 8,
        }
    }

    /// Keyword used in script text.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Byte => "byte",
            Self::Short => "short",
            Self::Int => "int",
            Self::Long => "long",
        }
    }

    /// Parse a width keyword.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "byte" => Some(Self::Byte),
            "short" => Some(Self::Short),
            "int" => Some(Self::Int),
            "long" => Some(Self::Long),
            _ => None,
        }
    }

    /// Big-endian encoding of `value`, truncated to this width.
    pub fn encode(self, value: i64) -> Bytes {
        let full = value.to_be_bytes();
        Bytes::copy_from_slice(&full[full.len() - self.size()..])
    }

    /// Literal `value` as stored in the model, or `None` if it fits neither
    /// the signed nor the unsigned range of this width. Values above the
    /// signed range keep their unsigned bit pattern.
    pub fn literal(self, value: i128) -> Option<i64> {
        let bits = 8 * self.size() as u32;
        let min = -(1i128 << (bits - 1));
        let max = (1i128 << bits) - 1;
        if !(min..=max).contains(&value) {
            return None;
        }
        i64::try_from(value).ok().or_else(|| u64::try_from(value).ok().map(|v| v as i64))
    }

    /// Whether `bytes` read as either a signed or an unsigned integer equal
    /// `expected`.
    pub fn matches(self, bytes: &[u8], expected: i64) -> bool {
        self.decode(bytes) == expected
            || i128::from(self.decode_unsigned(bytes)) == i128::from(expected)
    }

    /// Unsigned value of `bytes` (exactly `self.size()` long).
    pub fn decode_unsigned(self, bytes: &[u8]) -> u64 {
        let size = self.size();
        let mut buf = [0u8; 8];
        buf[8 - size..].copy_from_slice(&bytes[..size]);
        u64::from_be_bytes(buf)
    }

    /// Signed value of `bytes` (exactly `self.size()` long).
    pub fn decode(self, bytes: &[u8]) -> i64 {
        match self {
            Self::Byte => i64::from(bytes[0] as i8),
            Self::Short => i64::from(i16::from_be_bytes([bytes[0], bytes[1]])),
            Self::Int => i64::from(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
            Self::Long => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes[..8]);
                i64::from_be_bytes(buf)
            },
        }
    }
}

/// Pattern over inbound bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matcher {
    /// These exact bytes
    Exact(Bytes),
    /// Bytes equal to a bound variable
    Variable(String),
    /// Any `len` bytes, optionally captured into a variable
    Fixed {
        /// Byte count
        len: usize,
        /// Variable to bind
        capture: Option<String>,
    },
    /// Big-endian integer, optionally checked or captured
    Integer {
        /// Encoded width
        width: IntWidth,
        /// Required value
        expected: Option<i64>,
        /// Variable to bind (encoded bytes)
        capture: Option<String>,
    },
    /// CRLF-delimited head block ending in a blank line
    HttpHead {
        /// Required first line, if any
        start_line: Option<String>,
        /// Required headers; names compare case-insensitively
        headers: Vec<(String, String)>,
    },
}

/// Producer of outbound bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueGenerator {
    /// These exact bytes
    Literal(Bytes),
    /// Current value of a variable
    Variable(String),
    /// Big-endian integer
    Integer {
        /// Encoded width
        width: IntWidth,
        /// Value
        value: i64,
    },
}

impl ValueGenerator {
    /// Encoded length if known without a variable table.
    pub fn static_len(&self) -> Option<usize> {
        match self {
            Self::Literal(bytes) => Some(bytes.len()),
            Self::Variable(_) => None,
            Self::Integer { width, .. } => Some(width.size()),
        }
    }
}

/// A parsed or resolved script.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Script {
    /// Property bindings, in declaration order
    pub properties: Vec<Property>,
    /// Streams, in declaration order
    pub streams: Vec<Stream>,
}

impl Script {
    /// Every barrier name awaited or notified anywhere, sorted.
    pub fn barrier_names(&self) -> BTreeSet<String> {
        self.streams
            .iter()
            .flat_map(|s| s.operations.iter())
            .filter_map(|op| op.kind.barrier())
            .map(str::to_string)
            .collect()
    }

    /// Barrier names reported to the controller, sorted.
    pub fn user_barriers(&self) -> Vec<String> {
        self.barrier_names().into_iter().filter(|name| !is_internal(name)).collect()
    }
}
