//! Control message type and its text codec.
//!
//! A `ControlMessage` is a kind, an ordered list of headers and optional
//! content. The `content-length` header is never stored in `headers`: it is
//! derived from `content` on encode and stripped on decode, so a decoded
//! message compares equal to the message that produced it.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    MessageKind,
    errors::{ProtocolError, Result},
};

/// Well-known header names.
pub mod headers {
    /// User-visible barrier exposed by a prepared script (PREPARED, NOTIFY,
    /// NOTIFIED)
    pub const BARRIER: &str = "barrier";
    /// Barrier that reached the notified state (FINISHED)
    pub const NOTIFIED: &str = "notified";
    /// Barrier still pending when the run ended (FINISHED)
    pub const AWAITING: &str = "awaiting";
    /// One-line failure summary (ERROR)
    pub const SUMMARY: &str = "summary";
    /// Script name resolved against the robot's script root (PREPARE)
    pub const NAME: &str = "name";
    /// Length of the content section in bytes
    pub const CONTENT_LENGTH: &str = "content-length";
}

/// A single `name:value` header line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Header name (no `:` or newline)
    pub name: String,
    /// Header value (no newline)
    pub value: String,
}

/// Complete control message.
///
/// # Invariants
///
/// - `headers` never contains `content-length`; the codec manages it from
///   `content`.
/// - Header order is preserved through encode/decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    /// Message kind
    pub kind: MessageKind,
    /// Ordered headers
    pub headers: Vec<Header>,
    /// Optional content; `Some(empty)` differs from `None` on the wire
    pub content: Option<Bytes>,
}

impl ControlMessage {
    /// Maximum bytes buffered while searching for the end of a head.
    pub const MAX_HEAD_SIZE: usize = 64 * 1024;

    /// Maximum content size (16 MiB).
    pub const MAX_CONTENT_SIZE: usize = 16 * 1024 * 1024;

    /// Create a message with no headers and no content.
    #[must_use]
    pub fn new(kind: MessageKind) -> Self {
        Self { kind, headers: Vec::new(), content: None }
    }

    /// Append a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(Header { name: name.into(), value: value.into() });
        self
    }

    /// Append one header per value, all with the same name.
    #[must_use]
    pub fn with_headers<I, V>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        for value in values {
            self.headers.push(Header { name: name.to_string(), value: value.into() });
        }
        self
    }

    /// Set the content.
    #[must_use]
    pub fn with_content(mut self, content: impl Into<Bytes>) -> Self {
        self.content = Some(content.into());
        self
    }

    /// PREPARE carrying script text as content.
    #[must_use]
    pub fn prepare(script: impl Into<Bytes>) -> Self {
        Self::new(MessageKind::Prepare).with_content(script)
    }

    /// PREPARE naming scripts under the robot's script root.
    #[must_use]
    pub fn prepare_named<I, V>(names: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        Self::new(MessageKind::Prepare).with_headers(headers::NAME, names)
    }

    /// PREPARED with the user-visible barriers and the script text.
    #[must_use]
    pub fn prepared<I, V>(barriers: I, script: Option<Bytes>) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        let message = Self::new(MessageKind::Prepared).with_headers(headers::BARRIER, barriers);
        match script {
            Some(script) => message.with_content(script),
            None => message,
        }
    }

    /// START request.
    #[must_use]
    pub fn start() -> Self {
        Self::new(MessageKind::Start)
    }

    /// STARTED response.
    #[must_use]
    pub fn started() -> Self {
        Self::new(MessageKind::Started)
    }

    /// ABORT request.
    #[must_use]
    pub fn abort() -> Self {
        Self::new(MessageKind::Abort)
    }

    /// NOTIFY request for one barrier.
    #[must_use]
    pub fn notify(barrier: impl Into<String>) -> Self {
        Self::new(MessageKind::Notify).with_header(headers::BARRIER, barrier)
    }

    /// NOTIFIED event for one barrier.
    #[must_use]
    pub fn notified(barrier: impl Into<String>) -> Self {
        Self::new(MessageKind::Notified).with_header(headers::BARRIER, barrier)
    }

    /// FINISHED with notified and still-awaiting barriers.
    #[must_use]
    pub fn finished<N, A, V, W>(notified: N, awaiting: A, content: Option<Bytes>) -> Self
    where
        N: IntoIterator<Item = V>,
        A: IntoIterator<Item = W>,
        V: Into<String>,
        W: Into<String>,
    {
        let message = Self::new(MessageKind::Finished)
            .with_headers(headers::NOTIFIED, notified)
            .with_headers(headers::AWAITING, awaiting);
        match content {
            Some(content) => message.with_content(content),
            None => message,
        }
    }

    /// ERROR with a summary header and a free-text description.
    #[must_use]
    pub fn error(summary: impl Into<String>, description: impl Into<String>) -> Self {
        let description: String = description.into();
        Self::new(MessageKind::Error)
            .with_header(headers::SUMMARY, summary)
            .with_content(Bytes::from(description))
    }

    /// First value of the named header.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|h| h.name == name).map(|h| h.value.as_str())
    }

    /// All values of the named header, in order.
    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers.iter().filter(move |h| h.name == name).map(|h| h.value.as_str())
    }

    /// Content as UTF-8 text. `None` if absent or not valid UTF-8.
    #[must_use]
    pub fn content_str(&self) -> Option<&str> {
        self.content.as_deref().and_then(|c| std::str::from_utf8(c).ok())
    }

    /// Encode into `dst`.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::InvalidHeader` if a header name is empty or contains
    ///   `:` or a newline, if a value contains a newline, or if a header is
    ///   named `content-length`
    /// - `ProtocolError::ContentTooLarge` if content exceeds
    ///   [`Self::MAX_CONTENT_SIZE`]
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        for header in &self.headers {
            validate_header(header)?;
        }

        if let Some(content) = &self.content {
            if content.len() > Self::MAX_CONTENT_SIZE {
                return Err(ProtocolError::ContentTooLarge {
                    size: content.len(),
                    max: Self::MAX_CONTENT_SIZE,
                });
            }
        }

        dst.put_slice(self.kind.as_str().as_bytes());
        dst.put_u8(b'\n');

        for header in &self.headers {
            dst.put_slice(header.name.as_bytes());
            dst.put_u8(b':');
            dst.put_slice(header.value.as_bytes());
            dst.put_u8(b'\n');
        }

        if let Some(content) = &self.content {
            dst.put_slice(headers::CONTENT_LENGTH.as_bytes());
            dst.put_u8(b':');
            dst.put_slice(content.len().to_string().as_bytes());
            dst.put_u8(b'\n');
        }

        dst.put_u8(b'\n');

        if let Some(content) = &self.content {
            dst.put_slice(content);
        }

        Ok(())
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode one message from the front of `src`.
    ///
    /// Returns `Ok(None)` if `src` does not yet hold a complete message; in
    /// that case nothing is consumed. On success the message bytes are
    /// removed from `src` and trailing bytes are left for the next call.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::HeadTooLarge` if no blank line appears within
    ///   [`Self::MAX_HEAD_SIZE`] bytes
    /// - `ProtocolError::InvalidUtf8` if the head is not UTF-8
    /// - `ProtocolError::MissingKind` / `ProtocolError::UnknownKind` for a bad
    ///   kind line
    /// - `ProtocolError::MalformedHeader` for a header line without `:`
    /// - `ProtocolError::InvalidContentLength` /
    ///   `ProtocolError::ContentTooLarge` for a bad `content-length`
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>> {
        let Some(head_len) = find_head_end(src) else {
            if src.len() > Self::MAX_HEAD_SIZE {
                return Err(ProtocolError::HeadTooLarge {
                    size: src.len(),
                    max: Self::MAX_HEAD_SIZE,
                });
            }
            return Ok(None);
        };

        // head_len covers "<lines>\n\n"; the text excludes the final blank line
        let head =
            std::str::from_utf8(&src[..head_len - 2]).map_err(|_| ProtocolError::InvalidUtf8)?;

        let mut lines = head.split('\n');
        let kind_line = lines.next().unwrap_or_default();
        if kind_line.is_empty() {
            return Err(ProtocolError::MissingKind);
        }
        let kind = MessageKind::from_name(kind_line)
            .ok_or_else(|| ProtocolError::UnknownKind(kind_line.to_string()))?;

        let mut message_headers = Vec::new();
        let mut content_length = None;

        for line in lines {
            let Some((name, value)) = line.split_once(':') else {
                return Err(ProtocolError::MalformedHeader(line.to_string()));
            };
            if name.is_empty() {
                return Err(ProtocolError::MalformedHeader(line.to_string()));
            }

            if name == headers::CONTENT_LENGTH {
                let length: usize = value
                    .parse()
                    .map_err(|_| ProtocolError::InvalidContentLength(value.to_string()))?;
                if length > Self::MAX_CONTENT_SIZE {
                    return Err(ProtocolError::ContentTooLarge {
                        size: length,
                        max: Self::MAX_CONTENT_SIZE,
                    });
                }
                content_length = Some(length);
            } else {
                message_headers.push(Header { name: name.to_string(), value: value.to_string() });
            }
        }

        let total = head_len + content_length.unwrap_or(0);
        if src.len() < total {
            return Ok(None);
        }

        let mut frame = src.split_to(total);
        let content = content_length.map(|_| frame.split_off(head_len).freeze());

        debug_assert_eq!(frame.len(), head_len);

        Ok(Some(Self { kind, headers: message_headers, content }))
    }
}

/// Offset just past the `\n\n` that terminates the head, if buffered.
fn find_head_end(src: &[u8]) -> Option<usize> {
    src.windows(2).position(|w| w == b"\n\n").map(|pos| pos + 2)
}

fn validate_header(header: &Header) -> Result<()> {
    let reason = if header.name.is_empty() {
        Some("empty name")
    } else if header.name.contains(':') || header.name.contains('\n') {
        Some("name contains ':' or newline")
    } else if header.value.contains('\n') {
        Some("value contains newline")
    } else if header.name == headers::CONTENT_LENGTH {
        Some("content-length is derived from content")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(ProtocolError::InvalidHeader { name: header.name.clone(), reason }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(message: &ControlMessage) -> String {
        String::from_utf8(message.to_bytes().unwrap().to_vec()).unwrap()
    }

    #[test]
    fn encode_start_has_empty_head() {
        assert_eq!(wire(&ControlMessage::start()), "START\n\n");
    }

    #[test]
    fn encode_prepared_lists_barriers() {
        let message = ControlMessage::prepared(["b1", "b2"], Some(Bytes::from_static(b"accept")));
        assert_eq!(wire(&message), "PREPARED\nbarrier:b1\nbarrier:b2\ncontent-length:6\n\naccept");
    }

    #[test]
    fn absent_and_empty_content_differ() {
        let absent = ControlMessage::new(MessageKind::Finished);
        let empty = ControlMessage::new(MessageKind::Finished).with_content(Bytes::new());

        assert_eq!(wire(&absent), "FINISHED\n\n");
        assert_eq!(wire(&empty), "FINISHED\ncontent-length:0\n\n");

        let mut buf = BytesMut::from(wire(&empty).as_bytes());
        let decoded = ControlMessage::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.content, Some(Bytes::new()));

        let mut buf = BytesMut::from(wire(&absent).as_bytes());
        let decoded = ControlMessage::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.content, None);
    }

    #[test]
    fn decode_waits_for_complete_message() {
        let bytes = ControlMessage::error("boom", "details").to_bytes().unwrap();

        for split in 0..bytes.len() {
            let mut buf = BytesMut::from(&bytes[..split]);
            assert_eq!(ControlMessage::decode(&mut buf).unwrap(), None);
            assert_eq!(buf.len(), split, "partial input must not be consumed");
        }
    }

    #[test]
    fn decode_leaves_trailing_bytes() {
        let mut buf = BytesMut::new();
        ControlMessage::start().encode(&mut buf).unwrap();
        ControlMessage::abort().encode(&mut buf).unwrap();

        let first = ControlMessage::decode(&mut buf).unwrap().unwrap();
        let second = ControlMessage::decode(&mut buf).unwrap().unwrap();

        assert_eq!(first.kind, MessageKind::Start);
        assert_eq!(second.kind, MessageKind::Abort);
        assert!(buf.is_empty());
    }

    #[test]
    fn header_value_may_contain_colon() {
        let message = ControlMessage::new(MessageKind::Prepare).with_header("name", "a:b");
        let mut buf = BytesMut::from(wire(&message).as_bytes());
        let decoded = ControlMessage::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.header("name"), Some("a:b"));
    }

    #[test]
    fn reject_unknown_kind() {
        let mut buf = BytesMut::from(&b"AWAIT\nbarrier:b1\n\n"[..]);
        assert_eq!(
            ControlMessage::decode(&mut buf),
            Err(ProtocolError::UnknownKind("AWAIT".to_string()))
        );
    }

    #[test]
    fn reject_header_without_separator() {
        let mut buf = BytesMut::from(&b"NOTIFY\nbarrier\n\n"[..]);
        assert!(matches!(
            ControlMessage::decode(&mut buf),
            Err(ProtocolError::MalformedHeader(_))
        ));
    }

    #[test]
    fn reject_bad_content_length() {
        let mut buf = BytesMut::from(&b"PREPARE\ncontent-length:abc\n\n"[..]);
        assert!(matches!(
            ControlMessage::decode(&mut buf),
            Err(ProtocolError::InvalidContentLength(_))
        ));

        let mut buf = BytesMut::from(&b"PREPARE\ncontent-length:999999999999\n\n"[..]);
        assert!(matches!(
            ControlMessage::decode(&mut buf),
            Err(ProtocolError::ContentTooLarge { .. })
        ));
    }

    #[test]
    fn reject_empty_kind_line() {
        let mut buf = BytesMut::from(&b"\n\n"[..]);
        assert_eq!(ControlMessage::decode(&mut buf), Err(ProtocolError::MissingKind));
    }

    #[test]
    fn reject_oversized_head() {
        let mut buf = BytesMut::from(vec![b'A'; ControlMessage::MAX_HEAD_SIZE + 1].as_slice());
        assert!(matches!(
            ControlMessage::decode(&mut buf),
            Err(ProtocolError::HeadTooLarge { .. })
        ));
    }

    #[test]
    fn encode_rejects_unencodable_headers() {
        let newline = ControlMessage::notify("b1\nSTART");
        assert!(matches!(newline.to_bytes(), Err(ProtocolError::InvalidHeader { .. })));

        let manual_length = ControlMessage::start().with_header("content-length", "3");
        assert!(matches!(manual_length.to_bytes(), Err(ProtocolError::InvalidHeader { .. })));
    }
}
