//! Property-based tests for control message encoding/decoding.
//!
//! These verify that every encodable message survives the codec unchanged and
//! that the decoder never consumes a partial message.

use bytes::{Bytes, BytesMut};
use proptest::prelude::*;
use wirescript_proto::{ControlMessage, Header, MessageKind, headers};

/// Strategy for generating arbitrary kinds
fn arbitrary_kind() -> impl Strategy<Value = MessageKind> {
    prop::sample::select(MessageKind::ALL.to_vec())
}

/// Strategy for header names the format can carry
fn arbitrary_header() -> impl Strategy<Value = Header> {
    ("[a-z][a-z0-9-]{0,12}", "[ -~]{0,24}")
        .prop_filter("content-length is reserved", |(name, _)| name != headers::CONTENT_LENGTH)
        .prop_map(|(name, value)| Header { name, value })
}

/// Strategy for generating arbitrary messages
fn arbitrary_message() -> impl Strategy<Value = ControlMessage> {
    (
        arbitrary_kind(),
        prop::collection::vec(arbitrary_header(), 0..6),
        prop::option::of(prop::collection::vec(any::<u8>(), 0..256)),
    )
        .prop_map(|(kind, headers, content)| ControlMessage {
            kind,
            headers,
            content: content.map(Bytes::from),
        })
}

#[test]
fn finished_round_trip_preserves_barriers_and_content() {
    let message =
        ControlMessage::finished(["b1", "b2"], ["b3"], Some(Bytes::from_static(b"done")));

    let mut buf = BytesMut::new();
    message.encode(&mut buf).expect("encode should succeed");

    let decoded = ControlMessage::decode(&mut buf).expect("decode should succeed");
    let decoded = decoded.expect("message should be complete");

    assert_eq!(decoded, message);
    assert_eq!(decoded.header_values(headers::NOTIFIED).collect::<Vec<_>>(), vec!["b1", "b2"]);
    assert_eq!(decoded.header_values(headers::AWAITING).collect::<Vec<_>>(), vec!["b3"]);
    assert_eq!(decoded.content_str(), Some("done"));
    assert!(buf.is_empty());
}

proptest! {
    #[test]
    fn prop_message_encode_decode_roundtrip(message in arbitrary_message()) {
        let mut buf = BytesMut::new();
        message.encode(&mut buf).expect("encode should succeed");

        let decoded = ControlMessage::decode(&mut buf).expect("decode should succeed");
        prop_assert_eq!(decoded, Some(message));
        prop_assert!(buf.is_empty());
    }

    #[test]
    fn prop_decode_never_consumes_partial_input(
        message in arbitrary_message(),
        cut in 0usize..512,
    ) {
        let bytes = message.to_bytes().expect("encode should succeed");
        let cut = cut % bytes.len();

        let mut buf = BytesMut::from(&bytes[..cut]);
        prop_assert_eq!(ControlMessage::decode(&mut buf), Ok(None));
        prop_assert_eq!(buf.len(), cut);
    }

    #[test]
    fn prop_decode_arbitrary_bytes_never_panics(
        bytes in prop::collection::vec(any::<u8>(), 0..512),
    ) {
        let mut buf = BytesMut::from(bytes.as_slice());
        let _ = ControlMessage::decode(&mut buf);
    }
}
