//! Fuzz target for ControlMessage::decode
//!
//! Feeds arbitrary bytes to the incremental decoder to find:
//! - Parser crashes or panics
//! - Content-length arithmetic overflows
//! - Partial messages that are consumed instead of left in the buffer
//!
//! The decoder should NEVER panic. Invalid input returns an error; an
//! incomplete message returns `None` and leaves the buffer untouched.

#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use wirescript_proto::ControlMessage;

fuzz_target!(|data: &[u8]| {
    let mut buf = BytesMut::from(data);
    loop {
        let before = buf.len();
        match ControlMessage::decode(&mut buf) {
            Ok(Some(message)) => {
                assert!(buf.len() < before, "decoded message consumed nothing");
                let encoded = message.to_bytes().expect("decoded message must re-encode");
                let mut again = BytesMut::from(&encoded[..]);
                let decoded =
                    ControlMessage::decode(&mut again).expect("re-encoded message must decode");
                assert_eq!(decoded, Some(message));
            },
            Ok(None) => {
                assert_eq!(buf.len(), before, "incomplete message consumed input");
                break;
            },
            Err(_) => break,
        }
    }
});
