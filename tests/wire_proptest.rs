//! Property tests for the header codec.

use bytes::BytesMut;
use proptest::prelude::*;
use trellis::constants::{HEADER_LEN, MAX_FRAME_LEN};
use trellis::{Header, Op, Tag, WireError};

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![Just(Op::Command), Just(Op::Request), Just(Op::Response)]
}

fn arb_tag() -> impl Strategy<Value = Tag> {
    prop_oneof![
        Just(Tag::Ping),
        Just(Tag::Hello),
        Just(Tag::FindNode),
        Just(Tag::PushTransaction),
        Just(Tag::PullTransaction),
        Just(Tag::PullBlock),
    ]
}

proptest! {
    #[test]
    fn every_valid_header_round_trips(
        len in 0..=MAX_FRAME_LEN,
        nonce in any::<u32>(),
        op in arb_op(),
        tag in arb_tag(),
    ) {
        let header = Header { len, nonce, op, tag };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        prop_assert_eq!(buf.len(), HEADER_LEN);
        let decoded = Header::decode(&mut buf).unwrap();
        prop_assert_eq!(decoded, header);
        prop_assert_eq!(buf.len(), 0);
    }

    #[test]
    fn every_oversize_length_is_rejected(
        len in MAX_FRAME_LEN + 1..=u32::MAX,
        nonce in any::<u32>(),
        op in arb_op(),
        tag in arb_tag(),
    ) {
        let header = Header { len, nonce, op, tag };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        prop_assert_eq!(
            Header::decode(&mut buf),
            Err(WireError::FrameTooLarge { len })
        );
    }
}
