//! Property-Based Tests for the Wire Codec
//!
//! # Test Properties
//!
//! 1. **Roundtrip**: unpack(pack(lens, contents)) reproduces every buffer
//! 2. **Byte Order**: the same holds when the sender's byte order differs
//! 3. **Truncation**: any shorter receive is rejected, never read past

#![cfg(test)]

use bytes::BytesMut;
use proptest::prelude::*;

use super::{MsgFormat, WireMessage, BODY_SIZE};
use crate::error::Error;

// =============================================================================
// Property Strategies
// =============================================================================

fn format_strategy() -> impl Strategy<Value = MsgFormat> {
    prop_oneof![Just(MsgFormat::SelfDescribing), Just(MsgFormat::Legacy)]
}

/// Contents of buffers 1..n (buffer 0 is the body).
fn payload_strategy() -> impl Strategy<Value = Vec<Vec<u8>>> {
    prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 0..6)
}

fn pack(format: MsgFormat, payloads: &[Vec<u8>], transno: u64, opc: u32) -> WireMessage {
    let mut lens = vec![BODY_SIZE as u32];
    lens.extend(payloads.iter().map(|p| p.len() as u32));
    let mut contents: Vec<&[u8]> = vec![&[]];
    contents.extend(payloads.iter().map(|p| p.as_slice()));

    let mut msg = WireMessage::pack(format, &lens, &contents);
    msg.set_transno(transno);
    msg.set_opc(opc);
    msg
}

// =============================================================================
// Roundtrip Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: every buffer and typed field survives pack then unpack.
    #[test]
    fn prop_roundtrip(
        format in format_strategy(),
        payloads in payload_strategy(),
        transno in any::<u64>(),
        opc in any::<u32>(),
        swab in any::<bool>(),
    ) {
        let msg = pack(format, &payloads, transno, opc);
        let wire = if swab { msg.to_swabbed() } else { BytesMut::from(msg.as_bytes()) };
        let len = wire.len();

        let got = WireMessage::unpack(wire, len)?;
        got.unpack_body()?;

        prop_assert_eq!(got.is_swabbed(), swab);
        prop_assert_eq!(got.bufcount(), payloads.len() + 1);
        prop_assert_eq!(got.transno()?, transno);
        prop_assert_eq!(got.opc()?, opc);
        for (i, payload) in payloads.iter().enumerate() {
            prop_assert_eq!(got.buflen(i + 1), payload.len());
            if !payload.is_empty() {
                prop_assert_eq!(got.buffer(i + 1, payload.len()).unwrap(), payload.as_slice());
            }
        }
    }

    /// Property: a receive shorter than the declared envelope is rejected.
    #[test]
    fn prop_truncated_rejected(
        format in format_strategy(),
        payloads in payload_strategy(),
        cut in 1usize..64,
    ) {
        let msg = pack(format, &payloads, 1, 1);
        let short = msg.len().saturating_sub(cut);
        let result = WireMessage::unpack(BytesMut::from(msg.as_bytes()), short);
        prop_assert!(matches!(result, Err(Error::Truncated { .. })), "expected Truncated error, got {:?}", result);
    }

    /// Property: the checksum depends only on the body.
    #[test]
    fn prop_checksum_ignores_payload(
        payloads in payload_strategy(),
        transno in any::<u64>(),
    ) {
        let a = pack(MsgFormat::SelfDescribing, &payloads, transno, 7);
        let b = pack(MsgFormat::SelfDescribing, &[], transno, 7);
        prop_assert_eq!(a.calc_checksum()?, b.calc_checksum()?);
    }
}
