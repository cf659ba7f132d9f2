//! Property-based tests for the serial frame codec and network messages
//!
//! These check the framing invariants across randomly generated packets,
//! chunkings and line noise.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bytes::BytesMut;
use proptest::prelude::*;
use serial_tls_gateway::core::codec::{
    encode, DecodeResult, FrameAccumulator, FRAME_MAGIC, FRAME_SIZE,
};
use serial_tls_gateway::core::packet::{Packet, PacketType, DATA_LEN};
use serial_tls_gateway::protocol::message::{GatewayCodec, InboundFrame, OperatorCommand};
use tokio_util::codec::Decoder;

fn packet_type() -> impl Strategy<Value = PacketType> {
    prop_oneof![
        Just(PacketType::Command),
        Just(PacketType::Response),
        Just(PacketType::Error),
        Just(PacketType::Message),
        Just(PacketType::Hello),
    ]
}

fn packet() -> impl Strategy<Value = Packet> {
    (packet_type(), any::<u8>(), any::<[u32; 2]>(), any::<[u8; DATA_LEN]>()).prop_map(
        |(packet_type, command, params, data)| Packet {
            packet_type,
            command,
            params,
            data,
        },
    )
}

/// Line noise of any byte value, seeded with partial magic headers
/// (`FF`, `FF FE`, `FF FE FD`) but never a full one
fn noise(max_pieces: usize) -> impl Strategy<Value = Vec<u8>> {
    let piece = prop_oneof![
        3 => any::<u8>().prop_map(|b| vec![b]),
        1 => (1..FRAME_MAGIC.len()).prop_map(|n| FRAME_MAGIC[..n].to_vec()),
    ];
    prop::collection::vec(piece, 0..max_pieces)
        .prop_map(|pieces| pieces.concat())
        .prop_filter("noise must not embed a frame header", |bytes| {
            !bytes.windows(FRAME_MAGIC.len()).any(|w| w == &FRAME_MAGIC[..])
        })
}

/// Drain the accumulator, returning every non-incomplete result
fn drain(acc: &mut FrameAccumulator, first: DecodeResult) -> Vec<DecodeResult> {
    let mut results = Vec::new();
    let mut next = first;
    while next != DecodeResult::Incomplete {
        results.push(next);
        next = acc.poll_frame();
    }
    results
}

// Property: every packet survives encode then incremental decode
proptest! {
    #[test]
    fn prop_frame_roundtrip(p in packet()) {
        let mut acc = FrameAccumulator::new();
        let result = acc.decode_incremental(&encode(&p));
        prop_assert_eq!(result, DecodeResult::Complete { packet: p, consumed: FRAME_SIZE });
        prop_assert_eq!(acc.buffered(), 0);
    }
}

// Property: any chunking yields Incomplete until the last chunk, then the same packet
proptest! {
    #[test]
    fn prop_split_frame_accumulates(
        p in packet(),
        cuts in prop::collection::btree_set(1..FRAME_SIZE, 0..8),
    ) {
        let frame = encode(&p);
        let mut bounds: Vec<usize> = cuts.into_iter().collect();
        bounds.push(FRAME_SIZE);

        let mut acc = FrameAccumulator::new();
        let mut start = 0;
        for (i, end) in bounds.iter().copied().enumerate() {
            let result = acc.decode_incremental(&frame[start..end]);
            if i + 1 < bounds.len() {
                prop_assert_eq!(result, DecodeResult::Incomplete);
            } else {
                prop_assert_eq!(result, DecodeResult::Complete { packet: p, consumed: FRAME_SIZE });
            }
            start = end;
        }
    }
}

// Property: flipping any single body bit is always caught
proptest! {
    #[test]
    fn prop_single_bit_flip_is_detected(p in packet(), bit in 0..(FRAME_SIZE - 5) * 8) {
        let mut frame = encode(&p);
        frame[4 + bit / 8] ^= 1 << (bit % 8);

        let mut acc = FrameAccumulator::new();
        let result = acc.decode_incremental(&frame);
        prop_assert_eq!(result, DecodeResult::ChecksumBad { consumed: FRAME_SIZE });
    }
}

// Property: line noise before a frame is skipped and the frame is recovered exactly once
proptest! {
    #[test]
    fn prop_resync_after_garbage(
        p in packet(),
        garbage in noise(256),
    ) {
        let mut input = garbage.clone();
        input.extend_from_slice(&encode(&p));

        let mut acc = FrameAccumulator::new();
        let first = acc.decode_incremental(&input);
        let results = drain(&mut acc, first);

        let mut dropped = 0;
        let mut consumed = 0;
        let mut complete = 0;
        for result in &results {
            match result {
                DecodeResult::BadMagic { dropped: n } => dropped += n,
                DecodeResult::Complete { packet, consumed: n } => {
                    prop_assert_eq!(*packet, p);
                    consumed += n;
                    complete += 1;
                }
                other => prop_assert!(false, "unexpected result {:?}", other),
            }
        }
        prop_assert_eq!(complete, 1);
        prop_assert_eq!(dropped, garbage.len());
        prop_assert_eq!(dropped + consumed, garbage.len() + FRAME_SIZE);
        prop_assert_eq!(acc.buffered(), 0);
    }
}

// Property: noise fed one byte at a time never yields a packet and never grows the buffer
proptest! {
    #[test]
    fn prop_noise_is_bounded(bytes in noise(512)) {
        let mut acc = FrameAccumulator::new();
        for byte in bytes {
            let result = acc.decode_incremental(&[byte]);
            let is_complete = matches!(result, DecodeResult::Complete { .. });
            prop_assert!(!is_complete);
            prop_assert!(acc.buffered() < FRAME_SIZE);
        }
    }
}

// Property: operator commands survive the server codec regardless of preceding unknown tags
proptest! {
    #[test]
    fn prop_command_decodes_after_unknown_tags(
        key in any::<u8>(),
        params in any::<[u32; 2]>(),
        junk in prop::collection::vec(4u8..=255, 0..16),
    ) {
        let command = OperatorCommand::new(key, params);
        let mut buf = BytesMut::from(&junk[..]);
        buf.extend_from_slice(&command.to_bytes());

        let mut codec = GatewayCodec;
        let mut ignored = 0;
        let decoded = loop {
            match codec.decode(&mut buf).expect("decode") {
                Some(InboundFrame::Ignored(_)) => ignored += 1,
                Some(InboundFrame::Command(cmd)) => break cmd,
                None => panic!("command was not decoded"),
            }
        };
        prop_assert_eq!(ignored, junk.len());
        prop_assert_eq!(decoded, command);
        prop_assert!(buf.is_empty());
    }
}
