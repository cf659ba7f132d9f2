#![no_main]

use libfuzzer_sys::fuzz_target;
use serial_tls_gateway::core::codec::{DecodeResult, FrameAccumulator, FRAME_SIZE};

fuzz_target!(|data: &[u8]| {
    // Line noise in uneven chunks: decoding must terminate, never panic and
    // never hold a full frame's worth of undecided bytes
    let mut acc = FrameAccumulator::new();
    for chunk in data.chunks(7) {
        let mut result = acc.decode_incremental(chunk);
        while result != DecodeResult::Incomplete {
            result = acc.poll_frame();
        }
        assert!(acc.buffered() < FRAME_SIZE);
    }
});
