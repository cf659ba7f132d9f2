#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use serial_tls_gateway::protocol::message::{GatewayCodec, OperatorCodec};
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Both ends of the network codec must consume or reject arbitrary bytes without panicking
    let mut buf = BytesMut::from(data);
    while let Ok(Some(_)) = GatewayCodec.decode(&mut buf) {}

    let mut buf = BytesMut::from(data);
    while let Ok(Some(_)) = OperatorCodec.decode(&mut buf) {}
});
