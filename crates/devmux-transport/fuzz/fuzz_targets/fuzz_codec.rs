#![no_main]

use bytes::BytesMut;
use devmux_transport::FrameCodec;
use libfuzzer_sys::fuzz_target;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::from(data);
    // Malformed bodies come back as items; only a bad length prefix ends the stream
    while let Ok(Some(_)) = codec.decode(&mut buf) {}
});
