#![no_main]

use bytes::Bytes;
use devmux_transport::Frame;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Decoding must never panic; whatever decodes must encode back identically
    if let Ok(frame) = Frame::decode(Bytes::copy_from_slice(data)) {
        let encoded = frame.to_bytes();
        assert_eq!(Frame::decode(encoded), Ok(frame));
    }
});
