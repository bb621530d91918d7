//! Fuzz target for handshake record parsing

#![no_main]

use libfuzzer_sys::fuzz_target;
use yuki_core::{ClientHello, ServerReply};

fuzz_target!(|data: &[u8]| {
    let _ = ClientHello::decode(data);

    if let Ok(reply) = ServerReply::decode(data) {
        if let Ok(encoded) = reply.encode() {
            assert!(ServerReply::decode(&encoded).is_ok());
        }
    }
});
