//! Fuzz target for envelope opening
//!
//! Feeds arbitrary envelopes to an opener, interleaved with genuine ones, and
//! checks that a genuine envelope still opens after any amount of garbage.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use yuki_crypto::{AeadKey, Role, SessionCipher};

#[derive(Debug, Arbitrary)]
struct EnvelopeInput {
    key: [u8; 32],
    garbage: Vec<Vec<u8>>,
    plaintext: Vec<u8>,
}

fuzz_target!(|input: EnvelopeInput| {
    let key = AeadKey::new(input.key);
    let (mut sealer, _) = SessionCipher::new(key.clone(), Role::Initiator).into_halves();
    let (_, mut opener) = SessionCipher::new(key, Role::Responder).into_halves();

    for envelope in &input.garbage {
        let _ = opener.open(envelope);
    }

    // Garbage cannot forge a tag, so the window has not moved
    if let Ok(envelope) = sealer.seal(&input.plaintext) {
        let opened = opener.open(&envelope).expect("genuine envelope rejected");
        assert_eq!(opened, input.plaintext);
    }
});
