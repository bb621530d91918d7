//! Fuzz target for frame decoding
//!
//! The decoder must return `Ok` or `Err` for any input, and anything it
//! accepts must encode back to the same bytes.

#![no_main]

use libfuzzer_sys::fuzz_target;
use yuki_core::Frame;

fuzz_target!(|data: &[u8]| {
    if let Ok(frame) = Frame::decode(data) {
        assert_eq!(frame.encode(), data);
    }
});
