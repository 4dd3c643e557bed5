//! Fuzz target for inbound frame decoding
//!
//! Feeds arbitrary bytes to the envelope and event decoders, as text and as
//! binary frames.
//!
//! The fuzzer should NEVER panic. All invalid inputs should return an error.

#![no_main]

use libfuzzer_sys::fuzz_target;
use parley_proto::{Envelope, Inbound};

fuzz_target!(|data: &[u8]| {
    if let Ok(envelope) = Envelope::decode_bytes(data) {
        let _ = Inbound::from_envelope(envelope);
    }

    if let Ok(text) = std::str::from_utf8(data) {
        let _ = Inbound::decode_frame(text);
    }
});
