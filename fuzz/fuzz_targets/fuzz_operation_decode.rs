//! Fuzz target for operation decoding.
//!
//! Pushed bodies and bulk responses come straight off the network; decoding
//! must reject garbage with an error, never panic.

#![no_main]

use blobmesh::operation::Operation;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(op) = Operation::decode(data) else {
        return;
    };

    // Everything downstream of a decoded envelope must also be panic-free
    let _ = op.relayed_at_nanos();
    let _ = op.decode_record();
    let _ = op.id();

    // A decoded op re-encodes and decodes to itself
    if let Ok(bytes) = op.encode() {
        let again = Operation::decode(&bytes).expect("re-encoded operation must decode");
        assert_eq!(again, op);
    }
});
