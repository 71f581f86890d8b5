//! Fuzz target for the bulk endpoint's Authorization header.
//!
//! Parsing and verifying an attacker-controlled header must never panic,
//! and must never succeed without a valid signature.

#![no_main]

use blobmesh::config::PeerConfig;
use blobmesh::signing::{parse_nonce_header, NodeSigner, PeerKeys};
use libfuzzer_sys::fuzz_target;
use std::time::Duration;

fuzz_target!(|header: &str| {
    let _ = parse_nonce_header(header);

    let signer = NodeSigner::from_seed("http://a:4000", [7u8; 32]);
    let peer = PeerConfig::new("http://a:4000", &signer.public_key_hex());
    let Ok(keys) = PeerKeys::from_peers([&peer], Duration::from_secs(60)) else {
        return;
    };

    if keys.verify_nonce_header(header).is_ok() {
        // Only a known host with a valid signature gets through
        let auth = parse_nonce_header(header).expect("verified header must parse");
        assert_eq!(auth.host, "http://a:4000");
        assert_eq!(
            auth.signature.to_ascii_lowercase(),
            signer.nonce_header_at(auth.nonce_millis).rsplit(' ').next().unwrap_or("")
        );
    }
});
