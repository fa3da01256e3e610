//! Connection handshake: request -> challenge -> answer -> accept.
//!
//! The challenge is a liveness proof, not authentication: the server hands
//! out a random 64-bit nonce and expects its SHA-256 digest back. An
//! observer of the nonce can complete the handshake; no stronger guarantee
//! is made.

use std::collections::HashMap;
use std::net::SocketAddr;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

/// SHA-256 digest of a challenge nonce, as carried in a ChallengeAnswer.
pub fn challenge_proof(nonce: u64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(nonce.to_be_bytes());
    let result = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&result);
    out
}

/// Outstanding challenges, keyed by the requesting address.
///
/// An address is present iff a challenge is outstanding for it; a repeated
/// request replaces the stored digest, and both acceptance and denial
/// remove the record.
#[derive(Default)]
pub(crate) struct PendingConnections {
    digests: Mutex<HashMap<SocketAddr, [u8; 32]>>,
}

impl PendingConnections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a fresh nonce for `addr`, replacing any outstanding challenge.
    /// Returns the nonce to transmit.
    pub fn challenge(&self, addr: SocketAddr) -> u64 {
        let nonce: u64 = rand::random();
        self.digests.lock().insert(addr, challenge_proof(nonce));
        nonce
    }

    /// Close the outstanding challenge for `addr`, returning its stored
    /// digest. The record is removed whether the answer will be accepted
    /// or denied.
    pub fn take(&self, addr: SocketAddr) -> Option<[u8; 32]> {
        self.digests.lock().remove(&addr)
    }

    pub fn outstanding(&self) -> usize {
        self.digests.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn proof_is_deterministic() {
        assert_eq!(challenge_proof(42), challenge_proof(42));
        assert_ne!(challenge_proof(42), challenge_proof(43));
    }

    #[test]
    fn proof_matches_sha256_of_big_endian_nonce() {
        let mut hasher = Sha256::new();
        hasher.update(0xDEAD_BEEFu64.to_be_bytes());
        let expected: [u8; 32] = hasher.finalize().into();
        assert_eq!(challenge_proof(0xDEAD_BEEF), expected);
    }

    #[test]
    fn repeated_request_replaces_challenge() {
        let pending = PendingConnections::new();
        let first = pending.challenge(addr(1));
        let second = pending.challenge(addr(1));
        assert_eq!(pending.outstanding(), 1);

        // Only the latest nonce verifies.
        let stored = pending.take(addr(1)).unwrap();
        assert_eq!(stored, challenge_proof(second));
        if first != second {
            assert_ne!(stored, challenge_proof(first));
        }
    }

    #[test]
    fn take_removes_the_record() {
        let pending = PendingConnections::new();
        pending.challenge(addr(1));
        assert!(pending.take(addr(1)).is_some());
        assert!(pending.take(addr(1)).is_none());
        assert_eq!(pending.outstanding(), 0);
    }
}
