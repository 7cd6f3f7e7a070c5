//! Host authentication and authorization
//!
//! Each side challenges the other with a fresh nonce and only accepts a
//! proof computed over that nonce, so a recorded handshake is worthless on
//! a later channel.

use ferry_types::{HostAuth, Role};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::packet::PacketType;

/// Fresh challenge for one handshake
pub fn nonce() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Proof of possession of a host key over the peer's challenge:
/// `hex(sha256(host_id ":" key ":" nonce))`
pub fn proof(host_id: &str, key: &str, nonce: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(host_id.as_bytes());
    hasher.update(b":");
    hasher.update(key.as_bytes());
    hasher.update(b":");
    hasher.update(nonce.as_bytes());
    hex::encode(hasher.finalize())
}

/// Check a proof answering our challenge `nonce` against our copy of the
/// host's key
pub fn verify(host: &HostAuth, nonce: &str, received: &str) -> bool {
    if nonce.is_empty() {
        return false;
    }
    let expected = proof(&host.host_id, &host.key, nonce);
    // Compare without an early exit on the first differing byte.
    expected.len() == received.len()
        && expected
            .bytes()
            .zip(received.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

/// Role a peer needs before a packet of this type is served
pub fn required_role(kind: PacketType) -> Option<Role> {
    match kind {
        PacketType::Request => Some(Role::Transfer),
        PacketType::Stop | PacketType::Cancel => Some(Role::Control),
        PacketType::Information | PacketType::Test => Some(Role::Read),
        PacketType::Bandwidth | PacketType::Shutdown | PacketType::Block => Some(Role::System),
        PacketType::Business => Some(Role::Business),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proof_binds_host_and_key() {
        let host = HostAuth::new("alpha", "127.0.0.1", 6666, "secret");
        let challenge = nonce();
        assert!(verify(&host, &challenge, &proof("alpha", "secret", &challenge)));
        assert!(!verify(&host, &challenge, &proof("alpha", "other", &challenge)));
        assert!(!verify(&host, &challenge, &proof("beta", "secret", &challenge)));
        assert!(!verify(&host, &challenge, ""));
    }

    #[test]
    fn recorded_proof_fails_a_new_challenge() {
        let host = HostAuth::new("alpha", "127.0.0.1", 6666, "secret");
        let first = nonce();
        let second = nonce();
        assert_ne!(first, second);

        let recorded = proof("alpha", "secret", &first);
        assert!(verify(&host, &first, &recorded));
        assert!(!verify(&host, &second, &recorded));
        // Without a challenge of our own nothing verifies.
        assert!(!verify(&host, "", &proof("alpha", "secret", "")));
    }

    #[test]
    fn controls_need_their_roles() {
        assert_eq!(required_role(PacketType::Request), Some(Role::Transfer));
        assert_eq!(required_role(PacketType::Cancel), Some(Role::Control));
        assert_eq!(required_role(PacketType::Bandwidth), Some(Role::System));
        assert_eq!(required_role(PacketType::KeepAlive), None);
    }
}
