//! Authentication and message signing.
//!
//! The dispatcher treats this module as its crypto oracle: it hands over the
//! session challenge and the client's response blob and gets back a session
//! key, or a logon failure. Signing stamps the per-session MAC into the
//! header's signature slot.

pub mod ntlm;

use crate::config::UserConfig;
use crate::error::{Error, Result};
use crate::protocol::constants::{ENCPWD_SIZE, NTLM_AUTH_RESPONSE_SIZE};
use md5::{Digest, Md5};

/// Generate the random 8-byte challenge sent in the negotiate response.
pub fn generate_challenge() -> [u8; 8] {
    let mut challenge = [0u8; 8];
    for byte in &mut challenge {
        *byte = rand::random();
    }
    challenge
}

/// Verify a classic 24-byte NTLM response. Returns the session base key.
pub fn verify_ntlm(user: &UserConfig, challenge: &[u8; 8], response: &[u8]) -> Result<[u8; 16]> {
    if response.len() != NTLM_AUTH_RESPONSE_SIZE {
        return Err(Error::AuthenticationFailed(format!(
            "bad NTLM response length {}",
            response.len()
        )));
    }

    let nt_hash = ntlm::ntlm_hash(&user.password)?;
    let expected = ntlm::ntlm_response(&nt_hash, challenge)?;
    if expected[..] != response[..] {
        return Err(Error::AuthenticationFailed(format!(
            "NTLM mismatch for user {}",
            user.name
        )));
    }
    Ok(ntlm::ntlm_session_key(&nt_hash))
}

/// Verify an NTLMv2 response (16-byte proof followed by the client blob).
/// Returns the session base key.
pub fn verify_ntlmv2(
    user: &UserConfig,
    domain: &str,
    challenge: &[u8; 8],
    response: &[u8],
) -> Result<[u8; 16]> {
    if response.len() < ENCPWD_SIZE {
        return Err(Error::AuthenticationFailed(format!(
            "short NTLMv2 response: {}",
            response.len()
        )));
    }

    let v2_hash = ntlm::ntlmv2_hash(&user.name, domain, &user.password)?;
    let (proof, blob) = response.split_at(ENCPWD_SIZE);
    let expected = ntlm::ntlmv2_proof(&v2_hash, challenge, blob)?;
    if expected[..] != proof[..] {
        return Err(Error::AuthenticationFailed(format!(
            "NTLMv2 mismatch for user {}",
            user.name
        )));
    }
    ntlm::ntlmv2_session_key(&v2_hash, &expected)
}

/// Per-session MAC key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningKey {
    key: [u8; 16],
}

impl SigningKey {
    /// Wrap a session base key.
    pub fn new(key: [u8; 16]) -> Self {
        Self { key }
    }

    /// Compute the MAC over a message with `seq` stamped into the signature
    /// field, per the SMB1 signing algorithm: MD5(key || message), first
    /// eight bytes.
    pub fn compute(&self, seq: u32, msg: &[u8]) -> [u8; 8] {
        let mut stamped = msg.to_vec();
        if stamped.len() >= 22 {
            stamped[14..18].copy_from_slice(&seq.to_le_bytes());
            stamped[18..22].fill(0);
        }

        let mut hasher = Md5::new();
        hasher.update(self.key);
        hasher.update(&stamped);
        let digest = hasher.finalize();
        let mut mac = [0u8; 8];
        mac.copy_from_slice(&digest[..8]);
        mac
    }

    /// Stamp the MAC for `seq` into the message's signature field.
    pub fn sign(&self, seq: u32, msg: &mut [u8]) {
        let mac = self.compute(seq, msg);
        if msg.len() >= 22 {
            msg[14..22].copy_from_slice(&mac);
        }
    }

    /// Check the MAC carried in the message's signature field.
    pub fn verify(&self, seq: u32, msg: &[u8]) -> Result<()> {
        if msg.len() < 22 {
            return Err(Error::SigningError("message too short to sign".to_string()));
        }
        let mut carried = [0u8; 8];
        carried.copy_from_slice(&msg[14..22]);
        let expected = self.compute(seq, msg);
        if carried != expected {
            return Err(Error::SigningError("MAC mismatch".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_user() -> UserConfig {
        UserConfig::new("alice", "wonderland", 1000, 1000)
    }

    #[test]
    fn test_challenges_are_random() {
        assert_ne!(generate_challenge(), generate_challenge());
    }

    #[test]
    fn test_ntlm_round_trip() {
        let user = test_user();
        let challenge = generate_challenge();
        let nt_hash = ntlm::ntlm_hash(&user.password).unwrap();
        let response = ntlm::ntlm_response(&nt_hash, &challenge).unwrap();

        let key = verify_ntlm(&user, &challenge, &response).unwrap();
        assert_eq!(key, ntlm::ntlm_session_key(&nt_hash));
    }

    #[test]
    fn test_ntlm_wrong_password_rejected() {
        let user = test_user();
        let challenge = generate_challenge();
        let bad_hash = ntlm::ntlm_hash("not-the-password").unwrap();
        let response = ntlm::ntlm_response(&bad_hash, &challenge).unwrap();
        assert!(verify_ntlm(&user, &challenge, &response).is_err());
    }

    #[test]
    fn test_ntlmv2_round_trip() {
        let user = test_user();
        let challenge = generate_challenge();
        let v2_hash = ntlm::ntlmv2_hash(&user.name, "WORKGROUP", &user.password).unwrap();
        let blob = b"\x01\x01\x00\x00client-blob-bytes";
        let proof = ntlm::ntlmv2_proof(&v2_hash, &challenge, blob).unwrap();
        let mut response = proof.to_vec();
        response.extend_from_slice(blob);

        assert!(verify_ntlmv2(&user, "WORKGROUP", &challenge, &response).is_ok());
    }

    #[test]
    fn test_signing_round_trip() {
        let key = SigningKey::new([7u8; 16]);
        let mut msg = vec![0u8; 64];
        key.sign(3, &mut msg);
        assert!(key.verify(3, &msg).is_ok());
        // wrong sequence desynchronizes the MAC
        assert!(key.verify(4, &msg).is_err());
        // tampering breaks it
        msg[40] ^= 0xFF;
        assert!(key.verify(3, &msg).is_err());
    }
}
