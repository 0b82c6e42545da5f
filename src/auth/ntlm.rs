//! NTLM cryptographic primitives

use crate::error::{Error, Result};
use byteorder::{LittleEndian, WriteBytesExt};
use des::cipher::generic_array::GenericArray;
use des::cipher::{BlockEncrypt, KeyInit};
use des::Des;
use hmac::{Hmac, Mac};
use md4::{Digest, Md4};
use md5::Md5;

/// Convert a password to the NTLM hash (MD4 of the UTF-16LE password)
pub fn ntlm_hash(password: &str) -> Result<[u8; 16]> {
    let mut pwd_utf16 = Vec::new();
    for ch in password.encode_utf16() {
        pwd_utf16.write_u16::<LittleEndian>(ch)?;
    }

    let mut hasher = Md4::new();
    hasher.update(&pwd_utf16);
    let result = hasher.finalize();
    let mut hash = [0u8; 16];
    hash.copy_from_slice(&result);
    Ok(hash)
}

/// NTLMv2 hash: HMAC-MD5 of uppercased user + domain keyed by the NTLM hash
pub fn ntlmv2_hash(username: &str, domain: &str, password: &str) -> Result<[u8; 16]> {
    let ntlm_hash = ntlm_hash(password)?;

    let user_domain = format!("{}{}", username.to_uppercase(), domain);
    let mut ud_utf16 = Vec::new();
    for ch in user_domain.encode_utf16() {
        ud_utf16.write_u16::<LittleEndian>(ch)?;
    }

    let mut mac = <Hmac<Md5> as Mac>::new_from_slice(&ntlm_hash)
        .map_err(|e| Error::CryptoError(format!("HMAC error: {}", e)))?;
    mac.update(&ud_utf16);
    let out = mac.finalize().into_bytes();
    let mut hash = [0u8; 16];
    hash.copy_from_slice(&out);
    Ok(hash)
}

/// Expand a 7-byte key fragment to the 8-byte form DES expects.
fn setup_des_key(key7: &[u8]) -> [u8; 8] {
    [
        key7[0],
        (key7[0] << 7) | (key7[1] >> 1),
        (key7[1] << 6) | (key7[2] >> 2),
        (key7[2] << 5) | (key7[3] >> 3),
        (key7[3] << 4) | (key7[4] >> 4),
        (key7[4] << 3) | (key7[5] >> 5),
        (key7[5] << 2) | (key7[6] >> 6),
        key7[6] << 1,
    ]
}

fn des_encrypt(key7: &[u8], block8: &[u8; 8]) -> Result<[u8; 8]> {
    let key = setup_des_key(key7);
    let cipher = Des::new_from_slice(&key)
        .map_err(|e| Error::CryptoError(format!("DES key error: {}", e)))?;
    let mut block = GenericArray::clone_from_slice(block8);
    cipher.encrypt_block(&mut block);
    let mut out = [0u8; 8];
    out.copy_from_slice(&block);
    Ok(out)
}

/// Classic 24-byte NTLM challenge response: the NT hash padded to 21 bytes
/// keys three DES operations over the server challenge.
pub fn ntlm_response(nt_hash: &[u8; 16], challenge: &[u8; 8]) -> Result<[u8; 24]> {
    let mut padded = [0u8; 21];
    padded[..16].copy_from_slice(nt_hash);

    let mut out = [0u8; 24];
    out[0..8].copy_from_slice(&des_encrypt(&padded[0..7], challenge)?);
    out[8..16].copy_from_slice(&des_encrypt(&padded[7..14], challenge)?);
    out[16..24].copy_from_slice(&des_encrypt(&padded[14..21], challenge)?);
    Ok(out)
}

/// NTLMv2 proof: HMAC-MD5 over the server challenge and client blob.
pub fn ntlmv2_proof(v2_hash: &[u8; 16], challenge: &[u8; 8], blob: &[u8]) -> Result<[u8; 16]> {
    let mut mac = <Hmac<Md5> as Mac>::new_from_slice(v2_hash)
        .map_err(|e| Error::CryptoError(format!("HMAC error: {}", e)))?;
    mac.update(challenge);
    mac.update(blob);
    let out = mac.finalize().into_bytes();
    let mut proof = [0u8; 16];
    proof.copy_from_slice(&out);
    Ok(proof)
}

/// Session base key for an NTLM logon (MD4 of the NT hash).
pub fn ntlm_session_key(nt_hash: &[u8; 16]) -> [u8; 16] {
    let mut hasher = Md4::new();
    hasher.update(nt_hash);
    let out = hasher.finalize();
    let mut key = [0u8; 16];
    key.copy_from_slice(&out);
    key
}

/// Session base key for an NTLMv2 logon (HMAC-MD5 of the proof).
pub fn ntlmv2_session_key(v2_hash: &[u8; 16], proof: &[u8; 16]) -> Result<[u8; 16]> {
    let mut mac = <Hmac<Md5> as Mac>::new_from_slice(v2_hash)
        .map_err(|e| Error::CryptoError(format!("HMAC error: {}", e)))?;
    mac.update(proof);
    let out = mac.finalize().into_bytes();
    let mut key = [0u8; 16];
    key.copy_from_slice(&out);
    Ok(key)
}
