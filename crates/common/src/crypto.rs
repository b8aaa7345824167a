//! Crypto helpers: RSA and Ed25519 keys, sign, verify, and hex utilities.
//! Compatible with ed25519-dalek v2.2 with the rand_core feature enabled.
//!
//! Round updates are dual-signed: once with the server's long-term RSA key
//! and once with its elliptic key. Combined elliptic key format (64 bytes):
//!   [0..32]  = private key bytes
//!   [32..64] = public key bytes

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key length: expected {expected}, found {found}")]
    InvalidKeyLength { expected: usize, found: usize },

    #[error("signing failed: {0}")]
    SignFailed(String),

    #[error("verification failed")]
    VerifyFailed,

    #[error("hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("rsa key error: {0}")]
    Rsa(String),
}

// ───────────────────────── elliptic (Ed25519) ─────────────────────────

/// Generate a new Ed25519 keypair and return concatenated 64-byte
/// (private + public).
pub fn generate_elliptic_key_bytes() -> Vec<u8> {
    let mut rng = OsRng;
    let sk = SigningKey::generate(&mut rng);
    let vk = sk.verifying_key();

    let mut combined = Vec::with_capacity(64);
    combined.extend_from_slice(&sk.to_bytes());
    combined.extend_from_slice(&vk.to_bytes());
    combined
}

/// Build a SigningKey from combined keypair bytes.
pub fn signing_key_from_bytes(bytes: &[u8]) -> Result<SigningKey, CryptoError> {
    if bytes.len() != 64 {
        return Err(CryptoError::InvalidKeyLength { expected: 64, found: bytes.len() });
    }
    let mut sk_bytes = [0u8; 32];
    sk_bytes.copy_from_slice(&bytes[0..32]);
    Ok(SigningKey::from_bytes(&sk_bytes))
}

/// Extract public key bytes from a 64-byte combined keypair.
pub fn public_key_bytes_from_keypair_bytes(kp_bytes: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if kp_bytes.len() != 64 {
        return Err(CryptoError::InvalidKeyLength { expected: 64, found: kp_bytes.len() });
    }
    Ok(kp_bytes[32..64].to_vec())
}

/// Sign a message with an Ed25519 key and return the 64-byte signature.
pub fn eddsa_sign(key: &SigningKey, message: &[u8]) -> Vec<u8> {
    key.sign(message).to_bytes().to_vec()
}

/// Verify an Ed25519 signature given the 32-byte public key.
pub fn eddsa_verify(pubkey_bytes: &[u8], message: &[u8], sig_bytes: &[u8]) -> Result<bool, CryptoError> {
    if pubkey_bytes.len() != 32 {
        return Err(CryptoError::InvalidKeyLength { expected: 32, found: pubkey_bytes.len() });
    }
    if sig_bytes.len() != 64 {
        return Err(CryptoError::InvalidKeyLength { expected: 64, found: sig_bytes.len() });
    }

    let mut pk_arr = [0u8; 32];
    pk_arr.copy_from_slice(pubkey_bytes);
    let vk = VerifyingKey::from_bytes(&pk_arr).map_err(|_| CryptoError::VerifyFailed)?;

    let mut sig_arr = [0u8; 64];
    sig_arr.copy_from_slice(sig_bytes);
    let sig = Signature::from_bytes(&sig_arr);

    Ok(vk.verify(message, &sig).is_ok())
}

// ───────────────────────── RSA ─────────────────────────

/// Default modulus size for generated RSA keys.
pub const RSA_KEY_BITS: usize = 2048;

/// Generate a fresh RSA private key.
pub fn generate_rsa_key(bits: usize) -> Result<RsaPrivateKey, CryptoError> {
    let mut rng = OsRng;
    RsaPrivateKey::new(&mut rng, bits).map_err(|e| CryptoError::Rsa(e.to_string()))
}

/// Sign a SHA-256 digest of the message with RSA PKCS#1 v1.5.
pub fn rsa_sign_sha256(key: &RsaPrivateKey, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let digest = Sha256::digest(message);
    key.sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
        .map_err(|e| CryptoError::SignFailed(e.to_string()))
}

/// Verify an RSA PKCS#1 v1.5 signature over the SHA-256 digest of `message`.
pub fn rsa_verify_sha256(key: &RsaPublicKey, message: &[u8], signature: &[u8]) -> bool {
    let digest = Sha256::digest(message);
    key.verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
        .is_ok()
}

/// Serialize an RSA private key to hex-encoded PKCS#1 DER for persistence.
pub fn rsa_key_to_hex(key: &RsaPrivateKey) -> Result<String, CryptoError> {
    let der = key
        .to_pkcs1_der()
        .map_err(|e| CryptoError::Rsa(e.to_string()))?;
    Ok(hex::encode(der.as_bytes()))
}

/// Load an RSA private key from hex-encoded PKCS#1 DER.
pub fn rsa_key_from_hex(hexstr: &str) -> Result<RsaPrivateKey, CryptoError> {
    let der = hex::decode(hexstr)?;
    RsaPrivateKey::from_pkcs1_der(&der).map_err(|e| CryptoError::Rsa(e.to_string()))
}

// ───────────────────────── hex helpers ─────────────────────────

pub fn keypair_bytes_to_hex(kp_bytes: &[u8]) -> String {
    hex::encode(kp_bytes)
}

pub fn keypair_bytes_from_hex(hexstr: &str) -> Result<Vec<u8>, CryptoError> {
    Ok(hex::decode(hexstr)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eddsa_sign_verify_roundtrip() {
        let kp = generate_elliptic_key_bytes();
        let sk = signing_key_from_bytes(&kp).expect("signing key");
        let pk = public_key_bytes_from_keypair_bytes(&kp).expect("pub bytes");
        let msg = b"round update digest";
        let sig = eddsa_sign(&sk, msg);
        assert!(eddsa_verify(&pk, msg, &sig).expect("verify"));

        // tamper message
        assert!(!eddsa_verify(&pk, b"round update digest!", &sig).expect("verify"));
    }

    #[test]
    fn test_rsa_sign_verify_roundtrip() {
        let key = generate_rsa_key(RSA_KEY_BITS).expect("rsa key");
        let public = RsaPublicKey::from(&key);
        let msg = b"network definition";
        let sig = rsa_sign_sha256(&key, msg).expect("sign");
        assert!(rsa_verify_sha256(&public, msg, &sig));
        assert!(!rsa_verify_sha256(&public, b"other message", &sig));
    }

    #[test]
    fn test_elliptic_key_hex_serialization() {
        let kp = generate_elliptic_key_bytes();
        let hexstr = keypair_bytes_to_hex(&kp);
        let back = keypair_bytes_from_hex(&hexstr).expect("from hex");
        assert_eq!(kp, back);
    }

    #[test]
    fn test_rsa_key_hex_serialization() {
        let key = generate_rsa_key(RSA_KEY_BITS).expect("rsa key");
        let hexstr = rsa_key_to_hex(&key).expect("to hex");
        let back = rsa_key_from_hex(&hexstr).expect("from hex");
        assert_eq!(rsa_key_to_hex(&back).expect("back to hex"), hexstr);

        // the reloaded key produces signatures the original key's public
        // half accepts
        let public = RsaPublicKey::from(&key);
        let sig = rsa_sign_sha256(&back, b"persisted key").expect("sign");
        assert!(rsa_verify_sha256(&public, b"persisted key", &sig));
    }
}
