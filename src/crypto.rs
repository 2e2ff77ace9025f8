//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: trustedge — Privacy and trust at the edge.
//

//! Cryptographic primitives (C1): AES-256-GCM segment encryption, HMAC-SHA256
//! and GMAC segment/root integrity, RSA-OAEP key wrapping, and
//! RSA-PKCS1-SHA256 request signing.
//!
//! All primitives are stateless free functions; key material that should not
//! outlive an operation is returned wrapped in [`crate::secret::Secret`] by
//! callers, not by this module.

use aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand_core::RngCore;
use rsa::{Oaep, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::CryptoError;

/// Length of a payload key (AES-256).
pub const PAYLOAD_KEY_LEN: usize = 32;
/// Length of a segment/metadata IV.
pub const IV_LEN: usize = 12;
/// Length of the AES-GCM authentication tag.
pub const TAG_LEN: usize = 16;

/// Generate a fresh 32-byte payload key.
pub fn generate_payload_key() -> [u8; PAYLOAD_KEY_LEN] {
    let mut key = [0u8; PAYLOAD_KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}

fn fresh_iv() -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);
    iv
}

/// Encrypt one segment's plaintext under AES-256-GCM with a fresh random IV.
///
/// Returns `IV(12) || ciphertext || tag(16)`, matching the on-disk segment
/// layout in spec §4.4 step 3.
pub fn encrypt_segment(key: &[u8; PAYLOAD_KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| CryptoError::InvalidKey(format!("bad payload key: {e}")))?;
    let iv = fresh_iv();
    let nonce = Nonce::from_slice(&iv);
    let sealed = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| CryptoError::EncryptionFailed(format!("AES-256-GCM: {e}")))?;

    let mut out = Vec::with_capacity(IV_LEN + sealed.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Decrypt one segment previously produced by [`encrypt_segment`].
pub fn decrypt_segment(key: &[u8; PAYLOAD_KEY_LEN], blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if blob.len() < IV_LEN + TAG_LEN {
        return Err(CryptoError::DecryptionFailed(
            "segment shorter than IV + tag".to_string(),
        ));
    }
    let (iv, rest) = blob.split_at(IV_LEN);
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| CryptoError::InvalidKey(format!("bad payload key: {e}")))?;
    let nonce = Nonce::from_slice(iv);
    cipher
        .decrypt(nonce, rest)
        .map_err(|e| CryptoError::DecryptionFailed(format!("AES-256-GCM: {e}")))
}

/// The two segment/root integrity algorithms spec §3/§4.4 allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentHashAlg {
    /// HMAC-SHA256 over the segment ciphertext.
    Hs256,
    /// The segment's own AES-GCM authentication tag (its trailing 16 bytes).
    Gmac,
}

impl SegmentHashAlg {
    pub fn manifest_name(self) -> &'static str {
        match self {
            SegmentHashAlg::Hs256 => "HS256",
            SegmentHashAlg::Gmac => "GMAC",
        }
    }

    pub fn from_manifest_name(name: &str) -> Option<Self> {
        match name {
            "HS256" => Some(SegmentHashAlg::Hs256),
            "GMAC" => Some(SegmentHashAlg::Gmac),
            _ => None,
        }
    }
}

type HmacSha256 = Hmac<Sha256>;

/// Raw HMAC-SHA256 digest, keyed with the payload key.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Verify an HMAC-SHA256 digest in constant time.
pub fn verify_hmac_sha256(key: &[u8], data: &[u8], expected: &[u8]) -> bool {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.verify_slice(expected).is_ok()
}

/// Compute a segment's raw integrity hash over its ciphertext, per the
/// manifest's chosen `segmentHashAlg`.
pub fn segment_integrity_hash(
    alg: SegmentHashAlg,
    payload_key: &[u8; PAYLOAD_KEY_LEN],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    match alg {
        SegmentHashAlg::Hs256 => Ok(hmac_sha256(payload_key, ciphertext).to_vec()),
        SegmentHashAlg::Gmac => {
            if ciphertext.len() < TAG_LEN {
                return Err(CryptoError::EncryptionFailed(
                    "ciphertext shorter than GCM tag".to_string(),
                ));
            }
            Ok(ciphertext[ciphertext.len() - TAG_LEN..].to_vec())
        }
    }
}

/// Verify a segment's raw integrity hash, constant-time where it matters.
pub fn verify_segment_integrity_hash(
    alg: SegmentHashAlg,
    payload_key: &[u8; PAYLOAD_KEY_LEN],
    ciphertext: &[u8],
    expected: &[u8],
) -> bool {
    match segment_integrity_hash(alg, payload_key, ciphertext) {
        Ok(actual) => actual.len() == expected.len() && actual.ct_eq(expected).into(),
        Err(_) => false,
    }
}

/// `rootSignature.sig = base64(HMAC-SHA256(payload_key, concat(raw_segment_hashes)))`.
pub fn root_signature(payload_key: &[u8; PAYLOAD_KEY_LEN], raw_segment_hashes: &[Vec<u8>]) -> [u8; 32] {
    let mut concatenated = Vec::with_capacity(raw_segment_hashes.iter().map(Vec::len).sum());
    for h in raw_segment_hashes {
        concatenated.extend_from_slice(h);
    }
    hmac_sha256(payload_key, &concatenated)
}

/// `policyBinding = HMAC-SHA256(payload_key, base64(policy_json))`, returned raw.
pub fn policy_binding_raw(payload_key: &[u8; PAYLOAD_KEY_LEN], policy_b64: &str) -> [u8; 32] {
    hmac_sha256(payload_key, policy_b64.as_bytes())
}

/// Verify a KAO's base64 `policyBinding` against the recovered payload key
/// and the manifest's literal policy bytes (spec §3 invariant 3, §8 "Policy
/// binding"), constant-time.
pub fn verify_policy_binding(payload_key: &[u8; PAYLOAD_KEY_LEN], policy_b64: &str, binding_b64: &str) -> Result<bool, CryptoError> {
    let expected = b64_decode(binding_b64).map_err(|e| CryptoError::InvalidKey(format!("bad policyBinding base64: {e}")))?;
    Ok(verify_hmac_sha256(payload_key, policy_b64.as_bytes(), &expected))
}

/// Encrypt arbitrary metadata under AES-256-GCM with a fresh IV (C8
/// `encryptedMetadata`). Returns `(ciphertext_with_tag, iv)`.
pub fn encrypt_metadata(
    payload_key: &[u8; PAYLOAD_KEY_LEN],
    plaintext: &[u8],
) -> Result<(Vec<u8>, [u8; IV_LEN]), CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(payload_key)
        .map_err(|e| CryptoError::InvalidKey(format!("bad payload key: {e}")))?;
    let iv = fresh_iv();
    let nonce = Nonce::from_slice(&iv);
    let sealed = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| CryptoError::EncryptionFailed(format!("metadata AES-256-GCM: {e}")))?;
    Ok((sealed, iv))
}

/// Decrypt metadata previously sealed by [`encrypt_metadata`].
pub fn decrypt_metadata(
    payload_key: &[u8; PAYLOAD_KEY_LEN],
    ciphertext: &[u8],
    iv: &[u8; IV_LEN],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(payload_key)
        .map_err(|e| CryptoError::InvalidKey(format!("bad payload key: {e}")))?;
    let nonce = Nonce::from_slice(iv);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| CryptoError::DecryptionFailed(format!("metadata AES-256-GCM: {e}")))
}

/// Generate a fresh RSA keypair for use as a KAS or session signing key.
pub fn generate_rsa_keypair(bits: usize) -> Result<(RsaPrivateKey, RsaPublicKey), CryptoError> {
    let private = RsaPrivateKey::new(&mut OsRng, bits)
        .map_err(|e| CryptoError::KeyGeneration(format!("RSA-{bits}: {e}")))?;
    let public = RsaPublicKey::from(&private);
    Ok((private, public))
}

/// Wrap a payload key under a KAS public key via RSA-OAEP-SHA1/MGF1-SHA1.
///
/// The source accepts SHA-1/MGF1-SHA1 for interop with existing KAS
/// deployments (spec §9, Open Question); implementers upgrading to SHA-256
/// should confirm KAS compatibility first.
pub fn rsa_oaep_wrap(
    kas_public_key: &RsaPublicKey,
    payload_key: &[u8; PAYLOAD_KEY_LEN],
) -> Result<Vec<u8>, CryptoError> {
    kas_public_key
        .encrypt(&mut OsRng, Oaep::new::<Sha1>(), payload_key)
        .map_err(|e| CryptoError::WrapFailed(format!("RSA-OAEP-SHA1: {e}")))
}

/// Unwrap a payload key previously wrapped by [`rsa_oaep_wrap`].
pub fn rsa_oaep_unwrap(
    kas_private_key: &RsaPrivateKey,
    wrapped: &[u8],
) -> Result<[u8; PAYLOAD_KEY_LEN], CryptoError> {
    let unwrapped = kas_private_key
        .decrypt(Oaep::new::<Sha1>(), wrapped)
        .map_err(|e| CryptoError::UnwrapFailed(format!("RSA-OAEP-SHA1: {e}")))?;
    unwrapped
        .try_into()
        .map_err(|v: Vec<u8>| CryptoError::UnwrapFailed(format!("unwrapped key was {} bytes", v.len())))
}

/// Sign bytes with RSASSA-PKCS1-v1_5-SHA256 (used for the KAS request token).
pub fn rsa_pkcs1_sha256_sign(signing_key: &RsaPrivateKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let digest = Sha256::digest(data);
    signing_key
        .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
        .map_err(|e| CryptoError::SignatureFailed(format!("RSA-PKCS1-SHA256: {e}")))
}

/// Verify a signature produced by [`rsa_pkcs1_sha256_sign`].
pub fn rsa_pkcs1_sha256_verify(
    verifying_key: &RsaPublicKey,
    data: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    let digest = Sha256::digest(data);
    verifying_key
        .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
        .map_err(|e| CryptoError::SignatureFailed(format!("RSA-PKCS1-SHA256 verify: {e}")))
}

/// Encode an RSA public key as PKCS#8 PEM text (for `clientPublicKey` and the
/// KAS public key cache).
pub fn rsa_public_key_to_pem(key: &RsaPublicKey) -> Result<String, CryptoError> {
    use rsa::pkcs8::EncodePublicKey;
    key.to_public_key_pem(rsa::pkcs8::LineEnding::LF)
        .map_err(|e| CryptoError::InvalidKey(format!("PEM encode: {e}")))
}

/// Decode an RSA public key from PKCS#8 PEM text.
pub fn rsa_public_key_from_pem(pem: &str) -> Result<RsaPublicKey, CryptoError> {
    use rsa::pkcs8::DecodePublicKey;
    RsaPublicKey::from_public_key_pem(pem.trim())
        .map_err(|e| CryptoError::InvalidKey(format!("PEM decode: {e}")))
}

/// Standard (non-URL-safe) base64 encode, matching spec §6 "Base64 is
/// standard (not URL-safe) unless stated".
pub fn b64_encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Standard (non-URL-safe) base64 decode.
pub fn b64_decode(s: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(s)
}

/// Verify a manifest's base64 `rootSignature.sig` in constant time, via the
/// same `hmac::Mac::verify_slice` path `verify_hmac_sha256` uses for policy
/// bindings, rather than comparing base64 text with `==`.
pub fn verify_root_signature(payload_key: &[u8; PAYLOAD_KEY_LEN], raw_segment_hashes: &[Vec<u8>], expected_b64: &str) -> Result<bool, CryptoError> {
    let mut concatenated = Vec::with_capacity(raw_segment_hashes.iter().map(Vec::len).sum());
    for h in raw_segment_hashes {
        concatenated.extend_from_slice(h);
    }
    let expected = b64_decode(expected_b64).map_err(|e| CryptoError::InvalidKey(format!("bad rootSignature.sig base64: {e}")))?;
    Ok(verify_hmac_sha256(payload_key, &concatenated, &expected))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_round_trip() {
        let key = generate_payload_key();
        let plaintext = b"hello world";
        let blob = encrypt_segment(&key, plaintext).unwrap();
        assert_eq!(blob.len(), IV_LEN + plaintext.len() + TAG_LEN);
        let recovered = decrypt_segment(&key, &blob).unwrap();
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn segment_decrypt_fails_on_bit_flip() {
        let key = generate_payload_key();
        let mut blob = encrypt_segment(&key, b"some plaintext data").unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        assert!(decrypt_segment(&key, &blob).is_err());
    }

    #[test]
    fn hs256_segment_hash_matches_hmac() {
        let key = generate_payload_key();
        let ct = b"ciphertext-bytes";
        let hash = segment_integrity_hash(SegmentHashAlg::Hs256, &key, ct).unwrap();
        assert_eq!(hash, hmac_sha256(&key, ct).to_vec());
    }

    #[test]
    fn gmac_segment_hash_is_trailing_tag() {
        let key = generate_payload_key();
        let blob = encrypt_segment(&key, b"plaintext").unwrap();
        let ciphertext_region = &blob[IV_LEN..];
        let hash = segment_integrity_hash(SegmentHashAlg::Gmac, &key, ciphertext_region).unwrap();
        assert_eq!(hash, ciphertext_region[ciphertext_region.len() - TAG_LEN..].to_vec());
    }

    #[test]
    fn policy_binding_round_trips_and_detects_tamper() {
        let key = generate_payload_key();
        let policy_b64 = "eyJ1dWlkIjoiYSJ9";
        let binding = b64_encode(&policy_binding_raw(&key, policy_b64));
        assert!(verify_policy_binding(&key, policy_b64, &binding).unwrap());
        assert!(!verify_policy_binding(&key, "different-policy", &binding).unwrap());
    }

    #[test]
    fn root_signature_is_deterministic() {
        let key = generate_payload_key();
        let hashes = vec![vec![1u8; 32], vec![2u8; 32]];
        let sig1 = root_signature(&key, &hashes);
        let sig2 = root_signature(&key, &hashes);
        assert_eq!(sig1, sig2);
    }

    #[test]
    fn root_signature_verifies_and_detects_tamper() {
        let key = generate_payload_key();
        let hashes = vec![vec![1u8; 32], vec![2u8; 32]];
        let sig_b64 = b64_encode(&root_signature(&key, &hashes));
        assert!(verify_root_signature(&key, &hashes, &sig_b64).unwrap());

        let other_hashes = vec![vec![1u8; 32], vec![9u8; 32]];
        assert!(!verify_root_signature(&key, &other_hashes, &sig_b64).unwrap());
    }

    #[test]
    fn rsa_oaep_round_trip() {
        let (private, public) = generate_rsa_keypair(2048).unwrap();
        let key = generate_payload_key();
        let wrapped = rsa_oaep_wrap(&public, &key).unwrap();
        let unwrapped = rsa_oaep_unwrap(&private, &wrapped).unwrap();
        assert_eq!(key, unwrapped);
    }

    #[test]
    fn rsa_sign_verify_round_trip() {
        let (private, public) = generate_rsa_keypair(2048).unwrap();
        let data = b"request token claims";
        let sig = rsa_pkcs1_sha256_sign(&private, data).unwrap();
        rsa_pkcs1_sha256_verify(&public, data, &sig).unwrap();

        let tampered = b"different claims";
        assert!(rsa_pkcs1_sha256_verify(&public, tampered, &sig).is_err());
    }

    #[test]
    fn pem_round_trip() {
        let (_, public) = generate_rsa_keypair(2048).unwrap();
        let pem = rsa_public_key_to_pem(&public).unwrap();
        assert!(pem.contains("PUBLIC KEY"));
        let parsed = rsa_public_key_from_pem(&pem).unwrap();
        assert_eq!(parsed, public);
    }

    #[test]
    fn metadata_round_trip() {
        let key = generate_payload_key();
        let (ct, iv) = encrypt_metadata(&key, b"{\"note\":\"hi\"}").unwrap();
        let pt = decrypt_metadata(&key, &ct, &iv).unwrap();
        assert_eq!(pt, b"{\"note\":\"hi\"}");
    }

    #[test]
    fn b64_round_trip() {
        let raw = b"random bytes \x00\x01\xff";
        let encoded = b64_encode(raw);
        let decoded = b64_decode(&encoded).unwrap();
        assert_eq!(decoded, raw);
    }
}
