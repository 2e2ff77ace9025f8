//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: trustedge — Privacy and trust at the edge.
//

//! Segmented AEAD reader (C6): opens a container, performs rewrap against
//! KAS, verifies policy bindings and the root signature, then decrypts on
//! demand with random access or streaming order.

use std::sync::Arc;

use crate::cancel::CancellationToken;
use crate::chunker::Chunker;
use crate::container::{self, ContainerReader};
use crate::crypto::{self, PAYLOAD_KEY_LEN};
use crate::error::{CryptoError, PolicyError, Tdf3Error};
use crate::kas::KasClient;
use crate::manifest::{KeyAccessObject, Manifest};
use crate::secret::Secret;

/// Per-segment plaintext/ciphertext byte offsets, derived from the
/// manifest's `segments` array.
struct SegmentLayout {
    plaintext_start: u64,
    plaintext_end: u64,
    ciphertext_start: u64,
    ciphertext_end: u64,
}

fn segment_layouts(manifest: &Manifest) -> Vec<SegmentLayout> {
    let mut plaintext_offset = 0u64;
    let mut ciphertext_offset = 0u64;
    manifest
        .encryption_information
        .integrity_information
        .segments
        .iter()
        .map(|segment| {
            let layout = SegmentLayout {
                plaintext_start: plaintext_offset,
                plaintext_end: plaintext_offset + segment.plaintext_size,
                ciphertext_start: ciphertext_offset,
                ciphertext_end: ciphertext_offset + segment.ciphertext_size,
            };
            plaintext_offset += segment.plaintext_size;
            ciphertext_offset += segment.ciphertext_size;
            layout
        })
        .collect()
}

/// Opens a TDF3 container and exposes the locked-then-unlocked read path.
pub struct TdfReader {
    container: ContainerReader,
    manifest: Manifest,
    payload_key: Option<Secret<[u8; PAYLOAD_KEY_LEN]>>,
}

impl TdfReader {
    /// Open the container and parse its manifest (spec §4.5 step 1). The
    /// payload key is not yet recovered; call [`TdfReader::unlock`] before
    /// any decrypt operation.
    pub fn open(chunker: Arc<dyn Chunker>) -> Result<Self, Tdf3Error> {
        let container = ContainerReader::open(chunker).map_err(Tdf3Error::Container)?;
        let manifest_bytes = container.read_entry(container::MANIFEST_ENTRY_NAME).map_err(Tdf3Error::Container)?;
        let manifest_json = String::from_utf8(manifest_bytes)
            .map_err(|e| Tdf3Error::Manifest(crate::error::ManifestError::InvalidField(format!("manifest is not valid UTF-8: {e}"))))?;
        let manifest = Manifest::from_json(&manifest_json).map_err(Tdf3Error::Manifest)?;
        Ok(Self { container, manifest, payload_key: None })
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Mutable access to the parsed manifest, primarily for tests that need
    /// to exercise tamper-detection paths without re-encoding a container.
    pub fn manifest_mut(&mut self) -> &mut Manifest {
        &mut self.manifest
    }

    fn select_kao(&self, kas_url: Option<&str>) -> Result<&KeyAccessObject, Tdf3Error> {
        let key_access = &self.manifest.encryption_information.key_access;
        let kao = match kas_url {
            Some(url) => key_access.iter().find(|k| k.url == url),
            None => key_access.first(),
        };
        kao.ok_or(Tdf3Error::Policy(PolicyError::NoMatchingKeyAccess))
    }

    /// Recover the payload key via rewrap (spec §4.5 step 2), then verify
    /// every policy binding (step 3) and the root signature (step 4). No
    /// plaintext is released if either check fails.
    pub async fn unlock(&mut self, kas_client: &KasClient, kas_url: Option<&str>, cancel: &CancellationToken) -> Result<(), Tdf3Error> {
        let kao = self.select_kao(kas_url)?.clone();
        let policy_b64 = self.manifest.encryption_information.policy.clone();

        let rewrap_result = kas_client.rewrap(&kao, &policy_b64, cancel).await.map_err(Tdf3Error::Kas)?;
        let payload_key = *rewrap_result.payload_key.expose_secret();

        for (index, candidate) in self.manifest.encryption_information.key_access.iter().enumerate() {
            let ok = crypto::verify_policy_binding(&payload_key, &policy_b64, &candidate.policy_binding).map_err(Tdf3Error::Crypto)?;
            if !ok {
                return Err(Tdf3Error::Policy(PolicyError::BindingMismatch { index }));
            }
        }

        self.verify_root_signature(&payload_key)?;

        self.payload_key = Some(Secret::new(payload_key));
        Ok(())
    }

    /// Same as [`TdfReader::unlock`] but for an already-recovered payload
    /// key (offline verification, or a caller that performed rewrap
    /// out-of-band).
    pub fn unlock_with_payload_key(&mut self, payload_key: [u8; PAYLOAD_KEY_LEN]) -> Result<(), Tdf3Error> {
        let policy_b64 = self.manifest.encryption_information.policy.clone();
        for (index, candidate) in self.manifest.encryption_information.key_access.iter().enumerate() {
            let ok = crypto::verify_policy_binding(&payload_key, &policy_b64, &candidate.policy_binding).map_err(Tdf3Error::Crypto)?;
            if !ok {
                return Err(Tdf3Error::Policy(PolicyError::BindingMismatch { index }));
            }
        }
        self.verify_root_signature(&payload_key)?;
        self.payload_key = Some(Secret::new(payload_key));
        Ok(())
    }

    fn verify_root_signature(&self, payload_key: &[u8; PAYLOAD_KEY_LEN]) -> Result<(), Tdf3Error> {
        let raw_hashes = self.manifest.raw_segment_hashes().map_err(Tdf3Error::Manifest)?;
        let stored = &self.manifest.encryption_information.integrity_information.root_signature.sig;
        let ok = crypto::verify_root_signature(payload_key, &raw_hashes, stored).map_err(Tdf3Error::Crypto)?;
        if !ok {
            return Err(Tdf3Error::Crypto(CryptoError::RootSignatureMismatch));
        }
        Ok(())
    }

    fn payload_key(&self) -> Result<&[u8; PAYLOAD_KEY_LEN], Tdf3Error> {
        self.payload_key
            .as_ref()
            .map(Secret::expose_secret)
            .ok_or_else(|| Tdf3Error::Config("reader is locked; call unlock() first".to_string()))
    }

    fn total_plaintext_len(&self) -> u64 {
        self.manifest
            .encryption_information
            .integrity_information
            .segments
            .iter()
            .map(|s| s.plaintext_size)
            .sum()
    }

    /// Decrypt and verify a single segment by index, returning its
    /// plaintext (spec §4.5 step 5).
    fn decrypt_segment_at(&self, index: usize, layout: &SegmentLayout, payload_key: &[u8; PAYLOAD_KEY_LEN]) -> Result<Vec<u8>, Tdf3Error> {
        let ciphertext = self
            .container
            .read_entry_range(container::PAYLOAD_ENTRY_NAME, layout.ciphertext_start, Some(layout.ciphertext_end))
            .map_err(Tdf3Error::Container)?;

        let alg_name = &self.manifest.encryption_information.integrity_information.segment_hash_alg.name;
        let alg = crypto::SegmentHashAlg::from_manifest_name(alg_name)
            .ok_or_else(|| Tdf3Error::Manifest(crate::error::ManifestError::InvalidField(format!("unknown segmentHashAlg: {alg_name}"))))?;

        let expected_hash_b64 = &self.manifest.encryption_information.integrity_information.segments[index].hash;
        let expected_hash = crypto::b64_decode(expected_hash_b64)
            .map_err(|e| Tdf3Error::Manifest(crate::error::ManifestError::Base64(e)))?;

        if !crypto::verify_segment_integrity_hash(alg, payload_key, &ciphertext, &expected_hash) {
            return Err(Tdf3Error::Crypto(CryptoError::SegmentHashMismatch { index }));
        }

        crypto::decrypt_segment(payload_key, &ciphertext).map_err(Tdf3Error::Crypto)
    }

    /// Decrypt the plaintext window `[lo, hi)` (spec §4.5 step 5, §8 "Random
    /// access"). Computes the covering segment range, verifies each
    /// touched segment's hash, decrypts it, then splices the requested
    /// window. Any integrity failure aborts before any plaintext is
    /// returned.
    pub fn read_range(&self, lo: u64, hi: u64) -> Result<Vec<u8>, Tdf3Error> {
        let payload_key = *self.payload_key()?;
        let total_len = self.total_plaintext_len();
        if lo > hi || hi > total_len {
            return Err(Tdf3Error::Config(format!("range [{lo}, {hi}) out of bounds for payload of length {total_len}")));
        }
        if lo == hi {
            return Ok(Vec::new());
        }

        let layouts = segment_layouts(&self.manifest);
        let mut decrypted_segments: Vec<(usize, &SegmentLayout, Vec<u8>)> = Vec::new();
        for (index, layout) in layouts.iter().enumerate() {
            if layout.plaintext_end <= lo || layout.plaintext_start >= hi {
                continue;
            }
            let plaintext = self.decrypt_segment_at(index, layout, &payload_key)?;
            decrypted_segments.push((index, layout, plaintext));
        }

        let mut out = Vec::with_capacity((hi - lo) as usize);
        for (_, layout, plaintext) in decrypted_segments {
            let window_start = lo.max(layout.plaintext_start) - layout.plaintext_start;
            let window_end = hi.min(layout.plaintext_end) - layout.plaintext_start;
            out.extend_from_slice(&plaintext[window_start as usize..window_end as usize]);
        }
        Ok(out)
    }

    /// Decrypt the full payload, one segment at a time and strictly in
    /// increasing offset order (spec §4.5 step 6, §5 ordering guarantee).
    /// `sink` is called once per segment with its verified plaintext; a
    /// hash mismatch poisons the stream by returning an error from this
    /// call without invoking `sink` again.
    pub fn read_all_streaming(&self, mut sink: impl FnMut(&[u8]) -> Result<(), Tdf3Error>) -> Result<(), Tdf3Error> {
        let payload_key = *self.payload_key()?;
        let layouts = segment_layouts(&self.manifest);
        for (index, layout) in layouts.iter().enumerate() {
            let plaintext = self.decrypt_segment_at(index, layout, &payload_key)?;
            sink(&plaintext)?;
        }
        Ok(())
    }

    pub fn total_len(&self) -> u64 {
        self.total_plaintext_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::BufferChunker;
    use crate::manifest::PolicyObject;
    use crate::policy::KasTarget;
    use crate::writer::{self, EncryptRequest, WriterConfigBuilder};

    fn policy_b64() -> String {
        PolicyObject::new("uuid-1", vec!["attr:classification/public".to_string()], vec!["alice@example.com".to_string()])
            .to_canonical_b64()
            .unwrap()
    }

    async fn build_container(plaintext: Vec<u8>, segment_size: u64) -> (Vec<u8>, [u8; PAYLOAD_KEY_LEN]) {
        let (_, public) = crypto::generate_rsa_keypair(2048).unwrap();
        let config = WriterConfigBuilder::new().segment_size(segment_size).build().unwrap();
        let cancel = CancellationToken::new();
        let payload_key = crypto::generate_payload_key();

        let request = EncryptRequest {
            plaintext: Arc::new(BufferChunker::new(plaintext)),
            config: &config,
            policy_b64: policy_b64(),
            kas_targets: vec![KasTarget::wrapped("https://kas.example.com", public)],
            kas_client: None,
            plaintext_metadata: None,
            payload_key: Some(payload_key),
        };

        (writer::encrypt(request, &cancel).await.unwrap(), payload_key)
    }

    #[tokio::test]
    async fn round_trip_via_unlock_with_payload_key() {
        let (container_bytes, payload_key) = build_container(b"hello world".to_vec(), 1_000_000).await;
        let mut reader = TdfReader::open(Arc::new(BufferChunker::new(container_bytes))).unwrap();
        reader.unlock_with_payload_key(payload_key).unwrap();
        assert_eq!(reader.read_range(0, 11).unwrap(), b"hello world".to_vec());
    }

    #[tokio::test]
    async fn random_access_range_over_two_segments() {
        let plaintext = vec![0u8; 1_500_000];
        let (container_bytes, payload_key) = build_container(plaintext, 1_000_000).await;
        let mut reader = TdfReader::open(Arc::new(BufferChunker::new(container_bytes))).unwrap();
        reader.unlock_with_payload_key(payload_key).unwrap();
        let slice = reader.read_range(999_990, 1_000_010).unwrap();
        assert_eq!(slice.len(), 20);
        assert!(slice.iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn tamper_in_payload_fails_with_segment_hash_mismatch() {
        let (mut container_bytes, payload_key) = build_container(vec![0u8; 1_500_000], 1_000_000).await;
        let tamper_offset = container_bytes.len() / 4;
        container_bytes[tamper_offset] ^= 0xFF;

        let reader_result = TdfReader::open(Arc::new(BufferChunker::new(container_bytes)));
        if let Ok(mut reader) = reader_result {
            if reader.unlock_with_payload_key(payload_key).is_ok() {
                assert!(matches!(reader.read_range(0, 20), Err(Tdf3Error::Crypto(CryptoError::SegmentHashMismatch { .. }))));
            }
        }
    }

    #[tokio::test]
    async fn policy_tamper_fails_with_binding_mismatch() {
        let (container_bytes, payload_key) = build_container(b"hello world".to_vec(), 1_000_000).await;
        let mut reader = TdfReader::open(Arc::new(BufferChunker::new(container_bytes))).unwrap();
        reader.manifest.encryption_information.policy = PolicyObject::new("uuid-2", vec!["attr:classification/secret".to_string()], vec![])
            .to_canonical_b64()
            .unwrap();

        assert!(matches!(
            reader.unlock_with_payload_key(payload_key),
            Err(Tdf3Error::Policy(PolicyError::BindingMismatch { .. }))
        ));
    }

    #[tokio::test]
    async fn streaming_read_emits_segments_in_order() {
        let plaintext = vec![7u8; 1_500_000];
        let (container_bytes, payload_key) = build_container(plaintext.clone(), 1_000_000).await;
        let mut reader = TdfReader::open(Arc::new(BufferChunker::new(container_bytes))).unwrap();
        reader.unlock_with_payload_key(payload_key).unwrap();

        let mut collected = Vec::new();
        reader
            .read_all_streaming(|chunk| {
                collected.extend_from_slice(chunk);
                Ok(())
            })
            .unwrap();
        assert_eq!(collected, plaintext);
    }
}
