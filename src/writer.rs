//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: trustedge — Privacy and trust at the edge.
//

//! Segmented AEAD writer (C5): splits plaintext into fixed-size segments,
//! encrypts each under AES-256-GCM, and assembles the signed manifest and
//! container.

use std::sync::Arc;

use futures_util::stream::{self, StreamExt};

use crate::cancel::CancellationToken;
use crate::chunker::Chunker;
use crate::container;
use crate::crypto::{self, SegmentHashAlg, PAYLOAD_KEY_LEN};
use crate::error::{ContainerError, Tdf3Error};
use crate::kas::KasClient;
use crate::manifest::{
    EncryptionInformation, EncryptionMethod, IntegrityInformation, Manifest, PayloadReference, RootSignature, Segment,
    SegmentHashAlgName,
};
use crate::policy::{self, KasTarget};

pub const MIN_SEGMENT_SIZE: u64 = 16 * 1024;
pub const MAX_SEGMENT_SIZE: u64 = 4 * 1024 * 1024;
pub const DEFAULT_SEGMENT_SIZE: u64 = 1_000_000;
pub const MAX_SEGMENT_COUNT: u64 = 10_000;
pub const DEFAULT_BYTE_LIMIT_ZIP: u64 = 64_000_000_000;
pub const DEFAULT_QUEUE_SIZE: usize = 4;

type ProgressSink = Box<dyn Fn(u64) + Send + Sync>;

/// Immutable, validated writer configuration (spec §9 "Builder with optional
/// fields": a plain record reached through a fallible `build()`, not a
/// fluent method-chaining API over mutable state).
pub struct WriterConfig {
    pub segment_size: u64,
    pub segment_hash_alg: SegmentHashAlg,
    pub mime_type: String,
    pub byte_limit: u64,
    pub queue_size: usize,
    pub progress: Option<ProgressSink>,
}

/// Builds a [`WriterConfig`], validating fields only at [`build`](Self::build).
#[derive(Default)]
pub struct WriterConfigBuilder {
    segment_size: Option<u64>,
    segment_hash_alg: Option<SegmentHashAlg>,
    mime_type: Option<String>,
    byte_limit: Option<u64>,
    queue_size: Option<usize>,
    progress: Option<ProgressSink>,
}

impl WriterConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn segment_size(mut self, size: u64) -> Self {
        self.segment_size = Some(size);
        self
    }

    pub fn segment_hash_alg(mut self, alg: SegmentHashAlg) -> Self {
        self.segment_hash_alg = Some(alg);
        self
    }

    pub fn mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn byte_limit(mut self, limit: u64) -> Self {
        self.byte_limit = Some(limit);
        self
    }

    pub fn queue_size(mut self, size: usize) -> Self {
        self.queue_size = Some(size);
        self
    }

    pub fn progress(mut self, callback: impl Fn(u64) + Send + Sync + 'static) -> Self {
        self.progress = Some(Box::new(callback));
        self
    }

    pub fn build(self) -> Result<WriterConfig, Tdf3Error> {
        let segment_size = self.segment_size.unwrap_or(DEFAULT_SEGMENT_SIZE);
        if !(MIN_SEGMENT_SIZE..=MAX_SEGMENT_SIZE).contains(&segment_size) {
            return Err(Tdf3Error::Config(format!(
                "segment_size must be between {MIN_SEGMENT_SIZE} and {MAX_SEGMENT_SIZE} bytes, got {segment_size}"
            )));
        }
        let queue_size = self.queue_size.unwrap_or(DEFAULT_QUEUE_SIZE);
        if queue_size == 0 {
            return Err(Tdf3Error::Config("queue_size must be at least 1".to_string()));
        }
        Ok(WriterConfig {
            segment_size,
            segment_hash_alg: self.segment_hash_alg.unwrap_or(SegmentHashAlg::Hs256),
            mime_type: self.mime_type.unwrap_or_else(|| "application/octet-stream".to_string()),
            byte_limit: self.byte_limit.unwrap_or(DEFAULT_BYTE_LIMIT_ZIP),
            queue_size,
            progress: self.progress,
        })
    }
}

/// Everything needed to encrypt one object (spec §4.4 "Inputs").
pub struct EncryptRequest<'a> {
    pub plaintext: Arc<dyn Chunker>,
    pub config: &'a WriterConfig,
    pub policy_b64: String,
    pub kas_targets: Vec<KasTarget>,
    pub kas_client: Option<&'a KasClient>,
    pub plaintext_metadata: Option<Vec<u8>>,
    pub payload_key: Option<[u8; PAYLOAD_KEY_LEN]>,
}

struct EncryptedSegment {
    ciphertext: Vec<u8>,
    raw_hash: Vec<u8>,
    segment: Segment,
}

/// Encrypt `request.plaintext` and return a complete TDF3 container (spec
/// §4.4 steps 1-5).
pub async fn encrypt(request: EncryptRequest<'_>, cancel: &CancellationToken) -> Result<Vec<u8>, Tdf3Error> {
    let EncryptRequest {
        plaintext,
        config,
        policy_b64,
        kas_targets,
        kas_client,
        plaintext_metadata,
        payload_key,
    } = request;

    let payload_key = payload_key.unwrap_or_else(crypto::generate_payload_key);
    let total_len = plaintext.len().map_err(|e| Tdf3Error::Source(e))?;

    if total_len > config.byte_limit {
        return Err(Tdf3Error::Container(ContainerError::PayloadTooLarge { limit: config.byte_limit }));
    }

    let segment_count = if total_len == 0 {
        1
    } else {
        (total_len + config.segment_size - 1) / config.segment_size
    };
    if segment_count > MAX_SEGMENT_COUNT {
        return Err(Tdf3Error::Config(format!(
            "plaintext requires {segment_count} segments, exceeding the {MAX_SEGMENT_COUNT} segment limit"
        )));
    }

    let segment_hash_alg = config.segment_hash_alg;
    let segment_size = config.segment_size;
    let plaintext_ref = Arc::clone(&plaintext);

    let encrypted_segments: Vec<EncryptedSegment> = stream::iter(0..segment_count)
        .map(|index| {
            let plaintext = Arc::clone(&plaintext_ref);
            let cancel = cancel.clone();
            async move {
                if cancel.is_cancelled() {
                    return Err(Tdf3Error::Aborted);
                }
                let start = index * segment_size;
                let end = (start + segment_size).min(total_len);
                let chunk = plaintext.read(Some(start as i64), Some(end as i64)).map_err(Tdf3Error::Source)?;

                let ciphertext = crypto::encrypt_segment(&payload_key, &chunk).map_err(Tdf3Error::Crypto)?;
                let hash = crypto::segment_integrity_hash(segment_hash_alg, &payload_key, &ciphertext).map_err(Tdf3Error::Crypto)?;

                Ok::<EncryptedSegment, Tdf3Error>(EncryptedSegment {
                    segment: Segment {
                        plaintext_size: chunk.len() as u64,
                        ciphertext_size: ciphertext.len() as u64,
                        hash: crypto::b64_encode(&hash),
                    },
                    raw_hash: hash,
                    ciphertext,
                })
            }
        })
        .buffered(config.queue_size)
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

    if cancel.is_cancelled() {
        return Err(Tdf3Error::Aborted);
    }

    let mut payload_bytes = Vec::with_capacity(total_len as usize + encrypted_segments.len() * (crypto::IV_LEN + crypto::TAG_LEN));
    let mut segments = Vec::with_capacity(encrypted_segments.len());
    let mut raw_hashes = Vec::with_capacity(encrypted_segments.len());
    let mut processed: u64 = 0;

    for encrypted in encrypted_segments {
        payload_bytes.extend_from_slice(&encrypted.ciphertext);
        processed += encrypted.segment.plaintext_size;
        segments.push(encrypted.segment);
        raw_hashes.push(encrypted.raw_hash);
        if let Some(progress) = &config.progress {
            progress(processed);
        }
    }

    let root_sig = crypto::root_signature(&payload_key, &raw_hashes);

    let key_access = policy::build_key_access(&kas_targets, &payload_key, &policy_b64, plaintext_metadata.as_deref(), kas_client, cancel)
        .await
        .map_err(Tdf3Error::Crypto)?;

    let manifest = Manifest {
        payload: PayloadReference {
            kind: "reference".to_string(),
            url: container::PAYLOAD_ENTRY_NAME.to_string(),
            protocol: "zip".to_string(),
            mime_type: config.mime_type.clone(),
            is_encrypted: true,
        },
        encryption_information: EncryptionInformation {
            kind: "split".to_string(),
            key_access,
            method: EncryptionMethod::default(),
            integrity_information: IntegrityInformation {
                root_signature: RootSignature {
                    alg: "HS256".to_string(),
                    sig: crypto::b64_encode(&root_sig),
                },
                segment_hash_alg: SegmentHashAlgName { name: segment_hash_alg.manifest_name().to_string() },
                segment_size_default: segment_size,
                encrypted_segment_size_default: segment_size + (crypto::IV_LEN + crypto::TAG_LEN) as u64,
                segments,
            },
            policy: policy_b64,
        },
    };

    let manifest_json = manifest.to_json().map_err(Tdf3Error::Manifest)?;

    let mut container_bytes = Vec::new();
    container::write_container(&mut container_bytes, &payload_bytes, manifest_json.as_bytes()).map_err(Tdf3Error::Container)?;
    Ok(container_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::BufferChunker;
    use crate::manifest::PolicyObject;

    fn make_policy_b64() -> String {
        PolicyObject::new("uuid-1", vec!["attr:classification/public".to_string()], vec!["alice@example.com".to_string()])
            .to_canonical_b64()
            .unwrap()
    }

    #[tokio::test]
    async fn tiny_payload_yields_one_segment() {
        let (_, public) = crypto::generate_rsa_keypair(2048).unwrap();
        let config = WriterConfigBuilder::new().build().unwrap();
        let cancel = CancellationToken::new();

        let request = EncryptRequest {
            plaintext: Arc::new(BufferChunker::new(b"hello world".to_vec())),
            config: &config,
            policy_b64: make_policy_b64(),
            kas_targets: vec![KasTarget::wrapped("https://kas.example.com", public)],
            kas_client: None,
            plaintext_metadata: None,
            payload_key: None,
        };

        let container_bytes = encrypt(request, &cancel).await.unwrap();
        let reader = container::ContainerReader::open(Arc::new(BufferChunker::new(container_bytes))).unwrap();
        let manifest = Manifest::from_json(&String::from_utf8(reader.read_entry(container::MANIFEST_ENTRY_NAME).unwrap()).unwrap()).unwrap();

        let segments = &manifest.encryption_information.integrity_information.segments;
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].plaintext_size, 11);
        assert_eq!(segments[0].ciphertext_size, 39);
    }

    #[tokio::test]
    async fn large_payload_splits_into_two_segments() {
        let (_, public) = crypto::generate_rsa_keypair(2048).unwrap();
        let config = WriterConfigBuilder::new().segment_size(1_000_000).build().unwrap();
        let cancel = CancellationToken::new();
        let plaintext = vec![0u8; 1_500_000];

        let request = EncryptRequest {
            plaintext: Arc::new(BufferChunker::new(plaintext)),
            config: &config,
            policy_b64: make_policy_b64(),
            kas_targets: vec![KasTarget::wrapped("https://kas.example.com", public)],
            kas_client: None,
            plaintext_metadata: None,
            payload_key: None,
        };

        let container_bytes = encrypt(request, &cancel).await.unwrap();
        let reader = container::ContainerReader::open(Arc::new(BufferChunker::new(container_bytes))).unwrap();
        let manifest = Manifest::from_json(&String::from_utf8(reader.read_entry(container::MANIFEST_ENTRY_NAME).unwrap()).unwrap()).unwrap();

        let segments = &manifest.encryption_information.integrity_information.segments;
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].plaintext_size, 1_000_000);
        assert_eq!(segments[1].plaintext_size, 500_000);
    }

    #[tokio::test]
    async fn oversized_plaintext_is_rejected() {
        let (_, public) = crypto::generate_rsa_keypair(2048).unwrap();
        let config = WriterConfigBuilder::new().byte_limit(100).build().unwrap();
        let cancel = CancellationToken::new();

        let request = EncryptRequest {
            plaintext: Arc::new(BufferChunker::new(vec![0u8; 200])),
            config: &config,
            policy_b64: make_policy_b64(),
            kas_targets: vec![KasTarget::wrapped("https://kas.example.com", public)],
            kas_client: None,
            plaintext_metadata: None,
            payload_key: None,
        };

        assert!(matches!(encrypt(request, &cancel).await, Err(Tdf3Error::Container(ContainerError::PayloadTooLarge { .. }))));
    }

    #[tokio::test]
    async fn invalid_segment_size_is_rejected_at_build() {
        assert!(WriterConfigBuilder::new().segment_size(8).build().is_err());
        assert!(WriterConfigBuilder::new().segment_size(MAX_SEGMENT_SIZE + 1).build().is_err());
    }
}
