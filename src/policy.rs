//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: trustedge — Privacy and trust at the edge.
//

//! Policy binder / key-access builder (C8): wraps the payload key for one
//! or more KAS targets and emits the manifest's `keyAccess` array.

use rsa::RsaPublicKey;

use crate::cancel::CancellationToken;
use crate::crypto::{self, PAYLOAD_KEY_LEN};
use crate::error::CryptoError;
use crate::kas::KasClient;
use crate::manifest::{KeyAccessObject, KeyAccessType};

/// One KAS entry the payload key should be bound to.
pub struct KasTarget {
    pub url: String,
    pub public_key: RsaPublicKey,
    pub kind: KeyAccessType,
}

impl KasTarget {
    pub fn wrapped(url: impl Into<String>, public_key: RsaPublicKey) -> Self {
        Self { url: url.into(), public_key, kind: KeyAccessType::Wrapped }
    }

    pub fn remote(url: impl Into<String>, public_key: RsaPublicKey) -> Self {
        Self { url: url.into(), public_key, kind: KeyAccessType::Remote }
    }
}

/// Build the `keyAccess` array for a payload key against one or more KAS
/// targets (spec §4.7). For `remote` targets, `kas_client` is used to
/// upsert the wrapped key to KAS and the wrapped key is omitted from the
/// manifest; for `wrapped` targets the wrapped key is stored inline.
///
/// `metadata`, if present, is AES-256-GCM-encrypted under the payload key
/// with a fresh IV and bundled into `encryptedMetadata` as
/// `base64(iv || ciphertext || tag)`.
pub async fn build_key_access(
    targets: &[KasTarget],
    payload_key: &[u8; PAYLOAD_KEY_LEN],
    policy_b64: &str,
    metadata: Option<&[u8]>,
    kas_client: Option<&KasClient>,
    cancel: &CancellationToken,
) -> Result<Vec<KeyAccessObject>, CryptoError> {
    let policy_binding = crypto::b64_encode(&crypto::policy_binding_raw(payload_key, policy_b64));

    let encrypted_metadata = match metadata {
        Some(plaintext) => {
            let (ciphertext, iv) = crypto::encrypt_metadata(payload_key, plaintext)?;
            let mut bundle = Vec::with_capacity(iv.len() + ciphertext.len());
            bundle.extend_from_slice(&iv);
            bundle.extend_from_slice(&ciphertext);
            Some(crypto::b64_encode(&bundle))
        }
        None => None,
    };

    let mut result = Vec::with_capacity(targets.len());
    for target in targets {
        let wrapped = crypto::rsa_oaep_wrap(&target.public_key, payload_key)?;
        let wrapped_b64 = crypto::b64_encode(&wrapped);

        let kao = match target.kind {
            KeyAccessType::Wrapped => KeyAccessObject {
                kind: KeyAccessType::Wrapped,
                url: target.url.clone(),
                protocol: KeyAccessObject::protocol_name().to_string(),
                wrapped_key: Some(wrapped_b64),
                policy_binding: policy_binding.clone(),
                encrypted_metadata: encrypted_metadata.clone(),
            },
            KeyAccessType::Remote => {
                let kao_for_upsert = KeyAccessObject {
                    kind: KeyAccessType::Remote,
                    url: target.url.clone(),
                    protocol: KeyAccessObject::protocol_name().to_string(),
                    wrapped_key: Some(wrapped_b64),
                    policy_binding: policy_binding.clone(),
                    encrypted_metadata: encrypted_metadata.clone(),
                };
                if let Some(client) = kas_client {
                    client
                        .upsert(&kao_for_upsert, policy_b64, cancel)
                        .await
                        .map_err(|e| CryptoError::WrapFailed(format!("remote upsert failed: {e}")))?;
                }
                KeyAccessObject {
                    kind: KeyAccessType::Remote,
                    url: target.url.clone(),
                    protocol: KeyAccessObject::protocol_name().to_string(),
                    wrapped_key: None,
                    policy_binding: policy_binding.clone(),
                    encrypted_metadata: encrypted_metadata.clone(),
                }
            }
        };
        result.push(kao);
    }
    Ok(result)
}

/// Decrypt a KAO's `encryptedMetadata` bundle (`iv || ciphertext || tag`,
/// base64) under the recovered payload key.
pub fn decrypt_key_access_metadata(payload_key: &[u8; PAYLOAD_KEY_LEN], encrypted_metadata_b64: &str) -> Result<Vec<u8>, CryptoError> {
    let bundle = crypto::b64_decode(encrypted_metadata_b64)
        .map_err(|e| CryptoError::DecryptionFailed(format!("bad base64 in encryptedMetadata: {e}")))?;
    if bundle.len() < crypto::IV_LEN {
        return Err(CryptoError::DecryptionFailed("encryptedMetadata shorter than IV".to_string()));
    }
    let (iv, ciphertext) = bundle.split_at(crypto::IV_LEN);
    let iv: [u8; crypto::IV_LEN] = iv.try_into().expect("split_at guarantees length");
    crypto::decrypt_metadata(payload_key, ciphertext, &iv)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wrapped_target_embeds_key_and_binds_policy() {
        let (_, public) = crypto::generate_rsa_keypair(2048).unwrap();
        let payload_key = crypto::generate_payload_key();
        let policy_b64 = "eyJ1dWlkIjoiYSJ9";
        let targets = vec![KasTarget::wrapped("https://kas.example.com", public)];
        let cancel = CancellationToken::new();

        let kaos = build_key_access(&targets, &payload_key, policy_b64, None, None, &cancel).await.unwrap();
        assert_eq!(kaos.len(), 1);
        assert!(kaos[0].wrapped_key.is_some());
        let expected_binding = crypto::b64_encode(&crypto::policy_binding_raw(&payload_key, policy_b64));
        assert_eq!(kaos[0].policy_binding, expected_binding);
    }

    #[tokio::test]
    async fn multiple_targets_share_one_policy_binding() {
        let (_, public_a) = crypto::generate_rsa_keypair(2048).unwrap();
        let (_, public_b) = crypto::generate_rsa_keypair(2048).unwrap();
        let payload_key = crypto::generate_payload_key();
        let policy_b64 = "eyJ1dWlkIjoiYSJ9";
        let targets = vec![
            KasTarget::wrapped("https://kas-a.example.com", public_a),
            KasTarget::wrapped("https://kas-b.example.com", public_b),
        ];
        let cancel = CancellationToken::new();

        let kaos = build_key_access(&targets, &payload_key, policy_b64, None, None, &cancel).await.unwrap();
        assert_eq!(kaos[0].policy_binding, kaos[1].policy_binding);
    }

    #[tokio::test]
    async fn metadata_round_trips_through_encrypted_metadata_field() {
        let (_, public) = crypto::generate_rsa_keypair(2048).unwrap();
        let payload_key = crypto::generate_payload_key();
        let targets = vec![KasTarget::wrapped("https://kas.example.com", public)];
        let cancel = CancellationToken::new();

        let kaos = build_key_access(&targets, &payload_key, "cG9saWN5", Some(b"{\"note\":\"hi\"}"), None, &cancel)
            .await
            .unwrap();
        let metadata = decrypt_key_access_metadata(&payload_key, kaos[0].encrypted_metadata.as_ref().unwrap()).unwrap();
        assert_eq!(metadata, b"{\"note\":\"hi\"}");
    }
}
