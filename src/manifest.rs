//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: trustedge — Privacy and trust at the edge.
//

//! Typed manifest model (C4): strict (de)serialization of the TDF3 manifest
//! JSON, and the policy object it carries base64-encoded.

use serde::{Deserialize, Serialize};

use crate::error::ManifestError;

/// A single data attribute reference inside a [`PolicyBody`].
pub type Attribute = String;

/// `PolicyObject` — the access-control policy bound to a payload key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PolicyObject {
    pub uuid: String,
    pub body: PolicyBody,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PolicyBody {
    #[serde(rename = "dataAttributes")]
    pub data_attributes: Vec<Attribute>,
    pub dissem: Vec<String>,
}

impl PolicyObject {
    pub fn new(uuid: impl Into<String>, data_attributes: Vec<Attribute>, dissem: Vec<String>) -> Self {
        Self {
            uuid: uuid.into(),
            body: PolicyBody { data_attributes, dissem },
        }
    }

    /// Serialize and base64-encode this policy for embedding in
    /// `encryptionInformation.policy`. This base64 text, once produced, is
    /// the canonical signing form (spec §4.3): it is never re-derived from a
    /// parsed struct during HMAC computation.
    pub fn to_canonical_b64(&self) -> Result<String, ManifestError> {
        let json = serde_json::to_vec(self)?;
        Ok(crate::crypto::b64_encode(&json))
    }

    pub fn from_canonical_b64(b64: &str) -> Result<Self, ManifestError> {
        let json = crate::crypto::b64_decode(b64)?;
        Ok(serde_json::from_slice(&json)?)
    }
}

/// `type ∈ {"wrapped", "remote"}` per spec §3.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KeyAccessType {
    Wrapped,
    Remote,
}

/// `KeyAccessObject` — binds the payload key to one KAS entry and the
/// manifest's policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct KeyAccessObject {
    #[serde(rename = "type")]
    pub kind: KeyAccessType,
    pub url: String,
    pub protocol: String,
    #[serde(rename = "wrappedKey", skip_serializing_if = "Option::is_none")]
    pub wrapped_key: Option<String>,
    #[serde(rename = "policyBinding")]
    pub policy_binding: String,
    #[serde(rename = "encryptedMetadata", skip_serializing_if = "Option::is_none")]
    pub encrypted_metadata: Option<String>,
}

impl KeyAccessObject {
    pub fn protocol_name() -> &'static str {
        "kas"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EncryptionMethod {
    pub algorithm: String,
    pub iv: String,
}

impl Default for EncryptionMethod {
    fn default() -> Self {
        Self {
            algorithm: "AES-256-GCM".to_string(),
            iv: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RootSignature {
    pub alg: String,
    pub sig: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SegmentHashAlgName {
    pub name: String,
}

/// A single payload segment's size and integrity record (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Segment {
    #[serde(rename = "plaintext_size")]
    pub plaintext_size: u64,
    #[serde(rename = "ciphertext_size")]
    pub ciphertext_size: u64,
    pub hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct IntegrityInformation {
    #[serde(rename = "rootSignature")]
    pub root_signature: RootSignature,
    #[serde(rename = "segmentHashAlg")]
    pub segment_hash_alg: SegmentHashAlgName,
    #[serde(rename = "segmentSizeDefault")]
    pub segment_size_default: u64,
    #[serde(rename = "encryptedSegmentSizeDefault")]
    pub encrypted_segment_size_default: u64,
    pub segments: Vec<Segment>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EncryptionInformation {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "keyAccess")]
    pub key_access: Vec<KeyAccessObject>,
    pub method: EncryptionMethod,
    #[serde(rename = "integrityInformation")]
    pub integrity_information: IntegrityInformation,
    /// The literal base64 policy bytes, used verbatim in every HMAC
    /// computation that references "the policy" (spec §4.3: "do not
    /// re-canonicalize").
    pub policy: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PayloadReference {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    pub protocol: String,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    #[serde(rename = "isEncrypted")]
    pub is_encrypted: bool,
}

/// The full TDF3 manifest (spec §3). Strict: unknown top-level (and nested)
/// keys are rejected by `#[serde(deny_unknown_fields)]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    pub payload: PayloadReference,
    #[serde(rename = "encryptionInformation")]
    pub encryption_information: EncryptionInformation,
}

impl Manifest {
    pub fn to_json(&self) -> Result<String, ManifestError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, ManifestError> {
        Ok(serde_json::from_str(json)?)
    }

    /// The literal policy bytes to use in every HMAC over "the policy" —
    /// never re-derived from a re-serialized [`PolicyObject`] (spec §4.3).
    pub fn policy_bytes(&self) -> &[u8] {
        self.encryption_information.policy.as_bytes()
    }

    /// Concatenated, base64-decoded segment hashes in manifest order, used
    /// to recompute the root signature (spec §3 invariant 2).
    pub fn raw_segment_hashes(&self) -> Result<Vec<Vec<u8>>, ManifestError> {
        self.encryption_information
            .integrity_information
            .segments
            .iter()
            .map(|s| crate::crypto::b64_decode(&s.hash).map_err(ManifestError::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_manifest() -> Manifest {
        Manifest {
            payload: PayloadReference {
                kind: "reference".to_string(),
                url: "0.payload".to_string(),
                protocol: "zip".to_string(),
                mime_type: "application/octet-stream".to_string(),
                is_encrypted: true,
            },
            encryption_information: EncryptionInformation {
                kind: "split".to_string(),
                key_access: vec![KeyAccessObject {
                    kind: KeyAccessType::Wrapped,
                    url: "https://kas.example.com".to_string(),
                    protocol: "kas".to_string(),
                    wrapped_key: Some("d2VsbA==".to_string()),
                    policy_binding: "cG9saWN5".to_string(),
                    encrypted_metadata: None,
                }],
                method: EncryptionMethod::default(),
                integrity_information: IntegrityInformation {
                    root_signature: RootSignature {
                        alg: "HS256".to_string(),
                        sig: "c2ln".to_string(),
                    },
                    segment_hash_alg: SegmentHashAlgName { name: "HS256".to_string() },
                    segment_size_default: 1_000_000,
                    encrypted_segment_size_default: 1_000_028,
                    segments: vec![Segment {
                        plaintext_size: 11,
                        ciphertext_size: 39,
                        hash: "aGFzaA==".to_string(),
                    }],
                },
                policy: "eyJ1dWlkIjoiYSJ9".to_string(),
            },
        }
    }

    #[test]
    fn manifest_round_trips_through_json() {
        let manifest = sample_manifest();
        let json = manifest.to_json().unwrap();
        let parsed = Manifest::from_json(&json).unwrap();
        assert_eq!(manifest, parsed);
    }

    #[test]
    fn unknown_top_level_field_is_rejected() {
        let manifest = sample_manifest();
        let mut value: serde_json::Value = serde_json::from_str(&manifest.to_json().unwrap()).unwrap();
        value
            .as_object_mut()
            .unwrap()
            .insert("extra".to_string(), serde_json::json!("surprise"));
        let err = Manifest::from_json(&value.to_string());
        assert!(err.is_err());
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let manifest = sample_manifest();
        let mut value: serde_json::Value = serde_json::from_str(&manifest.to_json().unwrap()).unwrap();
        value.as_object_mut().unwrap().remove("payload");
        assert!(Manifest::from_json(&value.to_string()).is_err());
    }

    #[test]
    fn policy_object_round_trips_through_canonical_b64() {
        let policy = PolicyObject::new("uuid-1", vec!["attr:classification/secret".to_string()], vec!["alice@example.com".to_string()]);
        let b64 = policy.to_canonical_b64().unwrap();
        let parsed = PolicyObject::from_canonical_b64(&b64).unwrap();
        assert_eq!(policy, parsed);
    }

    #[test]
    fn policy_bytes_are_the_literal_stored_text() {
        let manifest = sample_manifest();
        assert_eq!(manifest.policy_bytes(), b"eyJ1dWlkIjoiYSJ9");
    }
}
