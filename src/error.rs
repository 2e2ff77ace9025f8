//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: trustedge — Privacy and trust at the edge.
//

//! Unified error hierarchy for the TDF3 core.

use thiserror::Error;

/// Top-level unified error type for TDF3 operations.
#[derive(Error, Debug)]
pub enum Tdf3Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("chunk source error")]
    Source(#[from] SourceError),

    #[error("container error")]
    Container(#[from] ContainerError),

    #[error("manifest error")]
    Manifest(#[from] ManifestError),

    #[error("cryptographic error")]
    Crypto(#[from] CryptoError),

    #[error("policy error")]
    Policy(#[from] PolicyError),

    #[error("KAS error")]
    Kas(#[from] KasError),

    #[error("operation aborted")]
    Aborted,
}

impl Tdf3Error {
    /// A stable, machine-readable code for programmatic handling. Never
    /// includes payload key material, wrapped-key bytes, or full KAS
    /// response bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Tdf3Error::Config(_) => "config",
            Tdf3Error::Source(e) => e.code(),
            Tdf3Error::Container(e) => e.code(),
            Tdf3Error::Manifest(e) => e.code(),
            Tdf3Error::Crypto(e) => e.code(),
            Tdf3Error::Policy(e) => e.code(),
            Tdf3Error::Kas(e) => e.code(),
            Tdf3Error::Aborted => "aborted",
        }
    }
}

/// Errors from the chunk source abstraction (C2).
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("negative byte_end is not supported for this source")]
    UnsupportedRange,

    #[error("range out of bounds: start={start}, end={end}, len={len}")]
    OutOfBounds { start: u64, end: u64, len: u64 },

    #[error("transport error after retries: {0}")]
    Transport(String),
}

impl SourceError {
    pub fn code(&self) -> &'static str {
        match self {
            SourceError::Io(_) => "source.io",
            SourceError::UnsupportedRange => "source.unsupported_range",
            SourceError::OutOfBounds { .. } => "source.out_of_bounds",
            SourceError::Transport(_) => "source.transport",
        }
    }
}

/// Errors from the ZIP container reader/writer (C3).
#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("entry not found in container: {0}")]
    EntryNotFound(String),

    #[error("malformed ZIP structure: {0}")]
    Malformed(String),

    #[error("payload exceeds configured byte limit ({limit} bytes)")]
    PayloadTooLarge { limit: u64 },
}

impl ContainerError {
    pub fn code(&self) -> &'static str {
        match self {
            ContainerError::Io(_) => "container.io",
            ContainerError::EntryNotFound(_) => "container.entry_not_found",
            ContainerError::Malformed(_) => "container.malformed",
            ContainerError::PayloadTooLarge { .. } => "container.too_large",
        }
    }
}

/// Errors from manifest (de)serialization (C4).
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("unknown field: {0}")]
    UnknownField(String),

    #[error("invalid field value: {0}")]
    InvalidField(String),

    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
}

impl ManifestError {
    pub fn code(&self) -> &'static str {
        match self {
            ManifestError::Json(_) => "manifest.json",
            ManifestError::MissingField(_) => "manifest.missing_field",
            ManifestError::UnknownField(_) => "manifest.unknown_field",
            ManifestError::InvalidField(_) => "manifest.invalid_field",
            ManifestError::Base64(_) => "manifest.base64",
        }
    }
}

/// Errors from cryptographic primitives and segment-level integrity (C1, C5, C6).
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("AEAD encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("AEAD decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("segment {index} hash mismatch")]
    SegmentHashMismatch { index: usize },

    #[error("root signature mismatch")]
    RootSignatureMismatch,

    #[error("RSA wrap failed: {0}")]
    WrapFailed(String),

    #[error("RSA unwrap failed: {0}")]
    UnwrapFailed(String),

    #[error("signature failed: {0}")]
    SignatureFailed(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),
}

impl CryptoError {
    pub fn code(&self) -> &'static str {
        match self {
            CryptoError::KeyGeneration(_) => "crypto.key_generation",
            CryptoError::EncryptionFailed(_) => "crypto.encryption_failed",
            CryptoError::DecryptionFailed(_) => "crypto.decryption_failed",
            CryptoError::SegmentHashMismatch { .. } => "crypto.segment_hash_mismatch",
            CryptoError::RootSignatureMismatch => "crypto.root_signature_mismatch",
            CryptoError::WrapFailed(_) => "crypto.wrap_failed",
            CryptoError::UnwrapFailed(_) => "crypto.unwrap_failed",
            CryptoError::SignatureFailed(_) => "crypto.signature_failed",
            CryptoError::InvalidKey(_) => "crypto.invalid_key",
        }
    }
}

/// Errors from policy binding verification (C8, read path step 3 of C6).
#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("policy binding mismatch for key access object at index {index}")]
    BindingMismatch { index: usize },

    #[error("no key access object available for the requested KAS url")]
    NoMatchingKeyAccess,
}

impl PolicyError {
    pub fn code(&self) -> &'static str {
        match self {
            PolicyError::BindingMismatch { .. } => "policy.binding_mismatch",
            PolicyError::NoMatchingKeyAccess => "policy.no_matching_key_access",
        }
    }
}

/// Errors surfaced by the KAS client (C7), per spec §4.6.
#[derive(Error, Debug)]
pub enum KasError {
    #[error("network error: {0}")]
    Network(String),

    #[error("unauthorized (401)")]
    Unauthorized,

    #[error("forbidden: policy denied (403)")]
    Forbidden,

    #[error("not found (404)")]
    NotFound,

    #[error("malformed KAS response: {0}")]
    Malformed(String),

    #[error("crypto failure unwrapping rewrap response: {0}")]
    CryptoFailure(String),
}

impl KasError {
    pub fn code(&self) -> &'static str {
        match self {
            KasError::Network(_) => "kas.network",
            KasError::Unauthorized => "kas.unauthorized",
            KasError::Forbidden => "kas.forbidden",
            KasError::NotFound => "kas.not_found",
            KasError::Malformed(_) => "kas.malformed",
            KasError::CryptoFailure(_) => "kas.crypto_failure",
        }
    }

    /// Whether this class of KAS error is safe to retry (transport-level
    /// only; policy denials and malformed bodies are never retried).
    pub fn is_retryable(&self) -> bool {
        matches!(self, KasError::Network(_))
    }
}
