//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: trustedge — Privacy and trust at the edge.
//

//! # tdf3-core
//!
//! Core engine for the **Trusted Data Format v3 (TDF3)**: a ZIP-based,
//! policy-bound encrypted container.
//!
//! This crate covers:
//! - [`crypto`] — AES-256-GCM, HMAC-SHA256/GMAC, RSA-OAEP, RSA-PKCS1-SHA256 (C1)
//! - [`chunker`] — uniform random-access byte sources (C2)
//! - [`container`] — the constrained two-entry ZIP container, with ZIP64 (C3)
//! - [`manifest`] — the typed manifest model (C4)
//! - [`writer`] — the segmented AEAD writer (C5)
//! - [`reader`] — the segmented AEAD reader (C6)
//! - [`kas`] — the Key Access Server client (C7)
//! - [`policy`] — the policy binder / key-access builder (C8)
//! - [`auth`] — the auth-provider contract this core consumes
//! - [`cancel`] — a hand-rolled cancellation token
//! - [`secret`] — a zeroize-on-drop wrapper for key material
//! - [`error`] — the unified error hierarchy
//!
//! Authentication providers, HTTP transport wiring, local storage, NanoTDF,
//! and CLI/packaging are outside this crate's scope; only their interfaces
//! are modeled here (see [`auth::AuthProvider`]).

pub mod auth;
pub mod cancel;
pub mod chunker;
pub mod container;
pub mod crypto;
pub mod error;
pub mod kas;
pub mod manifest;
pub mod policy;
pub mod reader;
pub mod secret;
pub mod writer;

pub use cancel::CancellationToken;
pub use crypto::SegmentHashAlg;
pub use error::Tdf3Error;
pub use kas::KasClient;
pub use manifest::Manifest;
pub use reader::TdfReader;
pub use secret::Secret;
pub use writer::{encrypt, EncryptRequest, WriterConfig, WriterConfigBuilder};
