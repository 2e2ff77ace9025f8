//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: trustedge — Privacy and trust at the edge.
//

//! The auth-provider contract this core consumes (spec §4.8, §6, §9).
//!
//! Concrete providers (OIDC refresh-token exchange, external-JWT exchange,
//! DPoP) are collaborators outside this crate; only the narrow seam between
//! them and the KAS client lives here, following the teacher's
//! `KeyBackend`-trait pattern of depending on a trait object rather than a
//! concrete collaborator type.

use async_trait::async_trait;

/// A minimal outbound HTTP request the auth provider decorates with
/// credentials. This core never constructs the underlying transport
/// request type itself (HTTP transport is out of scope, spec §1); the KAS
/// client builds one of these, decorates it, then lowers it into whatever
/// HTTP client it holds.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl HttpRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// The two capabilities this core requires of an auth provider (spec §6,
/// §9 "Auth-provider polymorphism"): request decoration and public-key
/// rebinding. Implemented outside this crate by the concrete refresh-token
/// or external-JWT-exchange providers.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Decorate an outbound request with an `Authorization` header and, if
    /// DPoP is enabled, a `DPoP` header bound to the request's method, URL,
    /// and a server-issued nonce, signed by the session signing key.
    async fn with_creds(&self, request: HttpRequest) -> HttpRequest;

    /// Invoked once per `Client` to rebind the auth token to the session's
    /// RSA public key (and, for DPoP, its signing key pair). Breaks the
    /// cyclic `Client` ⇆ `AuthProvider` reference (spec §9) by injecting the
    /// session public key into the provider rather than having the provider
    /// hold a reference back to the client.
    async fn update_client_public_key(&self, public_key_pem: &str);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingAuthProvider {
        rebind_calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AuthProvider for RecordingAuthProvider {
        async fn with_creds(&self, request: HttpRequest) -> HttpRequest {
            request.with_header("Authorization", "Bearer test-token")
        }

        async fn update_client_public_key(&self, public_key_pem: &str) {
            self.rebind_calls.lock().unwrap().push(public_key_pem.to_string());
        }
    }

    #[tokio::test]
    async fn with_creds_attaches_authorization_header() {
        let provider = RecordingAuthProvider { rebind_calls: Mutex::new(Vec::new()) };
        let request = HttpRequest::new("POST", "https://kas.example.com/v2/rewrap");
        let decorated = provider.with_creds(request).await;
        assert!(decorated.headers.iter().any(|(k, v)| k == "Authorization" && v == "Bearer test-token"));
    }

    #[tokio::test]
    async fn update_client_public_key_is_recorded() {
        let provider = RecordingAuthProvider { rebind_calls: Mutex::new(Vec::new()) };
        provider.update_client_public_key("PEM-DATA").await;
        assert_eq!(provider.rebind_calls.lock().unwrap().as_slice(), ["PEM-DATA".to_string()]);
    }
}
