//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: trustedge — Privacy and trust at the edge.
//

//! KAS (Key Access Server) client (C7): public-key cache, signed rewrap and
//! upsert requests, and response parsing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::auth::{AuthProvider, HttpRequest};
use crate::cancel::CancellationToken;
use crate::crypto::{self, PAYLOAD_KEY_LEN};
use crate::error::KasError;
use crate::manifest::KeyAccessObject;

/// Claims signed into the request token's payload (spec §4.6).
#[derive(Debug, Serialize)]
struct RequestBody<'a> {
    algorithm: &'static str,
    #[serde(rename = "keyAccess")]
    key_access: &'a KeyAccessObject,
    policy: &'a str,
    #[serde(rename = "clientPublicKey")]
    client_public_key: &'a str,
}

#[derive(Debug, Serialize)]
struct TokenHeader {
    alg: &'static str,
}

#[derive(Debug, Serialize)]
struct RewrapBody {
    #[serde(rename = "signedRequestToken")]
    signed_request_token: String,
}

#[derive(Debug, Deserialize)]
struct RewrapResponse {
    #[serde(rename = "entityWrappedKey")]
    entity_wrapped_key: String,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct KasPublicKeyResponse {
    #[serde(rename = "publicKey")]
    public_key: Option<String>,
}

/// Build the JWT-shaped signed request token: base64url header
/// `{alg:"RS256"}`, base64url payload, RSASSA-PKCS1-v1_5-SHA256 signature
/// (spec §4.6). Hand-assembled rather than delegated to a JWT crate.
fn build_signed_request_token(signing_key: &RsaPrivateKey, key_access: &KeyAccessObject, policy: &str, client_public_key_pem: &str) -> Result<String, KasError> {
    let request_body = RequestBody {
        algorithm: "RS256",
        key_access,
        policy,
        client_public_key: client_public_key_pem,
    };
    let request_body_json = serde_json::to_string(&request_body).map_err(|e| KasError::Malformed(e.to_string()))?;

    let header = TokenHeader { alg: "RS256" };
    let header_json = serde_json::to_string(&header).expect("static header always serializes");
    let header_b64 = URL_SAFE_NO_PAD.encode(header_json);

    #[derive(Serialize)]
    struct Payload {
        #[serde(rename = "requestBody")]
        request_body: String,
    }
    let payload_json = serde_json::to_string(&Payload { request_body: request_body_json }).expect("payload always serializes");
    let payload_b64 = URL_SAFE_NO_PAD.encode(payload_json);

    let signing_input = format!("{header_b64}.{payload_b64}");
    let signature = crypto::rsa_pkcs1_sha256_sign(signing_key, signing_input.as_bytes())
        .map_err(|e| KasError::CryptoFailure(e.to_string()))?;
    let signature_b64 = URL_SAFE_NO_PAD.encode(signature);

    Ok(format!("{signing_input}.{signature_b64}"))
}

/// The payload key and any out-of-band metadata recovered from a rewrap.
pub struct RewrapResult {
    pub payload_key: crate::secret::Secret<[u8; PAYLOAD_KEY_LEN]>,
    pub metadata: Option<serde_json::Value>,
}

/// Client for the KAS HTTP surface: public key cache, rewrap, and upsert.
pub struct KasClient {
    http: reqwest::Client,
    auth: Arc<dyn AuthProvider>,
    session_private_key: RsaPrivateKey,
    session_public_key_pem: String,
    public_key_cache: RwLock<HashMap<String, String>>,
    max_attempts: u32,
    base_backoff: Duration,
}

impl KasClient {
    pub fn new(auth: Arc<dyn AuthProvider>, session_private_key: RsaPrivateKey) -> Result<Self, KasError> {
        let session_public_key = RsaPublicKey::from(&session_private_key);
        let session_public_key_pem = crypto::rsa_public_key_to_pem(&session_public_key).map_err(|e| KasError::CryptoFailure(e.to_string()))?;
        Ok(Self {
            http: reqwest::Client::new(),
            auth,
            session_private_key,
            session_public_key_pem,
            public_key_cache: RwLock::new(HashMap::new()),
            max_attempts: 3,
            base_backoff: Duration::from_millis(200),
        })
    }

    /// Fetch and cache a KAS's RSA-2048 public key PEM (spec §4.6). Cache
    /// entries never expire within a process; callers that suspect a stale
    /// key should call [`KasClient::invalidate_public_key`] and retry once.
    pub async fn public_key(&self, kas_url: &str) -> Result<String, KasError> {
        if let Some(cached) = self.public_key_cache.read().await.get(kas_url) {
            return Ok(cached.clone());
        }

        let url = format!("{kas_url}/v2/kas_public_key?algorithm=rsa:2048");
        let response = self.http.get(&url).send().await.map_err(|e| KasError::Network(e.to_string()))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| KasError::Network(e.to_string()))?;

        let pem = if status.is_success() {
            serde_json::from_str::<KasPublicKeyResponse>(&body)
                .ok()
                .and_then(|r| r.public_key)
                .unwrap_or(body)
        } else {
            return Err(map_status_error(status));
        };

        self.public_key_cache.write().await.insert(kas_url.to_string(), pem.clone());
        Ok(pem)
    }

    pub async fn invalidate_public_key(&self, kas_url: &str) {
        self.public_key_cache.write().await.remove(kas_url);
    }

    /// Perform a rewrap round trip against `key_access.url`, recovering the
    /// payload key (spec §4.6).
    pub async fn rewrap(&self, key_access: &KeyAccessObject, policy_b64: &str, cancel: &CancellationToken) -> Result<RewrapResult, KasError> {
        let token = build_signed_request_token(&self.session_private_key, key_access, policy_b64, &self.session_public_key_pem)?;
        let body = RewrapBody { signed_request_token: token };
        let url = format!("{}/v2/rewrap", key_access.url);

        let response = self.send_with_retry(&url, &body, cancel).await?;
        let parsed: RewrapResponse = serde_json::from_str(&response).map_err(|e| KasError::Malformed(e.to_string()))?;

        let wrapped = crypto::b64_decode(&parsed.entity_wrapped_key).map_err(|e| KasError::Malformed(e.to_string()))?;
        let payload_key = crypto::rsa_oaep_unwrap(&self.session_private_key, &wrapped).map_err(|e| KasError::CryptoFailure(e.to_string()))?;

        Ok(RewrapResult {
            payload_key: crate::secret::Secret::new(payload_key),
            metadata: parsed.metadata,
        })
    }

    /// Upsert a wrapped key for a `remote`-type KAO (spec §4.7). The
    /// response schema is not enforced (spec §9 open question); only the
    /// HTTP status is checked.
    pub async fn upsert(&self, key_access: &KeyAccessObject, policy_b64: &str, cancel: &CancellationToken) -> Result<(), KasError> {
        let token = build_signed_request_token(&self.session_private_key, key_access, policy_b64, &self.session_public_key_pem)?;
        let body = RewrapBody { signed_request_token: token };
        let url = format!("{}/v2/upsert", key_access.url);
        self.send_with_retry(&url, &body, cancel).await?;
        Ok(())
    }

    async fn send_with_retry(&self, url: &str, body: &RewrapBody, cancel: &CancellationToken) -> Result<String, KasError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(KasError::Network("operation cancelled".to_string()));
            }

            let request = self
                .auth
                .with_creds(HttpRequest::new("POST", url).with_header("Content-Type", "application/json"))
                .await;

            let mut builder = self.http.post(url).json(body);
            for (name, value) in &request.headers {
                builder = builder.header(name, value);
            }

            let result = builder.send().await;
            match result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response.text().await.map_err(|e| KasError::Network(e.to_string()));
                    }
                    let err = map_status_error(status);
                    if err.is_retryable() && attempt < self.max_attempts {
                        tokio::select! {
                            _ = tokio::time::sleep(self.base_backoff * 2u32.pow(attempt - 1)) => {}
                            _ = cancel.cancelled() => return Err(KasError::Network("operation cancelled".to_string())),
                        }
                        continue;
                    }
                    return Err(err);
                }
                Err(e) if attempt < self.max_attempts => {
                    tracing::warn!(attempt, error = %e, "retrying KAS request after transport error");
                    tokio::select! {
                        _ = tokio::time::sleep(self.base_backoff * 2u32.pow(attempt - 1)) => {}
                        _ = cancel.cancelled() => return Err(KasError::Network("operation cancelled".to_string())),
                    }
                }
                Err(e) => return Err(KasError::Network(e.to_string())),
            }
        }
    }

    pub fn session_public_key_pem(&self) -> &str {
        &self.session_public_key_pem
    }
}

fn map_status_error(status: reqwest::StatusCode) -> KasError {
    match status.as_u16() {
        401 => KasError::Unauthorized,
        403 => KasError::Forbidden,
        404 => KasError::NotFound,
        500..=599 => KasError::Network(format!("server error: {status}")),
        _ => KasError::Malformed(format!("unexpected status: {status}")),
    }
}
