//! Authentication and tenant scoping
//!
//! Credentials arrive as `Authorization: Bearer <jwt>` or `X-API-Key` (header
//! only, never query strings). Verification is delegated to an external auth
//! service through [`TokenVerifier`]; static tokens cover development and
//! tests. `X-Organization-Id` selects the active tenant and must appear in
//! the token's authorized orgs; denied switches are logged with the user id.

use crate::config::AuthSection;
use async_trait::async_trait;
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Missing credentials")]
    MissingCredentials,

    #[error("Invalid or expired credential")]
    InvalidCredential,

    #[error("Organization access denied: {0}")]
    OrgDenied(String),

    #[error("Auth service unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, AuthError>;

/// Claims carried by a verified credential
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: String,
    #[serde(default)]
    pub authorized_orgs: Vec<String>,
}

/// Who is calling, and under which tenant
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: String,
    pub authorized_orgs: Vec<String>,
    pub active_org: Option<String>,
    pub is_anonymous: bool,
}

impl AuthContext {
    pub fn anonymous() -> Self {
        AuthContext {
            user_id: "anonymous".to_string(),
            authorized_orgs: Vec::new(),
            active_org: None,
            is_anonymous: true,
        }
    }
}

/// Credential verification capability (external auth service)
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify_bearer(&self, token: &str) -> Result<Claims>;
    async fn verify_api_key(&self, key: &str) -> Result<Claims>;
}

/// Statically configured credentials (development, tests)
#[derive(Default)]
pub struct StaticVerifier {
    bearer: HashMap<String, Claims>,
    api_keys: HashMap<String, Claims>,
}

impl StaticVerifier {
    pub fn from_config(section: &AuthSection) -> Self {
        let mut verifier = StaticVerifier::default();
        for token in &section.static_tokens {
            let claims = Claims {
                user_id: token.user_id.clone(),
                authorized_orgs: token.authorized_orgs.clone(),
            };
            if token.api_key {
                verifier.api_keys.insert(token.token.clone(), claims);
            } else {
                verifier.bearer.insert(token.token.clone(), claims);
            }
        }
        verifier
    }
}

#[async_trait]
impl TokenVerifier for StaticVerifier {
    async fn verify_bearer(&self, token: &str) -> Result<Claims> {
        self.bearer
            .get(token)
            .cloned()
            .ok_or(AuthError::InvalidCredential)
    }

    async fn verify_api_key(&self, key: &str) -> Result<Claims> {
        self.api_keys
            .get(key)
            .cloned()
            .ok_or(AuthError::InvalidCredential)
    }
}

/// Remote verifier delegating to the external auth service.
pub struct HttpVerifier {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpVerifier {
    pub fn new(endpoint: impl Into<String>) -> Self {
        HttpVerifier {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }

    async fn verify(&self, kind: &str, credential: &str) -> Result<Claims> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({"kind": kind, "credential": credential}))
            .send()
            .await
            .map_err(|e| AuthError::Unavailable(e.to_string()))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(AuthError::InvalidCredential);
        }
        if !response.status().is_success() {
            return Err(AuthError::Unavailable(format!(
                "auth service returned HTTP {}",
                response.status()
            )));
        }
        response
            .json::<Claims>()
            .await
            .map_err(|e| AuthError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl TokenVerifier for HttpVerifier {
    async fn verify_bearer(&self, token: &str) -> Result<Claims> {
        self.verify("bearer", token).await
    }

    async fn verify_api_key(&self, key: &str) -> Result<Claims> {
        self.verify("api_key", key).await
    }
}

/// Header-driven authentication front
pub struct Authenticator {
    verifier: Arc<dyn TokenVerifier>,
    allow_anonymous: bool,
}

impl Authenticator {
    pub fn new(verifier: Arc<dyn TokenVerifier>, allow_anonymous: bool) -> Self {
        Authenticator {
            verifier,
            allow_anonymous,
        }
    }

    pub fn from_config(section: &AuthSection) -> Self {
        let verifier: Arc<dyn TokenVerifier> = match &section.verify_url {
            Some(url) => Arc::new(HttpVerifier::new(url.clone())),
            None => Arc::new(StaticVerifier::from_config(section)),
        };
        Authenticator::new(verifier, section.allow_anonymous)
    }

    /// Resolve the caller from request headers.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<AuthContext> {
        let claims = if let Some(bearer) = extract_bearer(headers) {
            Some(self.verifier.verify_bearer(&bearer).await?)
        } else if let Some(key) = header_value(headers, "x-api-key") {
            Some(self.verifier.verify_api_key(&key).await?)
        } else {
            None
        };

        let requested_org = header_value(headers, "x-organization-id");

        match claims {
            Some(claims) => {
                let active_org = match requested_org {
                    Some(org) => {
                        if !claims.authorized_orgs.iter().any(|o| o == &org) {
                            // Audit trail for denied tenant switches.
                            warn!(
                                user = %claims.user_id,
                                org = %org,
                                "unauthorized organization switch attempt"
                            );
                            return Err(AuthError::OrgDenied(org));
                        }
                        Some(org)
                    }
                    None => None,
                };
                Ok(AuthContext {
                    user_id: claims.user_id,
                    authorized_orgs: claims.authorized_orgs,
                    active_org,
                    is_anonymous: false,
                })
            }
            None if self.allow_anonymous => {
                if let Some(org) = requested_org {
                    warn!(org = %org, "anonymous caller cannot select an organization");
                    return Err(AuthError::OrgDenied(org));
                }
                Ok(AuthContext::anonymous())
            }
            None => Err(AuthError::MissingCredentials),
        }
    }
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let value = headers.get("authorization")?.to_str().ok()?;
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .map(|t| t.trim().to_string())
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
