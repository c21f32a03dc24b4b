//! Device-authorization flow against the enrollment service.
//!
//! The service hands out credentials through the standard device-code grant:
//! register a client, request a device authorization, then poll the token
//! endpoint until the browser-side approval lands. "Not approved yet" is a
//! value here, never an error.

mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use http::HttpAuthClient;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Terminal denial from the authorization server (`access_denied`,
    /// `expired_token`, `invalid_grant`, ...).
    #[error("authorization denied: {code}")]
    Denied { code: String },
    #[error("unexpected response {status} from {endpoint}: {body}")]
    Endpoint {
        endpoint: String,
        status: u16,
        body: String,
    },
}

pub type AuthResult<T> = Result<T, AuthError>;

/// Everything needed to finish one device-code grant: the registered client
/// plus the codes handed back by the authorization endpoint. Immutable once
/// issued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationGrant {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub verification_uri_complete: Option<String>,
    pub expires_in: u64,
    /// Poll interval advertised by the server, in seconds.
    pub interval: u64,
}

impl AuthorizationGrant {
    /// URL a browser should visit to approve this grant.
    pub fn approval_url(&self) -> &str {
        self.verification_uri_complete
            .as_deref()
            .unwrap_or(&self.verification_uri)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialBundle {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
}

/// Outcome of one token-endpoint poll. `Pending` covers both
/// `authorization_pending` and `slow_down`.
#[derive(Debug, Clone)]
pub enum CredentialPoll {
    Ready(CredentialBundle),
    Pending,
}

/// Raw result of hitting the usage endpoint with a bearer credential. The
/// validator turns this into a token status.
#[derive(Debug, Clone)]
pub struct UsageProbe {
    pub status: u16,
    pub body: String,
}

/// Client for the enrollment service's authorization endpoints.
#[async_trait]
pub trait AuthClient: Send + Sync {
    /// Registers a fresh client and starts a device authorization for it.
    async fn request_grant(&self) -> AuthResult<AuthorizationGrant>;

    /// Asks the token endpoint whether the grant has been approved.
    async fn fetch_credential(&self, grant: &AuthorizationGrant) -> AuthResult<CredentialPoll>;

    /// Exchanges a refresh token for a fresh credential bundle. `client_id`
    /// identifies the registered client the tokens belong to; public-client
    /// token endpoints require it.
    async fn refresh_credential(
        &self,
        client_id: Option<&str>,
        refresh_token: &str,
    ) -> AuthResult<CredentialBundle>;

    /// Hits the usage endpoint with `access_token` and reports the raw
    /// status and body.
    async fn probe_usage(&self, access_token: &str) -> AuthResult<UsageProbe>;
}
