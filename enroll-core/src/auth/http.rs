use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Deserialize;
use tracing::debug;

use crate::config::AuthSection;

use super::{
    AuthClient, AuthError, AuthResult, AuthorizationGrant, CredentialBundle, CredentialPoll,
    UsageProbe,
};

const DEVICE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";
const DEFAULT_POLL_INTERVAL_SECONDS: u64 = 5;
const BODY_SNIPPET_LIMIT: usize = 512;

#[derive(Debug, Deserialize)]
struct RegistrationResponse {
    client_id: String,
    #[serde(default)]
    client_secret: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeviceAuthResponse {
    device_code: String,
    user_code: String,
    verification_uri: String,
    #[serde(default)]
    verification_uri_complete: Option<String>,
    expires_in: u64,
    #[serde(default)]
    interval: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
}

/// [`AuthClient`] speaking the real protocol over HTTP.
pub struct HttpAuthClient {
    client: reqwest::Client,
    config: AuthSection,
}

impl HttpAuthClient {
    pub fn new(config: AuthSection) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    async fn token_request(
        &self,
        form: &[(&str, &str)],
    ) -> AuthResult<Result<CredentialBundle, String>> {
        let response = self
            .client
            .post(&self.config.token_endpoint)
            .form(form)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            let token = response.json::<TokenResponse>().await?;
            return Ok(Ok(CredentialBundle {
                access_token: token.access_token,
                refresh_token: token.refresh_token,
                expires_in: token.expires_in,
            }));
        }
        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str::<TokenErrorResponse>(&body) {
            Ok(error) => Ok(Err(error.error)),
            Err(_) => Err(AuthError::Endpoint {
                endpoint: self.config.token_endpoint.clone(),
                status: status.as_u16(),
                body: snippet(&body),
            }),
        }
    }
}

#[async_trait::async_trait]
impl AuthClient for HttpAuthClient {
    async fn request_grant(&self) -> AuthResult<AuthorizationGrant> {
        // Each enrollment gets its own registered client so grants stay
        // independent of one another.
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(6)
            .map(char::from)
            .collect();
        let registration = serde_json::json!({
            "client_name": format!("{}-{}", self.config.client_name, suffix),
            "grant_types": [DEVICE_GRANT_TYPE, "refresh_token"],
            "token_endpoint_auth_method": "none",
        });
        let response = self
            .client
            .post(&self.config.registration_endpoint)
            .json(&registration)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Endpoint {
                endpoint: self.config.registration_endpoint.clone(),
                status: status.as_u16(),
                body: snippet(&body),
            });
        }
        let registered = response.json::<RegistrationResponse>().await?;

        let response = self
            .client
            .post(&self.config.device_endpoint)
            .form(&[
                ("client_id", registered.client_id.as_str()),
                ("scope", self.config.scope.as_str()),
            ])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Endpoint {
                endpoint: self.config.device_endpoint.clone(),
                status: status.as_u16(),
                body: snippet(&body),
            });
        }
        let device = response.json::<DeviceAuthResponse>().await?;
        debug!(
            target: "enroll::auth",
            client_id = %registered.client_id,
            user_code = %device.user_code,
            "device authorization started"
        );
        Ok(AuthorizationGrant {
            client_id: registered.client_id,
            client_secret: registered.client_secret,
            device_code: device.device_code,
            user_code: device.user_code,
            verification_uri: device.verification_uri,
            verification_uri_complete: device.verification_uri_complete,
            expires_in: device.expires_in,
            interval: device.interval.unwrap_or(DEFAULT_POLL_INTERVAL_SECONDS),
        })
    }

    async fn fetch_credential(&self, grant: &AuthorizationGrant) -> AuthResult<CredentialPoll> {
        let outcome = self
            .token_request(&[
                ("grant_type", DEVICE_GRANT_TYPE),
                ("device_code", grant.device_code.as_str()),
                ("client_id", grant.client_id.as_str()),
            ])
            .await?;
        match outcome {
            Ok(bundle) => Ok(CredentialPoll::Ready(bundle)),
            // The server asking for patience is part of the protocol, not a
            // failure.
            Err(code) if code == "authorization_pending" || code == "slow_down" => {
                Ok(CredentialPoll::Pending)
            }
            Err(code) => Err(AuthError::Denied { code }),
        }
    }

    async fn refresh_credential(
        &self,
        client_id: Option<&str>,
        refresh_token: &str,
    ) -> AuthResult<CredentialBundle> {
        let mut form: Vec<(&str, &str)> = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];
        if let Some(client_id) = client_id {
            form.push(("client_id", client_id));
        }
        let outcome = self.token_request(&form).await?;
        match outcome {
            Ok(bundle) => Ok(bundle),
            Err(code) => Err(AuthError::Denied { code }),
        }
    }

    async fn probe_usage(&self, access_token: &str) -> AuthResult<UsageProbe> {
        let response = self
            .client
            .get(&self.config.usage_endpoint)
            .bearer_auth(access_token)
            .send()
            .await?;
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Ok(UsageProbe {
            status,
            body: snippet(&body),
        })
    }
}

fn snippet(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= BODY_SNIPPET_LIMIT {
        return trimmed.to_string();
    }
    let mut end = BODY_SNIPPET_LIMIT;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    trimmed[..end].to_string()
}
