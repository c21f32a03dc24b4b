//! Mailbox provisioning for enrollment sessions.
//!
//! Each session needs a unique address, and the service follows up with a
//! numeric verification code. Providers differ in what they can do: a
//! gmail-alias provider mints addresses but cannot read mail, a disposable
//! provider can do both. The capability surface lives on the trait so the
//! orchestrator can adapt instead of guessing.

mod disposable;
mod gmail;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::MailSection;
use crate::identity::Identity;

pub use disposable::DisposableInboxProvider;
pub use gmail::GmailAliasProvider;

#[derive(Debug, Error)]
pub enum MailError {
    #[error("mail provider {0} is not configured")]
    NotConfigured(String),
    #[error("unknown mail provider: {0}")]
    UnknownProvider(String),
    #[error("mail provider {0} cannot fetch codes automatically")]
    AutoVerifyUnsupported(String),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("mail provider error: {0}")]
    Provider(String),
}

pub type MailResult<T> = Result<T, MailError>;

/// A claimed mailbox. `handle` is the provider-internal name used to read or
/// drop the box; alias providers have none.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inbox {
    pub address: String,
    pub provider: String,
    pub handle: Option<String>,
}

/// Constraints on a verification-code lookup. Mail older than `since` is
/// ignored so a reused mailbox never hands back a stale code.
#[derive(Debug, Clone)]
pub struct CodeQuery {
    pub since: DateTime<Utc>,
}

#[async_trait]
pub trait MailProvider: Send + Sync {
    fn id(&self) -> &'static str;

    /// Whether the deployment gave this provider what it needs to operate.
    fn is_configured(&self) -> bool;

    /// Whether [`fetch_verification_code`](Self::fetch_verification_code)
    /// can work without a human reading mail.
    fn can_auto_verify(&self) -> bool;

    /// Mints a fresh, unique address. `identity` is a naming hint only.
    async fn create_inbox(&self, identity: &Identity) -> MailResult<Inbox>;

    /// Looks for a verification code matching `query`. `Ok(None)` means no
    /// matching mail has arrived yet.
    async fn fetch_verification_code(
        &self,
        inbox: &Inbox,
        query: &CodeQuery,
    ) -> MailResult<Option<String>>;

    async fn release_inbox(&self, inbox: &Inbox) -> MailResult<()>;
}

/// Known providers, keyed by id, with one of them designated by config.
pub struct ProviderRegistry {
    providers: HashMap<&'static str, Arc<dyn MailProvider>>,
    default_id: String,
}

impl ProviderRegistry {
    pub fn from_config(config: &MailSection) -> Self {
        let mut providers: HashMap<&'static str, Arc<dyn MailProvider>> = HashMap::new();
        let gmail = Arc::new(GmailAliasProvider::new(config.clone()));
        providers.insert(gmail.id(), gmail);
        let disposable = Arc::new(DisposableInboxProvider::new(config.clone()));
        providers.insert(disposable.id(), disposable);
        Self {
            providers,
            default_id: config.provider.clone(),
        }
    }

    pub fn get(&self, id: &str) -> MailResult<Arc<dyn MailProvider>> {
        self.providers
            .get(id)
            .cloned()
            .ok_or_else(|| MailError::UnknownProvider(id.to_string()))
    }

    /// The provider named by config, checked for configuration.
    pub fn default_provider(&self) -> MailResult<Arc<dyn MailProvider>> {
        let provider = self.get(&self.default_id)?;
        if !provider.is_configured() {
            return Err(MailError::NotConfigured(self.default_id.clone()));
        }
        Ok(provider)
    }

    pub fn ids(&self) -> Vec<&'static str> {
        let mut ids: Vec<&'static str> = self.providers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
