use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::error::{ConfigError, Result};

/// Top-level configuration for an orchestrator instance.
///
/// Every delay in here started life as a hard-coded rate-limit heuristic;
/// they are all tunable, with the field defaults preserving the original
/// values.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EnrollConfig {
    pub batch: BatchSection,
    pub locks: LockSection,
    pub poller: PollerSection,
    pub mail: MailSection,
    pub auth: AuthSection,
    pub browser: BrowserSection,
    pub validator: ValidatorSection,
    pub history: HistorySection,
}

impl EnrollConfig {
    /// Checks the values no use site clamps. A zero poll deadline would fail
    /// every session before its first fetch; a malformed endpoint would
    /// surface as a transport error halfway through a batch.
    fn validate(&self) -> std::result::Result<(), String> {
        if self.poller.timeout_seconds == 0 {
            return Err("poller.timeout_seconds must be at least 1".to_string());
        }
        for (field, value) in [
            ("auth.registration_endpoint", &self.auth.registration_endpoint),
            ("auth.device_endpoint", &self.auth.device_endpoint),
            ("auth.token_endpoint", &self.auth.token_endpoint),
            ("auth.usage_endpoint", &self.auth.usage_endpoint),
        ] {
            if !value.is_empty() && Url::parse(value).is_err() {
                return Err(format!("{field} is not a valid URL: {value}"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchSection {
    pub default_target: u32,
    pub default_concurrency: u32,
    /// Delay between worker starts, multiplied by the worker index.
    pub worker_stagger_ms: u64,
    /// Pause between two tasks handled by the same worker.
    pub inter_task_delay_ms: u64,
}

impl Default for BatchSection {
    fn default() -> Self {
        Self {
            default_target: 5,
            default_concurrency: 2,
            worker_stagger_ms: 3000,
            inter_task_delay_ms: 2000,
        }
    }
}

impl BatchSection {
    pub fn stagger_delay(&self) -> Duration {
        Duration::from_millis(self.worker_stagger_ms)
    }

    pub fn inter_task_delay(&self) -> Duration {
        Duration::from_millis(self.inter_task_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockSection {
    /// Cool-down after releasing the shared-API lock.
    pub api_cooldown_ms: u64,
    /// Cool-down after releasing the window-creation lock.
    pub window_cooldown_ms: u64,
}

impl Default for LockSection {
    fn default() -> Self {
        Self {
            api_cooldown_ms: 500,
            window_cooldown_ms: 0,
        }
    }
}

impl LockSection {
    pub fn api_cooldown(&self) -> Duration {
        Duration::from_millis(self.api_cooldown_ms)
    }

    pub fn window_cooldown(&self) -> Duration {
        Duration::from_millis(self.window_cooldown_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollerSection {
    /// Floor for the poll interval, regardless of what the grant advertises.
    pub min_interval_seconds: u64,
    /// Overall deadline for one polling run.
    pub timeout_seconds: u64,
}

impl Default for PollerSection {
    fn default() -> Self {
        Self {
            min_interval_seconds: 2,
            timeout_seconds: 600,
        }
    }
}

impl PollerSection {
    pub fn min_interval(&self) -> Duration {
        Duration::from_secs(self.min_interval_seconds)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MailSection {
    /// Provider id: "gmail-alias" or "disposable".
    pub provider: String,
    /// Base mailbox for alias-style providers.
    pub base_address: Option<String>,
    /// Substring matched against the sender of verification mail.
    pub sender_filter: String,
    /// Alias style for the gmail provider: "auto", "plus", "dot" or
    /// "domain-swap".
    pub alias_style: String,
    /// Domain for disposable inboxes.
    pub inbox_domain: Option<String>,
    /// REST endpoint of the disposable-inbox service.
    pub api_base_url: Option<String>,
    /// How long a verification-code fetch may keep polling the inbox.
    pub code_wait_seconds: u64,
    pub code_poll_interval_ms: u64,
}

impl Default for MailSection {
    fn default() -> Self {
        Self {
            provider: "gmail-alias".to_string(),
            base_address: None,
            sender_filter: "no-reply".to_string(),
            alias_style: "auto".to_string(),
            inbox_domain: None,
            api_base_url: None,
            code_wait_seconds: 20,
            code_poll_interval_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthSection {
    /// Dynamic client registration endpoint.
    pub registration_endpoint: String,
    /// Device-authorization endpoint.
    pub device_endpoint: String,
    pub token_endpoint: String,
    /// Endpoint probed with a bearer credential during validation.
    pub usage_endpoint: String,
    pub scope: String,
    pub client_name: String,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            registration_endpoint: String::new(),
            device_endpoint: String::new(),
            token_endpoint: String::new(),
            usage_endpoint: String::new(),
            scope: "profile offline_access".to_string(),
            client_name: "enroll".to_string(),
        }
    }
}

impl AuthSection {
    pub fn is_configured(&self) -> bool {
        !self.registration_endpoint.is_empty()
            && !self.device_endpoint.is_empty()
            && !self.token_endpoint.is_empty()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrowserSection {
    pub executable_path: String,
    pub headless: bool,
    pub sandbox: bool,
    /// Bound on the initial navigation of a fresh context; exceeding it is
    /// logged but not fatal.
    pub navigation_timeout_seconds: u64,
}

impl Default for BrowserSection {
    fn default() -> Self {
        Self {
            executable_path: "/usr/bin/chromium".to_string(),
            headless: true,
            sandbox: true,
            navigation_timeout_seconds: 30,
        }
    }
}

impl BrowserSection {
    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_secs(self.navigation_timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ValidatorSection {
    pub batch_size: usize,
    pub inter_batch_delay_ms: u64,
}

impl Default for ValidatorSection {
    fn default() -> Self {
        Self {
            batch_size: 5,
            inter_batch_delay_ms: 1000,
        }
    }
}

impl ValidatorSection {
    pub fn inter_batch_delay(&self) -> Duration {
        Duration::from_millis(self.inter_batch_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HistorySection {
    pub path: String,
    pub capacity: usize,
}

impl Default for HistorySection {
    fn default() -> Self {
        Self {
            path: "data/history.json".to_string(),
            capacity: 100,
        }
    }
}

/// Reads `path`, deserializes it and runs the startup checks. Partial files
/// are fine; absent sections take their defaults before validation runs.
pub fn load_enroll_config<P: AsRef<Path>>(path: P) -> Result<EnrollConfig> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        source,
        path: path.to_path_buf(),
    })?;
    let config: EnrollConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })?;
    config.validate().map_err(|detail| ConfigError::Invalid {
        detail,
        path: path.to_path_buf(),
    })?;
    Ok(config)
}
