use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::auth::{AuthClient, AuthorizationGrant, CredentialBundle, CredentialPoll};
use crate::config::PollerSection;

/// How one polling run ended. Only a served credential counts as success;
/// everything the token endpoint throws at us in between is absorbed.
#[derive(Debug)]
pub enum PollOutcome {
    Completed(CredentialBundle),
    TimedOut,
    Aborted,
}

/// Polls the token endpoint for one grant until approval, deadline or abort.
pub struct TokenPoller {
    auth: Arc<dyn AuthClient>,
    min_interval: Duration,
    timeout: Duration,
}

impl TokenPoller {
    pub fn new(auth: Arc<dyn AuthClient>, config: &PollerSection) -> Self {
        Self {
            auth,
            min_interval: config.min_interval(),
            timeout: config.timeout(),
        }
    }

    /// Waits out the server-advertised interval between attempts, clamped to
    /// the configured minimum. Transport and endpoint errors are logged and
    /// polling continues; the loop only gives up on deadline or abort.
    pub async fn poll(
        &self,
        session_id: &str,
        grant: &AuthorizationGrant,
        abort: &CancellationToken,
    ) -> PollOutcome {
        let interval = Duration::from_secs(grant.interval).max(self.min_interval);
        let deadline = Instant::now() + self.timeout;
        debug!(
            target: "enroll::poller",
            session = %session_id,
            interval_secs = interval.as_secs(),
            "polling for credential"
        );
        loop {
            let now = Instant::now();
            if now >= deadline {
                return PollOutcome::TimedOut;
            }
            let wait = interval.min(deadline - now);
            tokio::select! {
                _ = abort.cancelled() => return PollOutcome::Aborted,
                _ = tokio::time::sleep(wait) => {}
            }
            if Instant::now() >= deadline {
                return PollOutcome::TimedOut;
            }
            match self.auth.fetch_credential(grant).await {
                Ok(CredentialPoll::Ready(bundle)) => {
                    debug!(target: "enroll::poller", session = %session_id, "credential served");
                    return PollOutcome::Completed(bundle);
                }
                Ok(CredentialPoll::Pending) => {
                    debug!(target: "enroll::poller", session = %session_id, "approval pending");
                }
                Err(err) => {
                    warn!(
                        target: "enroll::poller",
                        session = %session_id,
                        error = %err,
                        "token poll failed, retrying"
                    );
                }
            }
        }
    }
}
