use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::auth::{AuthClient, CredentialBundle};
use crate::config::EnrollConfig;
use crate::context::ContextHost;
use crate::history::{HistoryRecord, HistoryStore};
use crate::identity::{Identity, IdentityGenerator};
use crate::mail::{Inbox, MailProvider};

use super::error::{RegistrationError, RegistrationResult};
use super::lock::ResourceLock;
use super::poller::{PollOutcome, TokenPoller};
use super::session::{SessionRegistry, SessionStatus};
use super::state::BatchState;

/// How often to re-mint an address that collided with one already claimed in
/// this batch before giving up on the provider.
const INBOX_CLAIM_ATTEMPTS: usize = 5;

/// Shared pieces a pipeline run touches. The engine owns one of each and the
/// pipeline borrows them for the life of the batch.
pub struct PipelineDeps {
    pub mail: Arc<dyn MailProvider>,
    pub auth: Arc<dyn AuthClient>,
    pub contexts: Arc<dyn ContextHost>,
    pub history: Arc<HistoryStore>,
    pub registry: SessionRegistry,
    pub batch: BatchState,
    pub api_lock: ResourceLock,
    pub window_lock: ResourceLock,
}

/// External resources a run acquired and must give back, success or not.
#[derive(Default)]
struct SessionResources {
    inbox: Option<Inbox>,
    context_id: Option<String>,
}

/// Drives one session from identity generation to a served credential.
/// Errors never escape [`run`](Self::run); they land on the session, the
/// batch counters and the history store.
pub struct RegistrationPipeline {
    mail: Arc<dyn MailProvider>,
    auth: Arc<dyn AuthClient>,
    contexts: Arc<dyn ContextHost>,
    history: Arc<HistoryStore>,
    registry: SessionRegistry,
    batch: BatchState,
    api_lock: ResourceLock,
    window_lock: ResourceLock,
    poller: TokenPoller,
    navigation_timeout: Duration,
}

impl RegistrationPipeline {
    pub fn new(config: &EnrollConfig, deps: PipelineDeps) -> Self {
        Self {
            poller: TokenPoller::new(deps.auth.clone(), &config.poller),
            navigation_timeout: config.browser.navigation_timeout(),
            mail: deps.mail,
            auth: deps.auth,
            contexts: deps.contexts,
            history: deps.history,
            registry: deps.registry,
            batch: deps.batch,
            api_lock: deps.api_lock,
            window_lock: deps.window_lock,
        }
    }

    /// Runs the whole pipeline for `session_id` and reports success. Cleanup
    /// of the context and inbox happens on every path, after the outcome has
    /// been recorded.
    pub async fn run(&self, session_id: &str) -> bool {
        let mut resources = SessionResources::default();
        let outcome = self.drive(session_id, &mut resources).await;
        let success = match outcome {
            Ok(bundle) => {
                self.finish_success(session_id, bundle);
                true
            }
            Err(err) => {
                self.finish_failure(session_id, &err);
                false
            }
        };
        self.cleanup(session_id, resources).await;
        success
    }

    async fn drive(
        &self,
        id: &str,
        resources: &mut SessionResources,
    ) -> RegistrationResult<CredentialBundle> {
        let session = self
            .registry
            .get(id)
            .ok_or_else(|| RegistrationError::UnknownSession(id.to_string()))?;
        let abort = session.abort.clone();

        self.registry.set_status(id, SessionStatus::Running);
        self.registry.set_step(id, "generating identity");
        let identity = IdentityGenerator.generate();
        self.registry.set_identity(id, identity.clone());

        self.registry.set_step(id, "provisioning mailbox");
        let inbox = self.claim_inbox(&identity).await?;
        self.registry.set_inbox(id, inbox.clone());
        resources.inbox = Some(inbox);

        if abort.is_cancelled() {
            return Err(RegistrationError::Aborted);
        }

        self.registry.set_step(id, "requesting authorization grant");
        let grant = {
            let _guard = self.api_lock.acquire().await;
            self.auth.request_grant().await?
        };
        self.registry.set_grant(id, grant.clone());

        if abort.is_cancelled() {
            return Err(RegistrationError::Aborted);
        }

        self.registry.set_step(id, "opening approval context");
        {
            let _guard = self.window_lock.acquire().await;
            let context = self.contexts.create(grant.approval_url()).await?;
            resources.context_id = context.context_id.clone();
            let context_id = match (context.context_id.clone(), context.surface_id.clone()) {
                (Some(context_id), Some(surface_id)) => {
                    self.registry
                        .set_context(id, context_id.clone(), Some(surface_id));
                    context_id
                }
                _ => {
                    return Err(RegistrationError::ResourceUnavailable(
                        "browser returned no isolated context; enable isolated \
                         browsing or grant the automation permission"
                            .to_string(),
                    ))
                }
            };
            debug!(
                target: "enroll::pipeline",
                session = %id,
                context = %context_id,
                "approval context opened"
            );
            match self.contexts.wait_ready(&context, self.navigation_timeout).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(
                        target: "enroll::pipeline",
                        session = %id,
                        "approval page still loading after the navigation window, continuing"
                    );
                }
                Err(err) => {
                    warn!(
                        target: "enroll::pipeline",
                        session = %id,
                        error = %err,
                        "navigation wait failed, continuing"
                    );
                }
            }
        }

        self.registry.set_status(id, SessionStatus::PollingToken);
        self.registry.set_step(id, "waiting for approval");
        match self.poller.poll(id, &grant, &abort).await {
            PollOutcome::Completed(bundle) => Ok(bundle),
            PollOutcome::TimedOut => Err(RegistrationError::Timeout(
                "approval window expired before a credential was served".to_string(),
            )),
            PollOutcome::Aborted => Err(RegistrationError::Aborted),
        }
    }

    /// Mints an address not yet used in this batch. Colliding inboxes are
    /// released back to the provider.
    async fn claim_inbox(&self, identity: &Identity) -> RegistrationResult<Inbox> {
        for _ in 0..INBOX_CLAIM_ATTEMPTS {
            let inbox = self.mail.create_inbox(identity).await?;
            if self.registry.claim_address(&inbox.address) {
                return Ok(inbox);
            }
            debug!(
                target: "enroll::pipeline",
                address = %inbox.address,
                "address already claimed in this batch, minting another"
            );
            if let Err(err) = self.mail.release_inbox(&inbox).await {
                debug!(
                    target: "enroll::pipeline",
                    error = %err,
                    "could not release colliding inbox"
                );
            }
        }
        Err(RegistrationError::ResourceUnavailable(
            "mail provider kept returning addresses already claimed in this batch".to_string(),
        ))
    }

    fn finish_success(&self, id: &str, bundle: CredentialBundle) {
        let session = self.registry.get(id);
        let email = session
            .as_ref()
            .and_then(|s| s.email().map(str::to_string))
            .unwrap_or_else(|| "unassigned".to_string());
        let identity = session.as_ref().and_then(|s| s.identity.clone());
        let client_id = session
            .as_ref()
            .and_then(|s| s.grant.as_ref())
            .map(|g| g.client_id.clone());
        self.registry.complete(id);
        self.batch.record_success(&email, bundle.clone());
        let record = HistoryRecord::succeeded(
            email.clone(),
            identity.as_ref().map(|i| i.display_name()),
            identity.map(|i| i.password),
            client_id,
            bundle,
        );
        if let Err(err) = self.history.insert(record) {
            warn!(
                target: "enroll::pipeline",
                session = %id,
                error = %err,
                "could not persist success record"
            );
        }
        info!(target: "enroll::pipeline", session = %id, email = %email, "enrollment completed");
    }

    fn finish_failure(&self, id: &str, err: &RegistrationError) {
        let email = self
            .registry
            .get(id)
            .and_then(|s| s.email().map(str::to_string))
            .unwrap_or_else(|| "unassigned".to_string());
        let message = err.to_string();
        self.registry.fail(id, message.clone());
        self.batch.record_failure();
        if let Err(persist_err) = self.history.insert(HistoryRecord::failed(email, &message)) {
            warn!(
                target: "enroll::pipeline",
                session = %id,
                error = %persist_err,
                "could not persist failure record"
            );
        }
        if err.is_abort() {
            debug!(target: "enroll::pipeline", session = %id, "enrollment aborted");
        } else {
            warn!(target: "enroll::pipeline", session = %id, error = %message, "enrollment failed");
        }
    }

    async fn cleanup(&self, id: &str, resources: SessionResources) {
        if let Some(context_id) = resources.context_id {
            if let Err(err) = self.contexts.close(&context_id).await {
                warn!(
                    target: "enroll::pipeline",
                    session = %id,
                    error = %err,
                    "could not close approval context"
                );
            }
            self.registry.clear_context(id);
        }
        if let Some(inbox) = resources.inbox {
            if let Err(err) = self.mail.release_inbox(&inbox).await {
                debug!(
                    target: "enroll::pipeline",
                    session = %id,
                    error = %err,
                    "could not release inbox"
                );
            }
        }
    }
}
