use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::{AuthClient, HttpAuthClient};
use crate::config::EnrollConfig;
use crate::context::{ChromiumContextHost, ContextHost};
use crate::history::{HistoryRecord, HistoryStore, HistorySummary};
use crate::mail::{CodeQuery, MailProvider, ProviderRegistry};
use crate::validator::{BatchValidator, ValidationProgress, ValidationReport};

use super::error::{RegistrationError, RegistrationResult};
use super::lock::ResourceLock;
use super::pipeline::{PipelineDeps, RegistrationPipeline};
use super::queue::TaskQueue;
use super::session::{SessionRegistry, SessionSnapshot};
use super::state::{BatchReport, BatchSnapshot, BatchState, BatchStatus};

/// Everything `GetState` reveals: batch counters, per-session progress and
/// the retained history with its summary. The session view is redacted;
/// history records carry credentials exactly as `ExportHistory` does.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub batch: BatchSnapshot,
    pub sessions: Vec<SessionSnapshot>,
    pub history: Vec<HistoryRecord>,
    pub history_summary: HistorySummary,
}

/// Answer to a verification-artifact request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationArtifact {
    /// A code was on the session already or just arrived from the provider.
    Code(String),
    /// The provider can read mail but nothing matching has arrived yet.
    Pending,
    /// The provider cannot read mail; the operator types the code by hand.
    ManualEntryRequired,
}

/// Ties the queue, the worker pool, the pipeline and the collaborators
/// together. One instance per process; commands arrive through
/// [`OrchestratorHandle`](super::commands::OrchestratorHandle).
pub struct Orchestrator {
    config: EnrollConfig,
    mail: Arc<dyn MailProvider>,
    contexts: Arc<dyn ContextHost>,
    history: Arc<HistoryStore>,
    registry: SessionRegistry,
    batch: BatchState,
    queue: TaskQueue,
    pipeline: Arc<RegistrationPipeline>,
    validator: BatchValidator,
    stop: Mutex<CancellationToken>,
    drain_task: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Wires an orchestrator from explicit collaborators. Must run inside a
    /// tokio runtime; the context event drain starts here.
    pub fn new(
        config: EnrollConfig,
        mail: Arc<dyn MailProvider>,
        auth: Arc<dyn AuthClient>,
        contexts: Arc<dyn ContextHost>,
        history: Arc<HistoryStore>,
    ) -> Arc<Self> {
        let registry = SessionRegistry::new();
        let batch = BatchState::new();
        let pipeline = Arc::new(RegistrationPipeline::new(
            &config,
            PipelineDeps {
                mail: mail.clone(),
                auth: auth.clone(),
                contexts: contexts.clone(),
                history: history.clone(),
                registry: registry.clone(),
                batch: batch.clone(),
                api_lock: ResourceLock::new("shared-api", config.locks.api_cooldown()),
                window_lock: ResourceLock::new("window", config.locks.window_cooldown()),
            },
        ));
        let validator = BatchValidator::new(auth, history.clone(), &config.validator);
        let drain_task = contexts.take_events().map(|mut events| {
            let registry = registry.clone();
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    registry.apply_context_event(&event);
                }
            })
        });
        Arc::new(Self {
            config,
            mail,
            contexts,
            history,
            registry,
            batch,
            queue: TaskQueue::new(),
            pipeline,
            validator,
            stop: Mutex::new(CancellationToken::new()),
            drain_task: Mutex::new(drain_task),
        })
    }

    /// Production wiring: HTTP auth client, chromium context host, on-disk
    /// history, mail provider named by config. The provider only has to
    /// exist here; configuration is enforced when a batch starts.
    pub fn from_config(config: EnrollConfig) -> RegistrationResult<Arc<Self>> {
        let providers = ProviderRegistry::from_config(&config.mail);
        let mail = providers.get(&config.mail.provider)?;
        let auth: Arc<dyn AuthClient> = Arc::new(HttpAuthClient::new(config.auth.clone()));
        let contexts: Arc<dyn ContextHost> =
            Arc::new(ChromiumContextHost::new(config.browser.clone()));
        let history = Arc::new(HistoryStore::open(
            &config.history.path,
            config.history.capacity,
        )?);
        Ok(Self::new(config, mail, auth, contexts, history))
    }

    pub fn config(&self) -> &EnrollConfig {
        &self.config
    }

    /// Runs a full batch and resolves once every worker has joined. `None`
    /// falls back to the configured defaults.
    pub async fn start_batch(
        self: &Arc<Self>,
        target: Option<u32>,
        concurrency: Option<u32>,
    ) -> RegistrationResult<BatchReport> {
        let target = target.unwrap_or(self.config.batch.default_target);
        let concurrency = concurrency
            .unwrap_or(self.config.batch.default_concurrency)
            .max(1);

        if !self.mail.is_configured() {
            return Err(RegistrationError::Configuration(format!(
                "mail provider {} is not configured",
                self.mail.id()
            )));
        }
        // Status flip, token install and queue fill form one critical
        // section: a stop that observes Running must land on this batch's
        // token and clear this batch's slots.
        let stop = {
            let mut guard = self.stop.lock().unwrap();
            if !self.batch.try_begin(target, concurrency) {
                return Err(RegistrationError::AlreadyRunning);
            }
            let fresh = CancellationToken::new();
            *guard = fresh.clone();
            self.queue.fill(target);
            fresh
        };

        info!(target: "enroll::engine", total = target, concurrency, "batch starting");
        self.registry.reset();

        let mut workers = Vec::with_capacity(concurrency as usize);
        for index in 0..concurrency {
            let worker = Arc::clone(self);
            workers.push(tokio::spawn(worker.worker_loop(index, stop.clone())));
        }

        let mut panicked = false;
        for handle in workers {
            if let Err(err) = handle.await {
                error!(target: "enroll::engine", error = %err, "worker task died");
                panicked = true;
            }
        }

        let status = if panicked {
            BatchStatus::Error
        } else if stop.is_cancelled() {
            BatchStatus::Idle
        } else {
            BatchStatus::Completed
        };
        let report = self.batch.finish(status);
        info!(
            target: "enroll::engine",
            status = %report.status,
            registered = report.registered,
            failed = report.failed,
            total = report.target,
            "batch finished"
        );
        Ok(report)
    }

    async fn worker_loop(self: Arc<Self>, index: u32, stop: CancellationToken) {
        if index > 0 {
            let stagger = self.config.batch.stagger_delay() * index;
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = tokio::time::sleep(stagger) => {}
            }
        }
        loop {
            if stop.is_cancelled() {
                return;
            }
            let Some(slot) = self.queue.pop() else { return };
            self.registry.prune_terminal();
            let session_id = self.registry.create(stop.child_token());
            debug!(
                target: "enroll::engine",
                worker = index,
                slot,
                session = %session_id,
                "session created"
            );
            self.pipeline.run(&session_id).await;
            let (registered, failed, target) = self.batch.counts();
            self.batch
                .set_step(format!("{registered}/{target} registered, {failed} failed"));

            if self.queue.is_empty() || stop.is_cancelled() {
                continue;
            }
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = tokio::time::sleep(self.config.batch.inter_task_delay()) => {}
            }
        }
    }

    /// Acknowledges immediately. Draining the queue keeps new sessions from
    /// starting; cancelling the stop token reaches every live session
    /// through its child token.
    pub fn stop_batch(&self) {
        let stop = self.stop.lock().unwrap();
        self.queue.clear();
        stop.cancel();
        if self.batch.is_running() {
            self.batch.set_step("stopping");
            info!(target: "enroll::engine", "stop requested");
        }
    }

    /// Hard zero: stop, close every known context, drop all sessions and
    /// batch counters. History is left alone.
    pub async fn reset(&self) -> RegistrationResult<()> {
        info!(target: "enroll::engine", "resetting orchestrator state");
        {
            let stop = self.stop.lock().unwrap();
            self.queue.clear();
            stop.cancel();
        }
        for snapshot in self.registry.snapshots() {
            if let Some(context_id) = snapshot.context_id {
                if let Err(err) = self.contexts.close(&context_id).await {
                    warn!(
                        target: "enroll::engine",
                        context = %context_id,
                        error = %err,
                        "could not close context during reset"
                    );
                }
            }
        }
        self.registry.reset();
        self.batch.reset();
        Ok(())
    }

    pub fn state(&self) -> StateSnapshot {
        StateSnapshot {
            batch: self.batch.snapshot(),
            sessions: self.registry.snapshots(),
            history: self.history.snapshot(),
            history_summary: self.history.summary(),
        }
    }

    /// Verification code for one session: cached, fetched from the provider,
    /// or an instruction to enter it manually.
    pub async fn verification_artifact(
        &self,
        session_id: &str,
    ) -> RegistrationResult<VerificationArtifact> {
        let session = self
            .registry
            .get(session_id)
            .ok_or_else(|| RegistrationError::UnknownSession(session_id.to_string()))?;
        if let Some(code) = session.verification_code {
            return Ok(VerificationArtifact::Code(code));
        }
        if !self.mail.can_auto_verify() {
            return Ok(VerificationArtifact::ManualEntryRequired);
        }
        let inbox = session.inbox.clone().ok_or_else(|| {
            RegistrationError::ResourceUnavailable("session has no mailbox yet".to_string())
        })?;
        let query = CodeQuery {
            since: session.created_at,
        };
        match self.mail.fetch_verification_code(&inbox, &query).await? {
            Some(code) => {
                self.registry.set_verification_code(session_id, code.clone());
                Ok(VerificationArtifact::Code(code))
            }
            None => Ok(VerificationArtifact::Pending),
        }
    }

    pub async fn validate_credentials(
        &self,
        progress: Option<mpsc::UnboundedSender<ValidationProgress>>,
    ) -> RegistrationResult<ValidationReport> {
        Ok(self.validator.validate_all(progress).await?)
    }

    pub fn recent_history(&self, limit: usize) -> Vec<HistoryRecord> {
        self.history.recent(limit)
    }

    pub fn clear_history(&self) -> RegistrationResult<usize> {
        Ok(self.history.clear()?)
    }

    pub fn export_history(&self) -> RegistrationResult<String> {
        Ok(self.history.export_json()?)
    }

    /// Tears down the context host and the event drain. Called once when the
    /// process is done with the orchestrator.
    pub async fn shutdown(&self) {
        self.stop.lock().unwrap().cancel();
        if let Err(err) = self.contexts.shutdown().await {
            warn!(target: "enroll::engine", error = %err, "context host shutdown failed");
        }
        if let Some(task) = self.drain_task.lock().unwrap().take() {
            task.abort();
        }
    }
}
