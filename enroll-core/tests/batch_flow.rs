use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc;

use enroll_core::auth::{
    AuthClient, AuthError, AuthResult, AuthorizationGrant, CredentialBundle, CredentialPoll,
    UsageProbe,
};
use enroll_core::config::EnrollConfig;
use enroll_core::context::{ContextEvent, ContextHost, ContextResult, IsolatedContext};
use enroll_core::history::HistoryStore;
use enroll_core::identity::Identity;
use enroll_core::mail::{CodeQuery, Inbox, MailProvider, MailResult};
use enroll_core::orchestrator::{
    serve, BatchStatus, Orchestrator, RegistrationError, SessionStatus, VerificationArtifact,
};

struct MockMail {
    configured: bool,
    code: Option<String>,
    minted: AtomicUsize,
}

impl MockMail {
    fn configured() -> Self {
        Self {
            configured: true,
            code: None,
            minted: AtomicUsize::new(0),
        }
    }

    fn with_code(code: &str) -> Self {
        Self {
            configured: true,
            code: Some(code.to_string()),
            minted: AtomicUsize::new(0),
        }
    }

    fn unconfigured() -> Self {
        Self {
            configured: false,
            code: None,
            minted: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl MailProvider for MockMail {
    fn id(&self) -> &'static str {
        "mock"
    }

    fn is_configured(&self) -> bool {
        self.configured
    }

    fn can_auto_verify(&self) -> bool {
        self.code.is_some()
    }

    async fn create_inbox(&self, identity: &Identity) -> MailResult<Inbox> {
        let n = self.minted.fetch_add(1, Ordering::SeqCst);
        Ok(Inbox {
            address: format!("{}.{n}@example.com", identity.first_name),
            provider: "mock".to_string(),
            handle: None,
        })
    }

    async fn fetch_verification_code(
        &self,
        _inbox: &Inbox,
        _query: &CodeQuery,
    ) -> MailResult<Option<String>> {
        Ok(self.code.clone())
    }

    async fn release_inbox(&self, _inbox: &Inbox) -> MailResult<()> {
        Ok(())
    }
}

/// Grants succeed except every `fail_every`-th request; credentials are
/// served on the first poll.
struct MockAuth {
    grants: AtomicUsize,
    fail_every: Option<usize>,
}

impl MockAuth {
    fn reliable() -> Self {
        Self {
            grants: AtomicUsize::new(0),
            fail_every: None,
        }
    }

    fn failing_every(n: usize) -> Self {
        Self {
            grants: AtomicUsize::new(0),
            fail_every: Some(n),
        }
    }
}

fn mock_grant(n: usize) -> AuthorizationGrant {
    AuthorizationGrant {
        client_id: format!("client-{n}"),
        client_secret: None,
        device_code: format!("device-{n}"),
        user_code: format!("CODE-{n}"),
        verification_uri: "https://auth.example/activate".to_string(),
        verification_uri_complete: Some(format!("https://auth.example/activate?n={n}")),
        expires_in: 1800,
        interval: 1,
    }
}

fn mock_bundle(tag: &str) -> CredentialBundle {
    CredentialBundle {
        access_token: format!("access-{tag}"),
        refresh_token: Some(format!("refresh-{tag}")),
        expires_in: Some(3600),
    }
}

#[async_trait]
impl AuthClient for MockAuth {
    async fn request_grant(&self) -> AuthResult<AuthorizationGrant> {
        let n = self.grants.fetch_add(1, Ordering::SeqCst);
        if let Some(k) = self.fail_every {
            if (n + 1) % k == 0 {
                return Err(AuthError::Denied {
                    code: "access_denied".to_string(),
                });
            }
        }
        Ok(mock_grant(n))
    }

    async fn fetch_credential(&self, grant: &AuthorizationGrant) -> AuthResult<CredentialPoll> {
        Ok(CredentialPoll::Ready(mock_bundle(&grant.client_id)))
    }

    async fn refresh_credential(
        &self,
        _client_id: Option<&str>,
        _refresh_token: &str,
    ) -> AuthResult<CredentialBundle> {
        unreachable!("batch flow never refreshes")
    }

    async fn probe_usage(&self, _access_token: &str) -> AuthResult<UsageProbe> {
        unreachable!("batch flow never probes usage")
    }
}

/// Auth client that keeps sessions in the polling state until the test stops
/// the batch: every fetch reports the approval as still pending.
struct PendingAuth {
    inner: MockAuth,
}

#[async_trait]
impl AuthClient for PendingAuth {
    async fn request_grant(&self) -> AuthResult<AuthorizationGrant> {
        self.inner.request_grant().await
    }

    async fn fetch_credential(&self, _grant: &AuthorizationGrant) -> AuthResult<CredentialPoll> {
        Ok(CredentialPoll::Pending)
    }

    async fn refresh_credential(
        &self,
        _client_id: Option<&str>,
        _refresh_token: &str,
    ) -> AuthResult<CredentialBundle> {
        unreachable!()
    }

    async fn probe_usage(&self, _access_token: &str) -> AuthResult<UsageProbe> {
        unreachable!()
    }
}

struct MockContexts {
    counter: AtomicUsize,
    unusable_for: Option<usize>,
    open: Mutex<HashSet<String>>,
    closed: AtomicUsize,
}

impl MockContexts {
    fn reliable() -> Self {
        Self {
            counter: AtomicUsize::new(0),
            unusable_for: None,
            open: Mutex::new(HashSet::new()),
            closed: AtomicUsize::new(0),
        }
    }

    fn unusable_on(n: usize) -> Self {
        Self {
            unusable_for: Some(n),
            ..Self::reliable()
        }
    }
}

#[async_trait]
impl ContextHost for MockContexts {
    async fn create(&self, _url: &str) -> ContextResult<IsolatedContext> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        if self.unusable_for == Some(n) {
            return Ok(IsolatedContext::default());
        }
        let context_id = format!("ctx-{n}");
        self.open.lock().unwrap().insert(context_id.clone());
        Ok(IsolatedContext {
            context_id: Some(context_id),
            surface_id: Some(format!("tab-{n}")),
        })
    }

    async fn wait_ready(
        &self,
        _context: &IsolatedContext,
        _timeout: Duration,
    ) -> ContextResult<bool> {
        Ok(true)
    }

    async fn close(&self, context_id: &str) -> ContextResult<()> {
        self.open.lock().unwrap().remove(context_id);
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ContextEvent>> {
        None
    }

    async fn shutdown(&self) -> ContextResult<()> {
        Ok(())
    }
}

fn test_config(dir: &TempDir) -> EnrollConfig {
    let mut config = EnrollConfig::default();
    config.history.path = dir
        .path()
        .join("history.json")
        .to_string_lossy()
        .to_string();
    config
}

fn orchestrator(
    dir: &TempDir,
    mail: Arc<MockMail>,
    auth: Arc<dyn AuthClient>,
    contexts: Arc<MockContexts>,
) -> Arc<Orchestrator> {
    let config = test_config(dir);
    let history =
        Arc::new(HistoryStore::open(&config.history.path, config.history.capacity).unwrap());
    Orchestrator::new(config, mail, auth, contexts, history)
}

#[tokio::test(start_paused = true)]
async fn batch_of_three_with_two_workers_completes() {
    let dir = TempDir::new().unwrap();
    let contexts = Arc::new(MockContexts::reliable());
    let orch = orchestrator(
        &dir,
        Arc::new(MockMail::configured()),
        Arc::new(MockAuth::reliable()),
        contexts.clone(),
    );

    let report = orch.start_batch(Some(3), Some(2)).await.unwrap();
    assert_eq!(report.status, BatchStatus::Completed);
    assert_eq!(report.registered, 3);
    assert_eq!(report.failed, 0);
    assert_eq!(report.target, 3);

    let state = orch.state();
    assert_eq!(state.batch.total_registered, 3);
    assert!(state.batch.last_success.is_some());
    assert!(state.batch.step.starts_with("finished: 3/3"));

    // The snapshot carries the records themselves, not just the counts.
    assert_eq!(state.history.len(), 3);
    assert!(state.history.iter().all(|record| record.success));
    assert_eq!(state.history_summary.succeeded, 3);

    // Each record kept the identity its session generated.
    for record in &state.history {
        assert!(record.display_name.is_some());
        assert!(record.password.is_some());
    }

    // Every context was closed on cleanup.
    assert!(contexts.open.lock().unwrap().is_empty());
    assert_eq!(contexts.closed.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn registered_plus_failed_always_equals_target() {
    let dir = TempDir::new().unwrap();
    let orch = orchestrator(
        &dir,
        Arc::new(MockMail::configured()),
        Arc::new(MockAuth::failing_every(3)),
        Arc::new(MockContexts::reliable()),
    );

    let report = orch.start_batch(Some(7), Some(3)).await.unwrap();
    assert_eq!(report.status, BatchStatus::Completed);
    assert_eq!(report.registered + report.failed, 7);
    assert_eq!(report.failed, 2);

    let state = orch.state();
    assert_eq!(state.history.len(), 7);
    assert_eq!(state.history_summary.failed, 2);
}

#[tokio::test(start_paused = true)]
async fn empty_batch_resolves_immediately() {
    let dir = TempDir::new().unwrap();
    let orch = orchestrator(
        &dir,
        Arc::new(MockMail::configured()),
        Arc::new(MockAuth::reliable()),
        Arc::new(MockContexts::reliable()),
    );

    let report = orch.start_batch(Some(0), Some(2)).await.unwrap();
    assert_eq!(report.status, BatchStatus::Completed);
    assert_eq!(report.registered, 0);
    assert_eq!(report.failed, 0);
}

#[tokio::test(start_paused = true)]
async fn second_start_is_rejected_while_running() {
    let dir = TempDir::new().unwrap();
    let orch = orchestrator(
        &dir,
        Arc::new(MockMail::configured()),
        Arc::new(PendingAuth {
            inner: MockAuth::reliable(),
        }),
        Arc::new(MockContexts::reliable()),
    );

    let background = {
        let orch = orch.clone();
        tokio::spawn(async move { orch.start_batch(Some(2), Some(1)).await })
    };
    tokio::time::sleep(Duration::from_secs(4)).await;

    let err = orch.start_batch(Some(1), Some(1)).await.unwrap_err();
    assert!(matches!(err, RegistrationError::AlreadyRunning));

    orch.stop_batch();
    let report = background.await.unwrap().unwrap();
    assert_ne!(report.status, BatchStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn stop_aborts_live_sessions_and_never_completes() {
    let dir = TempDir::new().unwrap();
    let orch = orchestrator(
        &dir,
        Arc::new(MockMail::configured()),
        Arc::new(PendingAuth {
            inner: MockAuth::reliable(),
        }),
        Arc::new(MockContexts::reliable()),
    );

    let background = {
        let orch = orch.clone();
        tokio::spawn(async move { orch.start_batch(Some(5), Some(2)).await })
    };
    // Both workers are polling by now: worker 0 from the start, worker 1
    // after its 3s stagger.
    tokio::time::sleep(Duration::from_secs(4)).await;
    orch.stop_batch();

    let report = background.await.unwrap().unwrap();
    assert_eq!(report.status, BatchStatus::Idle);
    assert_eq!(report.registered, 0);
    assert_eq!(report.failed, 2, "only the two in-flight sessions ran");

    let state = orch.state();
    for session in &state.sessions {
        assert_eq!(session.status, SessionStatus::Error);
        assert_eq!(session.error.as_deref(), Some("aborted"));
    }
    assert!(state.batch.step.starts_with("finished: 0/5"));
}

#[tokio::test(start_paused = true)]
async fn stop_right_after_start_is_never_lost() {
    let dir = TempDir::new().unwrap();
    let orch = orchestrator(
        &dir,
        Arc::new(MockMail::configured()),
        Arc::new(PendingAuth {
            inner: MockAuth::reliable(),
        }),
        Arc::new(MockContexts::reliable()),
    );
    let handle = serve(orch);

    let starter = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.start_batch(Some(3), Some(1)).await })
    };

    // Stop the instant Running becomes observable, before any worker makes
    // progress. The stop must land on this batch's token, not a stale one.
    let mut running = false;
    for _ in 0..50 {
        if handle.get_state().await.unwrap().batch.status == BatchStatus::Running {
            running = true;
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(running, "batch never became observable as running");
    handle.stop_batch().await.unwrap();

    let report = starter.await.unwrap().unwrap();
    assert_ne!(report.status, BatchStatus::Completed);
    assert_eq!(report.registered, 0);
}

#[tokio::test(start_paused = true)]
async fn unusable_context_fails_one_session_not_the_batch() {
    let dir = TempDir::new().unwrap();
    let orch = orchestrator(
        &dir,
        Arc::new(MockMail::configured()),
        Arc::new(MockAuth::reliable()),
        Arc::new(MockContexts::unusable_on(1)),
    );

    let report = orch.start_batch(Some(3), Some(1)).await.unwrap();
    assert_eq!(report.status, BatchStatus::Completed);
    assert_eq!(report.registered, 2);
    assert_eq!(report.failed, 1);

    let state = orch.state();
    let failure = state
        .sessions
        .iter()
        .find(|s| s.status == SessionStatus::Error)
        .map(|s| s.error.clone().unwrap());
    match failure {
        Some(message) => assert!(message.contains("isolated"), "got: {message}"),
        // The failed session may have been pruned; the history record keeps
        // the message either way.
        None => {
            let json = orch.export_history().unwrap();
            assert!(json.contains("isolated"), "got: {json}");
        }
    }
}

#[tokio::test(start_paused = true)]
async fn unconfigured_provider_refuses_to_start() {
    let dir = TempDir::new().unwrap();
    let orch = orchestrator(
        &dir,
        Arc::new(MockMail::unconfigured()),
        Arc::new(MockAuth::reliable()),
        Arc::new(MockContexts::reliable()),
    );

    let err = orch.start_batch(Some(2), Some(1)).await.unwrap_err();
    assert!(matches!(err, RegistrationError::Configuration(_)));
    assert_eq!(orch.state().batch.status, BatchStatus::Idle);
}

#[tokio::test(start_paused = true)]
async fn command_handle_round_trip() {
    let dir = TempDir::new().unwrap();
    let orch = orchestrator(
        &dir,
        Arc::new(MockMail::with_code("482915")),
        Arc::new(MockAuth::reliable()),
        Arc::new(MockContexts::reliable()),
    );
    let handle = serve(orch);

    let report = handle.start_batch(Some(2), Some(1)).await.unwrap();
    assert_eq!(report.status, BatchStatus::Completed);
    assert_eq!(report.registered, 2);

    let state = handle.get_state().await.unwrap();
    assert_eq!(state.batch.total_registered, 2);
    assert!(!state.sessions.is_empty());

    let session_id = state.sessions[0].id.clone();
    let artifact = handle.verification_artifact(session_id.clone()).await.unwrap();
    assert_eq!(artifact, VerificationArtifact::Code("482915".to_string()));
    // Second lookup serves the cached code.
    let cached = handle.verification_artifact(session_id).await.unwrap();
    assert_eq!(cached, VerificationArtifact::Code("482915".to_string()));

    let err = handle.verification_artifact("missing").await.unwrap_err();
    assert!(matches!(err, RegistrationError::UnknownSession(_)));

    let exported = handle.export_history().await.unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&exported).unwrap();
    assert_eq!(parsed["records"].as_array().unwrap().len(), 2);

    assert_eq!(handle.clear_history().await.unwrap(), 2);
    assert!(handle.get_state().await.unwrap().history.is_empty());
}

#[tokio::test(start_paused = true)]
async fn reset_zeroes_sessions_but_keeps_history() {
    let dir = TempDir::new().unwrap();
    let orch = orchestrator(
        &dir,
        Arc::new(MockMail::configured()),
        Arc::new(MockAuth::reliable()),
        Arc::new(MockContexts::reliable()),
    );
    let handle = serve(orch.clone());

    handle.start_batch(Some(2), Some(1)).await.unwrap();
    assert!(!orch.state().sessions.is_empty());

    handle.reset().await.unwrap();
    let state = orch.state();
    assert_eq!(state.batch.status, BatchStatus::Idle);
    assert!(state.sessions.is_empty());
    assert_eq!(state.batch.total_registered, 0);
    // History is a persisted store; reset leaves it alone.
    assert_eq!(state.history.len(), 2);

    let report = orch.start_batch(Some(1), Some(1)).await.unwrap();
    assert_eq!(report.status, BatchStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn stop_on_idle_does_not_poison_the_next_batch() {
    let dir = TempDir::new().unwrap();
    let orch = orchestrator(
        &dir,
        Arc::new(MockMail::configured()),
        Arc::new(MockAuth::reliable()),
        Arc::new(MockContexts::reliable()),
    );

    orch.stop_batch();
    let report = orch.start_batch(Some(2), Some(1)).await.unwrap();
    assert_eq!(report.status, BatchStatus::Completed);
    assert_eq!(report.registered, 2);
}

#[tokio::test(start_paused = true)]
async fn manual_provider_reports_manual_entry() {
    let dir = TempDir::new().unwrap();
    let orch = orchestrator(
        &dir,
        Arc::new(MockMail::configured()),
        Arc::new(MockAuth::reliable()),
        Arc::new(MockContexts::reliable()),
    );

    orch.start_batch(Some(1), Some(1)).await.unwrap();
    let state = orch.state();
    let session_id = state.sessions[0].id.clone();
    let artifact = orch.verification_artifact(&session_id).await.unwrap();
    assert_eq!(artifact, VerificationArtifact::ManualEntryRequired);
}
