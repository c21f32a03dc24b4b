use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc;

use enroll_core::auth::{
    AuthClient, AuthError, AuthResult, AuthorizationGrant, CredentialBundle, CredentialPoll,
    UsageProbe,
};
use enroll_core::config::ValidatorSection;
use enroll_core::history::{HistoryRecord, HistoryStore, TokenStatus};
use enroll_core::validator::BatchValidator;

/// Behavior is keyed on the refresh token itself, so each seeded record
/// steers its own outcome. The concurrency counters verify wave sizing.
struct ScriptedAuth {
    refreshes: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedAuth {
    fn new() -> Self {
        Self {
            refreshes: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    fn peak(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthClient for ScriptedAuth {
    async fn request_grant(&self) -> AuthResult<AuthorizationGrant> {
        unreachable!("validation never requests grants")
    }

    async fn fetch_credential(&self, _grant: &AuthorizationGrant) -> AuthResult<CredentialPoll> {
        unreachable!("validation never polls")
    }

    async fn refresh_credential(
        &self,
        _client_id: Option<&str>,
        refresh_token: &str,
    ) -> AuthResult<CredentialBundle> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match refresh_token {
            "rt-expired" => Err(AuthError::Denied {
                code: "invalid_grant".to_string(),
            }),
            "rt-unreachable" => Err(AuthError::Endpoint {
                endpoint: "https://auth.example/token".to_string(),
                status: 502,
                body: "bad gateway".to_string(),
            }),
            other => Ok(CredentialBundle {
                access_token: format!("fresh-{other}"),
                refresh_token: None,
                expires_in: Some(3600),
            }),
        }
    }

    async fn probe_usage(&self, access_token: &str) -> AuthResult<UsageProbe> {
        if access_token.contains("rt-suspended") {
            return Ok(UsageProbe {
                status: 403,
                body: "account suspended".to_string(),
            });
        }
        if access_token.contains("rt-denied") {
            return Ok(UsageProbe {
                status: 403,
                body: "access denied".to_string(),
            });
        }
        Ok(UsageProbe {
            status: 200,
            body: "ok".to_string(),
        })
    }
}

fn success_record(email: &str, refresh: &str) -> HistoryRecord {
    HistoryRecord::succeeded(
        email,
        Some("Someone Enrolled".to_string()),
        Some("pw".to_string()),
        Some("client-x".to_string()),
        CredentialBundle {
            access_token: "stale-access".to_string(),
            refresh_token: Some(refresh.to_string()),
            expires_in: Some(3600),
        },
    )
}

fn store_with(dir: &TempDir, records: Vec<HistoryRecord>) -> Arc<HistoryStore> {
    let store = Arc::new(HistoryStore::open(dir.path().join("history.json"), 100).unwrap());
    // Inserts go to the head; reverse so the listed order is preserved.
    for record in records.into_iter().rev() {
        store.insert(record).unwrap();
    }
    store
}

fn validator(auth: Arc<ScriptedAuth>, store: Arc<HistoryStore>) -> BatchValidator {
    BatchValidator::new(auth, store, &ValidatorSection::default())
}

#[tokio::test(start_paused = true)]
async fn twelve_eligible_records_run_in_waves_of_five() {
    let dir = TempDir::new().unwrap();
    let mut records: Vec<HistoryRecord> = (0..12)
        .map(|n| success_record(&format!("u{n}@example.com"), &format!("rt-ok-{n}")))
        .collect();
    records.push(HistoryRecord::failed("broken@example.com", "grant denied"));
    records.push(HistoryRecord::succeeded(
        "norefresh@example.com",
        None,
        None,
        None,
        CredentialBundle {
            access_token: "only-access".to_string(),
            refresh_token: None,
            expires_in: None,
        },
    ));
    let auth = Arc::new(ScriptedAuth::new());
    let store = store_with(&dir, records);
    let validator = validator(auth.clone(), store.clone());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let report = validator.validate_all(Some(tx)).await.unwrap();

    assert_eq!(report.total, 12);
    assert_eq!(report.valid, 12);
    assert_eq!(
        report.valid + report.expired + report.suspended + report.invalid + report.error,
        12
    );
    assert_eq!(auth.refreshes.load(Ordering::SeqCst), 12);
    assert_eq!(auth.peak(), 5, "waves are capped at the batch size");

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push((event.validated, event.total));
    }
    assert_eq!(events, vec![(5, 12), (10, 12), (12, 12)]);

    // The two ineligible records were never touched.
    let snapshot = store.snapshot();
    let untouched = snapshot
        .iter()
        .filter(|r| r.token_status.is_none())
        .count();
    assert_eq!(untouched, 2);
}

#[tokio::test(start_paused = true)]
async fn categories_follow_the_classification_rules() {
    let dir = TempDir::new().unwrap();
    let records = vec![
        success_record("ok@example.com", "rt-ok"),
        success_record("expired@example.com", "rt-expired"),
        success_record("suspended@example.com", "rt-suspended"),
        success_record("denied@example.com", "rt-denied"),
        success_record("offline@example.com", "rt-unreachable"),
    ];
    let auth = Arc::new(ScriptedAuth::new());
    let store = store_with(&dir, records);
    let validator = validator(auth, store.clone());

    let report = validator.validate_all(None).await.unwrap();
    assert_eq!(report.total, 5);
    assert_eq!(report.valid, 1);
    assert_eq!(report.expired, 1);
    assert_eq!(report.suspended, 1);
    assert_eq!(report.invalid, 1);
    assert_eq!(report.error, 1);
    assert_eq!(report.details.len(), 4, "valid records carry no detail");

    let status_of = |email: &str| {
        store
            .snapshot()
            .into_iter()
            .find(|r| r.email == email)
            .unwrap()
            .token_status
    };
    assert_eq!(status_of("ok@example.com"), Some(TokenStatus::Valid));
    assert_eq!(status_of("expired@example.com"), Some(TokenStatus::Expired));
    assert_eq!(
        status_of("suspended@example.com"),
        Some(TokenStatus::Suspended)
    );
    assert_eq!(status_of("denied@example.com"), Some(TokenStatus::Invalid));
    assert_eq!(status_of("offline@example.com"), Some(TokenStatus::Error));
}

#[tokio::test(start_paused = true)]
async fn refreshed_credentials_replace_the_stored_pair() {
    let dir = TempDir::new().unwrap();
    let records = vec![
        success_record("ok@example.com", "rt-ok"),
        success_record("suspended@example.com", "rt-suspended"),
        success_record("expired@example.com", "rt-expired"),
    ];
    let auth = Arc::new(ScriptedAuth::new());
    let store = store_with(&dir, records);
    let validator = validator(auth, store.clone());
    validator.validate_all(None).await.unwrap();

    let credentials_of = |email: &str| {
        store
            .snapshot()
            .into_iter()
            .find(|r| r.email == email)
            .unwrap()
            .credentials
            .unwrap()
    };

    let ok = credentials_of("ok@example.com");
    assert_eq!(ok.access_token, "fresh-rt-ok");
    // Refresh response omitted the refresh token; the old one is kept.
    assert_eq!(ok.refresh_token.as_deref(), Some("rt-ok"));

    // A successful refresh updates the pair even when the probe then says
    // the account is unusable.
    let suspended = credentials_of("suspended@example.com");
    assert_eq!(suspended.access_token, "fresh-rt-suspended");

    // A failed refresh leaves the stored pair alone.
    let expired = credentials_of("expired@example.com");
    assert_eq!(expired.access_token, "stale-access");

    // Statuses survive a reopen, so the run was persisted.
    let reopened = HistoryStore::open(dir.path().join("history.json"), 100).unwrap();
    let statuses: Vec<Option<TokenStatus>> = reopened
        .snapshot()
        .into_iter()
        .map(|r| r.token_status)
        .collect();
    assert!(statuses.iter().all(Option::is_some));
}

#[tokio::test(start_paused = true)]
async fn empty_history_emits_no_progress() {
    let dir = TempDir::new().unwrap();
    let auth = Arc::new(ScriptedAuth::new());
    let store = store_with(&dir, Vec::new());
    let validator = validator(auth, store);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let report = validator.validate_all(Some(tx)).await.unwrap();
    assert_eq!(report.total, 0);
    assert!(rx.try_recv().is_err());
}
