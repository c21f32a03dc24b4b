//! Re-validation of previously enrolled credentials.
//!
//! Walks the history for successful records that still carry a refresh
//! credential, refreshes each one and probes the usage endpoint with the
//! fresh access credential. Work happens in fixed-size waves so the service
//! never sees the whole history at once.

use std::sync::Arc;
use std::time::Duration;

use futures::future;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auth::{AuthClient, AuthError, CredentialBundle, UsageProbe};
use crate::config::ValidatorSection;
use crate::history::{HistoryError, HistoryRecord, HistoryStore, TokenStatus};

/// Emitted after each wave. `validated` counts records processed so far.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ValidationProgress {
    pub validated: usize,
    pub total: usize,
}

/// One non-valid record, kept so operators can see what went wrong where.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationDetail {
    pub id: String,
    pub email: String,
    pub status: TokenStatus,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub total: usize,
    pub valid: usize,
    pub expired: usize,
    pub suspended: usize,
    pub invalid: usize,
    pub error: usize,
    pub details: Vec<ValidationDetail>,
}

impl ValidationReport {
    fn new(total: usize) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    fn absorb(&mut self, outcome: ValidationOutcome) {
        match outcome.status {
            TokenStatus::Valid => self.valid += 1,
            TokenStatus::Expired => self.expired += 1,
            TokenStatus::Suspended => self.suspended += 1,
            TokenStatus::Invalid => self.invalid += 1,
            TokenStatus::Error | TokenStatus::Unknown => self.error += 1,
        }
        if outcome.status != TokenStatus::Valid {
            self.details.push(ValidationDetail {
                id: outcome.id,
                email: outcome.email,
                status: outcome.status,
                note: outcome.note,
            });
        }
    }
}

struct ValidationOutcome {
    id: String,
    email: String,
    status: TokenStatus,
    note: Option<String>,
}

/// Refresh-and-probe runner over the history store.
pub struct BatchValidator {
    auth: Arc<dyn AuthClient>,
    history: Arc<HistoryStore>,
    batch_size: usize,
    inter_batch_delay: Duration,
}

impl BatchValidator {
    pub fn new(
        auth: Arc<dyn AuthClient>,
        history: Arc<HistoryStore>,
        config: &ValidatorSection,
    ) -> Self {
        Self {
            auth,
            history,
            batch_size: config.batch_size.max(1),
            inter_batch_delay: config.inter_batch_delay(),
        }
    }

    /// Validates every eligible record. Records inside a wave run
    /// concurrently; waves run in order with a pause in between. A fault on
    /// one record maps to the error category and never stops the run.
    pub async fn validate_all(
        &self,
        progress: Option<mpsc::UnboundedSender<ValidationProgress>>,
    ) -> Result<ValidationReport, HistoryError> {
        let eligible: Vec<HistoryRecord> = self
            .history
            .snapshot()
            .into_iter()
            .filter(HistoryRecord::eligible_for_validation)
            .collect();
        let total = eligible.len();
        info!(target: "enroll::validator", total, "validating credentials");

        let mut report = ValidationReport::new(total);
        let mut validated = 0;
        for (wave, chunk) in eligible.chunks(self.batch_size).enumerate() {
            if wave > 0 {
                tokio::time::sleep(self.inter_batch_delay).await;
            }
            let checks = chunk.iter().map(|record| self.validate_one(record));
            for outcome in future::join_all(checks).await {
                self.history.set_token_status(&outcome.id, outcome.status);
                report.absorb(outcome);
            }
            validated += chunk.len();
            if let Some(tx) = &progress {
                let _ = tx.send(ValidationProgress { validated, total });
            }
        }

        self.history.persist()?;
        info!(
            target: "enroll::validator",
            valid = report.valid,
            expired = report.expired,
            suspended = report.suspended,
            invalid = report.invalid,
            error = report.error,
            "validation finished"
        );
        Ok(report)
    }

    async fn validate_one(&self, record: &HistoryRecord) -> ValidationOutcome {
        let mut outcome = ValidationOutcome {
            id: record.id.clone(),
            email: record.email.clone(),
            status: TokenStatus::Error,
            note: None,
        };

        let refresh = record
            .credentials
            .as_ref()
            .and_then(|c| c.refresh_token.clone());
        let Some(refresh) = refresh else {
            outcome.note = Some("no refresh credential on record".to_string());
            return outcome;
        };

        let refreshed = match self
            .auth
            .refresh_credential(record.client_id.as_deref(), &refresh)
            .await
        {
            Ok(bundle) => bundle,
            Err(err) => {
                outcome.status = classify_refresh_error(&err);
                outcome.note = Some(err.to_string());
                warn!(
                    target: "enroll::validator",
                    email = %record.email,
                    status = %outcome.status,
                    error = %err,
                    "credential refresh failed"
                );
                return outcome;
            }
        };

        // The new pair is kept even if the probe below disagrees; a served
        // refresh response is always fresher than what we stored.
        self.history
            .replace_credentials(&record.id, carry_refresh(record, refreshed.clone()));

        match self.auth.probe_usage(&refreshed.access_token).await {
            Ok(probe) => {
                outcome.status = classify_probe(&probe);
                if outcome.status != TokenStatus::Valid {
                    outcome.note = Some(format!("usage probe returned {}", probe.status));
                }
                debug!(
                    target: "enroll::validator",
                    email = %record.email,
                    status = %outcome.status,
                    http = probe.status,
                    "credential checked"
                );
            }
            Err(err) => {
                outcome.status = match err {
                    AuthError::Denied { .. } | AuthError::Endpoint { .. } => TokenStatus::Invalid,
                    _ => TokenStatus::Error,
                };
                outcome.note = Some(err.to_string());
            }
        }
        outcome
    }
}

/// A refresh response may omit the refresh token; the old one stays valid
/// then and must not be lost.
fn carry_refresh(record: &HistoryRecord, mut bundle: CredentialBundle) -> CredentialBundle {
    if bundle.refresh_token.is_none() {
        bundle.refresh_token = record
            .credentials
            .as_ref()
            .and_then(|c| c.refresh_token.clone());
    }
    bundle
}

/// Single classification order for probe responses. Body markers outrank the
/// raw status so a suspended account behind a 403 still reads as suspended.
fn classify_response(status: u16, body: &str) -> TokenStatus {
    let body = body.to_ascii_lowercase();
    if body.contains("suspend") {
        TokenStatus::Suspended
    } else if status == 401 || body.contains("expired") || body.contains("invalid_grant") {
        TokenStatus::Expired
    } else if body.contains("denied")
        || body.contains("validation")
        || body.contains("not_found")
        || body.contains("not found")
    {
        TokenStatus::Invalid
    } else if status >= 500 {
        TokenStatus::Error
    } else if (200..300).contains(&status) {
        TokenStatus::Valid
    } else {
        TokenStatus::Invalid
    }
}

fn classify_probe(probe: &UsageProbe) -> TokenStatus {
    classify_response(probe.status, &probe.body)
}

fn classify_refresh_error(err: &AuthError) -> TokenStatus {
    match err {
        AuthError::Denied { code } => classify_response(400, code),
        AuthError::Endpoint { status, body, .. } => classify_response(*status, body),
        AuthError::Transport(_) | AuthError::Serialization(_) => TokenStatus::Error,
    }
}
