use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::auth::CredentialBundle;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history io error at {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("history serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("unknown token status: {0}")]
    UnknownStatus(String),
}

pub type HistoryResult<T> = Result<T, HistoryError>;

/// Health of a stored credential as of its last validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    Unknown,
    Valid,
    Expired,
    Suspended,
    Invalid,
    Error,
}

impl TokenStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenStatus::Unknown => "unknown",
            TokenStatus::Valid => "valid",
            TokenStatus::Expired => "expired",
            TokenStatus::Suspended => "suspended",
            TokenStatus::Invalid => "invalid",
            TokenStatus::Error => "error",
        }
    }
}

impl fmt::Display for TokenStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TokenStatus {
    type Err = HistoryError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "unknown" => Ok(TokenStatus::Unknown),
            "valid" => Ok(TokenStatus::Valid),
            "expired" => Ok(TokenStatus::Expired),
            "suspended" => Ok(TokenStatus::Suspended),
            "invalid" => Ok(TokenStatus::Invalid),
            "error" => Ok(TokenStatus::Error),
            other => Err(HistoryError::UnknownStatus(other.to_string())),
        }
    }
}

/// One finished enrollment attempt. Append-only, except that validation may
/// rewrite `token_status` and swap the credential pair after a refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub email: String,
    pub display_name: Option<String>,
    pub password: Option<String>,
    /// OAuth client registered for this account; refreshes need it.
    pub client_id: Option<String>,
    pub success: bool,
    pub error: Option<String>,
    pub credentials: Option<CredentialBundle>,
    /// `None` until the validator has looked at this record.
    pub token_status: Option<TokenStatus>,
    pub checked_at: Option<DateTime<Utc>>,
}

impl HistoryRecord {
    pub fn succeeded(
        email: impl Into<String>,
        display_name: Option<String>,
        password: Option<String>,
        client_id: Option<String>,
        credentials: CredentialBundle,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            email: email.into(),
            display_name,
            password,
            client_id,
            success: true,
            error: None,
            credentials: Some(credentials),
            token_status: None,
            checked_at: None,
        }
    }

    pub fn failed(email: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            email: email.into(),
            display_name: None,
            password: None,
            client_id: None,
            success: false,
            error: Some(error.into()),
            credentials: None,
            token_status: None,
            checked_at: None,
        }
    }

    /// Whether the validator can do anything with this record.
    pub fn eligible_for_validation(&self) -> bool {
        self.success
            && self
                .credentials
                .as_ref()
                .map(|c| c.refresh_token.is_some())
                .unwrap_or(false)
    }
}

/// On-disk document shape.
#[derive(Debug, Default, Serialize, Deserialize)]
struct HistoryFile {
    records: Vec<HistoryRecord>,
}

/// Counts surfaced by the status command.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HistorySummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub valid: usize,
    pub expired: usize,
    pub suspended: usize,
    pub invalid: usize,
    pub error: usize,
    pub unknown: usize,
    /// Successful records never seen by the validator.
    pub unchecked: usize,
}

/// Capped, newest-first record store persisted as one flat JSON document.
///
/// Only the newest `capacity` records survive an insert; the oldest fall off
/// the tail and disappear from disk on the next persist.
#[derive(Debug)]
pub struct HistoryStore {
    path: PathBuf,
    capacity: usize,
    records: Mutex<Vec<HistoryRecord>>,
}

impl HistoryStore {
    /// Opens the store, loading any existing document at `path`.
    pub fn open<P: AsRef<Path>>(path: P, capacity: usize) -> HistoryResult<Self> {
        let path = path.as_ref().to_path_buf();
        let capacity = capacity.max(1);
        let mut records = if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|source| HistoryError::Io {
                source,
                path: path.clone(),
            })?;
            serde_json::from_str::<HistoryFile>(&content)?.records
        } else {
            Vec::new()
        };
        records.truncate(capacity);
        tracing::debug!(
            target: "enroll::history",
            path = %path.display(),
            records = records.len(),
            "opened history store"
        );
        Ok(Self {
            path,
            capacity,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts at the head and drops anything past the cap.
    pub fn insert(&self, record: HistoryRecord) -> HistoryResult<()> {
        {
            let mut records = self.records.lock().unwrap();
            records.insert(0, record);
            records.truncate(self.capacity);
        }
        self.persist()
    }

    /// Sets the validation outcome for one record, in memory only. The
    /// validator persists once per run.
    pub fn set_token_status(&self, id: &str, status: TokenStatus) -> bool {
        let mut records = self.records.lock().unwrap();
        match records.iter_mut().find(|r| r.id == id) {
            Some(record) => {
                record.token_status = Some(status);
                record.checked_at = Some(Utc::now());
                true
            }
            None => false,
        }
    }

    /// Swaps in a refreshed credential pair, in memory only.
    pub fn replace_credentials(&self, id: &str, bundle: CredentialBundle) -> bool {
        let mut records = self.records.lock().unwrap();
        match records.iter_mut().find(|r| r.id == id) {
            Some(record) => {
                record.credentials = Some(bundle);
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self) -> Vec<HistoryRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn recent(&self, limit: usize) -> Vec<HistoryRecord> {
        let records = self.records.lock().unwrap();
        records.iter().take(limit).cloned().collect()
    }

    pub fn clear(&self) -> HistoryResult<usize> {
        let removed = {
            let mut records = self.records.lock().unwrap();
            let removed = records.len();
            records.clear();
            removed
        };
        self.persist()?;
        Ok(removed)
    }

    /// Pretty-printed copy of the persisted document.
    pub fn export_json(&self) -> HistoryResult<String> {
        let records = self.records.lock().unwrap();
        let file = HistoryFile {
            records: records.clone(),
        };
        Ok(serde_json::to_string_pretty(&file)?)
    }

    pub fn summary(&self) -> HistorySummary {
        let records = self.records.lock().unwrap();
        let mut summary = HistorySummary {
            total: records.len(),
            ..HistorySummary::default()
        };
        for record in records.iter() {
            if record.success {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
            }
            match record.token_status {
                Some(TokenStatus::Valid) => summary.valid += 1,
                Some(TokenStatus::Expired) => summary.expired += 1,
                Some(TokenStatus::Suspended) => summary.suspended += 1,
                Some(TokenStatus::Invalid) => summary.invalid += 1,
                Some(TokenStatus::Error) => summary.error += 1,
                Some(TokenStatus::Unknown) => summary.unknown += 1,
                None if record.success => summary.unchecked += 1,
                None => {}
            }
        }
        summary
    }

    pub fn persist(&self) -> HistoryResult<()> {
        let content = {
            let records = self.records.lock().unwrap();
            let file = HistoryFile {
                records: records.clone(),
            };
            serde_json::to_string_pretty(&file)?
        };
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| HistoryError::Io {
                    source,
                    path: parent.to_path_buf(),
                })?;
            }
        }
        // Atomic write
        let temp_path = self.path.with_extension("tmp");
        std::fs::write(&temp_path, content).map_err(|source| HistoryError::Io {
            source,
            path: temp_path.clone(),
        })?;
        std::fs::rename(&temp_path, &self.path).map_err(|source| HistoryError::Io {
            source,
            path: self.path.clone(),
        })?;
        Ok(())
    }
}
