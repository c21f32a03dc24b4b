use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::auth::AuthorizationGrant;
use crate::context::ContextEvent;
use crate::identity::Identity;
use crate::mail::Inbox;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Running,
    PollingToken,
    Completed,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Running => "running",
            SessionStatus::PollingToken => "polling_token",
            SessionStatus::Completed => "completed",
            SessionStatus::Error => "error",
        }
    }

    pub fn terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Error)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SessionStatus::Pending),
            "running" => Ok(SessionStatus::Running),
            "polling_token" => Ok(SessionStatus::PollingToken),
            "completed" => Ok(SessionStatus::Completed),
            "error" => Ok(SessionStatus::Error),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// One in-flight enrollment attempt. Owned by the registry; workers and the
/// pipeline mutate it through registry methods only.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub status: SessionStatus,
    pub step: String,
    pub error: Option<String>,
    pub identity: Option<Identity>,
    pub inbox: Option<Inbox>,
    pub grant: Option<AuthorizationGrant>,
    pub context_id: Option<String>,
    pub surface_id: Option<String>,
    pub verification_code: Option<String>,
    pub abort: CancellationToken,
    pub created_at: DateTime<Utc>,
}

impl Session {
    fn new(abort: CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            status: SessionStatus::Pending,
            step: "queued".to_string(),
            error: None,
            identity: None,
            inbox: None,
            grant: None,
            context_id: None,
            surface_id: None,
            verification_code: None,
            abort,
            created_at: Utc::now(),
        }
    }

    pub fn email(&self) -> Option<&str> {
        self.inbox.as_ref().map(|inbox| inbox.address.as_str())
    }
}

/// Redacted view for `GetState`; no password, grant or token material.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub status: SessionStatus,
    pub step: String,
    pub error: Option<String>,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub context_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    sessions: HashMap<String, Session>,
    claimed_addresses: HashSet<String>,
}

/// Owns every live session. All mutation goes through here with short
/// critical sections; context events arrive as narrow idempotent writes.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, abort: CancellationToken) -> String {
        let session = Session::new(abort);
        let id = session.id.clone();
        self.inner.lock().unwrap().sessions.insert(id.clone(), session);
        id
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.inner.lock().unwrap().sessions.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn update<F>(&self, id: &str, f: F) -> bool
    where
        F: FnOnce(&mut Session),
    {
        let mut inner = self.inner.lock().unwrap();
        match inner.sessions.get_mut(id) {
            Some(session) => {
                f(session);
                true
            }
            None => false,
        }
    }

    /// Status moves forward only; writes on a terminal session are ignored.
    pub fn set_status(&self, id: &str, status: SessionStatus) -> bool {
        self.update(id, |session| {
            if !session.status.terminal() {
                session.status = status;
            }
        })
    }

    pub fn set_step(&self, id: &str, step: impl Into<String>) -> bool {
        let step = step.into();
        self.update(id, |session| session.step = step)
    }

    pub fn set_identity(&self, id: &str, identity: Identity) -> bool {
        self.update(id, |session| session.identity = Some(identity))
    }

    pub fn set_inbox(&self, id: &str, inbox: Inbox) -> bool {
        self.update(id, |session| session.inbox = Some(inbox))
    }

    pub fn set_grant(&self, id: &str, grant: AuthorizationGrant) -> bool {
        self.update(id, |session| session.grant = Some(grant))
    }

    pub fn set_context(&self, id: &str, context_id: String, surface_id: Option<String>) -> bool {
        self.update(id, |session| {
            session.context_id = Some(context_id);
            session.surface_id = surface_id;
        })
    }

    pub fn clear_context(&self, id: &str) -> bool {
        self.update(id, |session| {
            session.context_id = None;
            session.surface_id = None;
        })
    }

    pub fn set_verification_code(&self, id: &str, code: impl Into<String>) -> bool {
        let code = code.into();
        self.update(id, |session| session.verification_code = Some(code))
    }

    pub fn complete(&self, id: &str) -> bool {
        self.update(id, |session| {
            if !session.status.terminal() {
                session.status = SessionStatus::Completed;
                session.step = "completed".to_string();
            }
        })
    }

    pub fn fail(&self, id: &str, message: impl Into<String>) -> bool {
        let message = message.into();
        self.update(id, |session| {
            if !session.status.terminal() {
                session.status = SessionStatus::Error;
                session.step = "failed".to_string();
                session.error = Some(message);
            }
        })
    }

    /// Claims `address` for this batch; false means someone already has it.
    pub fn claim_address(&self, address: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .claimed_addresses
            .insert(address.to_string())
    }

    /// Drops terminal sessions. Claimed addresses stay claimed for the rest
    /// of the batch.
    pub fn prune_terminal(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.sessions.len();
        inner.sessions.retain(|_, session| !session.status.terminal());
        before - inner.sessions.len()
    }

    /// Cancels every live session's abort token.
    pub fn abort_all(&self) {
        let inner = self.inner.lock().unwrap();
        for session in inner.sessions.values() {
            if !session.status.terminal() {
                session.abort.cancel();
            }
        }
    }

    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        let inner = self.inner.lock().unwrap();
        let mut snapshots: Vec<SessionSnapshot> = inner
            .sessions
            .values()
            .map(|session| SessionSnapshot {
                id: session.id.clone(),
                status: session.status,
                step: session.step.clone(),
                error: session.error.clone(),
                email: session.email().map(str::to_string),
                display_name: session.identity.as_ref().map(|i| i.display_name()),
                context_id: session.context_id.clone(),
                created_at: session.created_at,
            })
            .collect();
        snapshots.sort_by_key(|s| s.created_at);
        snapshots
    }

    /// Destroys everything, including address claims.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        for session in inner.sessions.values() {
            session.abort.cancel();
        }
        inner.sessions.clear();
        inner.claimed_addresses.clear();
    }

    pub fn apply_context_event(&self, event: &ContextEvent) {
        let mut inner = self.inner.lock().unwrap();
        match event {
            ContextEvent::Navigated {
                context_id,
                surface_id,
            } => {
                for session in inner.sessions.values_mut() {
                    if session.context_id.as_deref() == Some(context_id.as_str()) {
                        session.surface_id = Some(surface_id.clone());
                    }
                }
            }
            ContextEvent::Closed { context_id } => {
                for session in inner.sessions.values_mut() {
                    if session.context_id.as_deref() == Some(context_id.as_str()) {
                        session.context_id = None;
                        session.surface_id = None;
                    }
                }
            }
        }
    }
}
