use thiserror::Error;

use crate::auth::AuthError;
use crate::context::ContextError;
use crate::history::HistoryError;
use crate::mail::MailError;

pub type RegistrationResult<T> = Result<T, RegistrationError>;

/// Everything that can end a session or refuse a command.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("a batch is already running")]
    AlreadyRunning,
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("aborted")]
    Aborted,
    #[error("unknown session: {0}")]
    UnknownSession(String),
    #[error("orchestrator is shut down")]
    Shutdown,
    #[error("mail error: {0}")]
    Mail(#[from] MailError),
    #[error("auth error: {0}")]
    Auth(#[from] AuthError),
    #[error("context error: {0}")]
    Context(#[from] ContextError),
    #[error("history error: {0}")]
    History(#[from] HistoryError),
}

impl RegistrationError {
    /// Whether this is the cooperative-cancellation outcome rather than a
    /// genuine failure.
    pub fn is_abort(&self) -> bool {
        matches!(self, RegistrationError::Aborted)
    }
}
