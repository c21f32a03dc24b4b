//! Isolated browsing contexts for approval navigation.
//!
//! Every session gets its own context so cookies and storage never leak
//! between accounts. A context exposes an id and the surface (tab) currently
//! showing it; hosts report navigation and close events on a channel the
//! orchestrator drains into the session registry. The trait keeps the
//! orchestrator decoupled from the real browser; tests drive the pipeline
//! with an in-memory host.

mod chromium;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub use chromium::ChromiumContextHost;

pub type ContextResult<T> = Result<T, ContextError>;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("chromium launch failed: {0}")]
    Launch(String),
    #[error("cdp error: {0}")]
    Cdp(#[from] chromiumoxide::error::CdpError),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("unknown context: {0}")]
    UnknownContext(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl From<tokio::task::JoinError> for ContextError {
    fn from(err: tokio::task::JoinError) -> Self {
        ContextError::Unexpected(err.to_string())
    }
}

/// What a host hands back for a freshly created context. Either id may be
/// missing when the environment refused isolation; callers must treat that
/// as unusable.
#[derive(Debug, Clone, Default)]
pub struct IsolatedContext {
    pub context_id: Option<String>,
    pub surface_id: Option<String>,
}

impl IsolatedContext {
    pub fn is_usable(&self) -> bool {
        self.context_id.is_some() && self.surface_id.is_some()
    }
}

/// Context lifecycle notifications, applied to the registry by a drain task.
#[derive(Debug, Clone)]
pub enum ContextEvent {
    /// The context's visible surface navigated or was replaced.
    Navigated {
        context_id: String,
        surface_id: String,
    },
    /// The context disappeared (user closed it, browser died).
    Closed { context_id: String },
}

/// Host able to mint, drive and dispose isolated browsing contexts.
#[async_trait]
pub trait ContextHost: Send + Sync {
    /// Opens a fresh context already navigating to `url`.
    async fn create(&self, url: &str) -> ContextResult<IsolatedContext>;

    /// Waits for the context's initial navigation to settle. `false` means
    /// the wait timed out, which callers may treat as non-fatal.
    async fn wait_ready(&self, context: &IsolatedContext, timeout: Duration)
        -> ContextResult<bool>;

    /// Closes one context, dropping its cookies and storage. Closing an
    /// already-gone context is not an error.
    async fn close(&self, context_id: &str) -> ContextResult<()>;

    /// Hands out the event stream. Yields `Some` exactly once.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ContextEvent>>;

    /// Tears down the whole host. Idempotent.
    async fn shutdown(&self) -> ContextResult<()>;
}
