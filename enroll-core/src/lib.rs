pub mod auth;
pub mod config;
pub mod context;
pub mod error;
pub mod history;
pub mod identity;
pub mod mail;
pub mod orchestrator;
pub mod validator;

pub use auth::{
    AuthClient, AuthError, AuthResult, AuthorizationGrant, CredentialBundle, CredentialPoll,
    HttpAuthClient, UsageProbe,
};
pub use config::{load_enroll_config, EnrollConfig};
pub use context::{
    ChromiumContextHost, ContextError, ContextEvent, ContextHost, ContextResult, IsolatedContext,
};
pub use error::{ConfigError, Result};
pub use history::{
    HistoryError, HistoryRecord, HistoryResult, HistoryStore, HistorySummary, TokenStatus,
};
pub use identity::{Identity, IdentityGenerator};
pub use mail::{
    CodeQuery, DisposableInboxProvider, GmailAliasProvider, Inbox, MailError, MailProvider,
    MailResult, ProviderRegistry,
};
pub use orchestrator::{
    serve, BatchReport, BatchSnapshot, BatchState, BatchStatus, Orchestrator, OrchestratorCommand,
    OrchestratorHandle, RegistrationError, RegistrationPipeline, RegistrationResult,
    ResourceLock, SessionRegistry, SessionSnapshot, SessionStatus, StateSnapshot, TaskQueue,
    VerificationArtifact,
};
pub use validator::{BatchValidator, ValidationDetail, ValidationProgress, ValidationReport};
