//! Batch enrollment orchestration.
//!
//! A batch is a queue of slots drained by a small worker pool. Each slot
//! becomes a session driven through the registration pipeline: identity,
//! mailbox, authorization grant, approval context, token polling. Two
//! resource locks serialize the service calls that cannot overlap, and a
//! typed command channel keeps callers away from the moving parts.

pub mod commands;
pub mod engine;
pub mod error;
pub mod lock;
pub mod pipeline;
pub mod poller;
pub mod queue;
pub mod session;
pub mod state;

pub use commands::{serve, OrchestratorCommand, OrchestratorHandle};
pub use engine::{Orchestrator, StateSnapshot, VerificationArtifact};
pub use error::{RegistrationError, RegistrationResult};
pub use lock::{ResourceGuard, ResourceLock};
pub use pipeline::{PipelineDeps, RegistrationPipeline};
pub use poller::{PollOutcome, TokenPoller};
pub use queue::TaskQueue;
pub use session::{Session, SessionRegistry, SessionSnapshot, SessionStatus};
pub use state::{BatchReport, BatchSnapshot, BatchState, BatchStatus, LastSuccess};
