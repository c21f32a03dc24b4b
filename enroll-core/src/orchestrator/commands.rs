//! Typed command surface over the orchestrator.
//!
//! Callers never touch the engine directly; they hold an
//! [`OrchestratorHandle`] and every verb travels the channel as one command
//! carrying its own reply sender. Long-running verbs run on their own tasks
//! so control verbs stay responsive while a batch is in flight.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::validator::{ValidationProgress, ValidationReport};

use super::engine::{Orchestrator, StateSnapshot, VerificationArtifact};
use super::error::{RegistrationError, RegistrationResult};
use super::state::BatchReport;

const COMMAND_BUFFER: usize = 32;

pub enum OrchestratorCommand {
    StartBatch {
        target: Option<u32>,
        concurrency: Option<u32>,
        reply: oneshot::Sender<RegistrationResult<BatchReport>>,
    },
    StopBatch {
        reply: oneshot::Sender<()>,
    },
    GetState {
        reply: oneshot::Sender<StateSnapshot>,
    },
    Reset {
        reply: oneshot::Sender<RegistrationResult<()>>,
    },
    GetVerificationArtifact {
        session_id: String,
        reply: oneshot::Sender<RegistrationResult<VerificationArtifact>>,
    },
    ValidateCredentials {
        progress: Option<mpsc::UnboundedSender<ValidationProgress>>,
        reply: oneshot::Sender<RegistrationResult<ValidationReport>>,
    },
    ClearHistory {
        reply: oneshot::Sender<RegistrationResult<usize>>,
    },
    ExportHistory {
        reply: oneshot::Sender<RegistrationResult<String>>,
    },
}

/// Spawns the dispatch loop and hands back the sending side. The loop ends
/// when the last handle is dropped.
pub fn serve(orchestrator: Arc<Orchestrator>) -> OrchestratorHandle {
    let (tx, mut rx) = mpsc::channel::<OrchestratorCommand>(COMMAND_BUFFER);
    tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            dispatch(&orchestrator, command).await;
        }
        debug!(target: "enroll::commands", "command channel closed");
    });
    OrchestratorHandle { tx }
}

async fn dispatch(orchestrator: &Arc<Orchestrator>, command: OrchestratorCommand) {
    match command {
        OrchestratorCommand::StartBatch {
            target,
            concurrency,
            reply,
        } => {
            // Resolves only after the full batch join; must not block the
            // loop or StopBatch could never land.
            let orchestrator = Arc::clone(orchestrator);
            tokio::spawn(async move {
                let result = orchestrator.start_batch(target, concurrency).await;
                let _ = reply.send(result);
            });
        }
        OrchestratorCommand::StopBatch { reply } => {
            orchestrator.stop_batch();
            let _ = reply.send(());
        }
        OrchestratorCommand::GetState { reply } => {
            let _ = reply.send(orchestrator.state());
        }
        OrchestratorCommand::Reset { reply } => {
            let _ = reply.send(orchestrator.reset().await);
        }
        OrchestratorCommand::GetVerificationArtifact { session_id, reply } => {
            let _ = reply.send(orchestrator.verification_artifact(&session_id).await);
        }
        OrchestratorCommand::ValidateCredentials { progress, reply } => {
            let orchestrator = Arc::clone(orchestrator);
            tokio::spawn(async move {
                let result = orchestrator.validate_credentials(progress).await;
                let _ = reply.send(result);
            });
        }
        OrchestratorCommand::ClearHistory { reply } => {
            let _ = reply.send(orchestrator.clear_history());
        }
        OrchestratorCommand::ExportHistory { reply } => {
            let _ = reply.send(orchestrator.export_history());
        }
    }
}

/// Cheap to clone; every method is one command round-trip. A closed channel
/// on either leg reads as [`RegistrationError::Shutdown`].
#[derive(Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::Sender<OrchestratorCommand>,
}

impl OrchestratorHandle {
    async fn send<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> OrchestratorCommand,
    ) -> RegistrationResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| RegistrationError::Shutdown)?;
        reply_rx.await.map_err(|_| RegistrationError::Shutdown)
    }

    pub async fn start_batch(
        &self,
        target: Option<u32>,
        concurrency: Option<u32>,
    ) -> RegistrationResult<BatchReport> {
        self.send(|reply| OrchestratorCommand::StartBatch {
            target,
            concurrency,
            reply,
        })
        .await?
    }

    pub async fn stop_batch(&self) -> RegistrationResult<()> {
        self.send(|reply| OrchestratorCommand::StopBatch { reply })
            .await
    }

    pub async fn get_state(&self) -> RegistrationResult<StateSnapshot> {
        self.send(|reply| OrchestratorCommand::GetState { reply })
            .await
    }

    pub async fn reset(&self) -> RegistrationResult<()> {
        self.send(|reply| OrchestratorCommand::Reset { reply }).await?
    }

    pub async fn verification_artifact(
        &self,
        session_id: impl Into<String>,
    ) -> RegistrationResult<VerificationArtifact> {
        let session_id = session_id.into();
        self.send(|reply| OrchestratorCommand::GetVerificationArtifact { session_id, reply })
            .await?
    }

    pub async fn validate_credentials(
        &self,
        progress: Option<mpsc::UnboundedSender<ValidationProgress>>,
    ) -> RegistrationResult<ValidationReport> {
        self.send(|reply| OrchestratorCommand::ValidateCredentials { progress, reply })
            .await?
    }

    pub async fn clear_history(&self) -> RegistrationResult<usize> {
        self.send(|reply| OrchestratorCommand::ClearHistory { reply })
            .await?
    }

    pub async fn export_history(&self) -> RegistrationResult<String> {
        self.send(|reply| OrchestratorCommand::ExportHistory { reply })
            .await?
    }
}
