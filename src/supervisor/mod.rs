//! Recording supervisor - the attempt lifecycle engine
//!
//! Owns the attempt state and the capture handles. Every entry point goes
//! through one command inbox; the engine loop is the only writer.

mod engine;
mod finalize;

pub use engine::{Supervisor, SupervisorSettings};
pub use finalize::FinalizeReport;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

use crate::attempt::AttemptId;
use crate::capture::CaptureError;

/// Where the engine is in an attempt's lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Phase {
    Idle,
    Capturing,
    Finalizing,
    Aborted,
}

/// Read-only view published after every transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SupervisorView {
    pub phase: Phase,
    pub session: String,
    pub attempt: Option<AttemptId>,
    pub active_captures: usize,
    pub finalize_pending: bool,
}

impl Default for SupervisorView {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            session: String::new(),
            attempt: None,
            active_captures: 0,
            finalize_pending: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    /// One camera failed; every camera started for the attempt was torn down
    #[error("Camera{camera} could not start: {source}")]
    StartPartial {
        camera: u32,
        #[source]
        source: CaptureError,
    },

    #[error("videos are being trimmed, try again in a moment")]
    Busy,

    #[error("no ongoing recording")]
    NotCapturing,

    #[error("recorder is shutting down")]
    ShutDown,
}

/// Commands accepted by the supervisor
#[derive(Debug)]
pub enum SupervisorCommand {
    /// Begin capturing an attempt (re-arms if one is already running)
    Start {
        attempt: AttemptId,
        at_ms: i64,
        reply: oneshot::Sender<Result<(), SupervisorError>>,
    },
    /// The competition clock stopped
    StopTick { at_ms: i64 },
    /// The referees decided; finalize after the decision delay
    Decision { at_ms: i64 },
    /// Finalize now
    #[cfg(test)]
    Finalize {
        at_ms: i64,
        reply: oneshot::Sender<Result<(), SupervisorError>>,
    },
    /// The session (group) is over
    EndSession,
    /// Tear everything down and stop the engine
    Shutdown { reply: oneshot::Sender<()> },
}

/// Cloneable front door to the supervisor
#[derive(Clone)]
pub struct SupervisorHandle {
    cmd_tx: mpsc::Sender<SupervisorCommand>,
    view_rx: watch::Receiver<SupervisorView>,
}

impl SupervisorHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SupervisorCommand,
    ) -> Result<T, SupervisorError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(reply))
            .await
            .map_err(|_| SupervisorError::ShutDown)?;
        rx.await.map_err(|_| SupervisorError::ShutDown)
    }

    async fn notify(&self, command: SupervisorCommand) -> Result<(), SupervisorError> {
        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| SupervisorError::ShutDown)
    }

    pub async fn start(&self, attempt: AttemptId, at_ms: i64) -> Result<(), SupervisorError> {
        self.request(|reply| SupervisorCommand::Start {
            attempt,
            at_ms,
            reply,
        })
        .await?
    }

    pub async fn stop_tick(&self, at_ms: i64) -> Result<(), SupervisorError> {
        self.notify(SupervisorCommand::StopTick { at_ms }).await
    }

    pub async fn decision(&self, at_ms: i64) -> Result<(), SupervisorError> {
        self.notify(SupervisorCommand::Decision { at_ms }).await
    }

    /// Finalize without waiting for the decision delay
    #[cfg(test)]
    pub async fn finalize(&self, at_ms: i64) -> Result<(), SupervisorError> {
        self.request(|reply| SupervisorCommand::Finalize { at_ms, reply })
            .await?
    }

    pub async fn end_session(&self) -> Result<(), SupervisorError> {
        self.notify(SupervisorCommand::EndSession).await
    }

    /// Returns once every capture child is gone and the status bus is closed
    pub async fn shutdown(&self) {
        if self
            .request(|reply| SupervisorCommand::Shutdown { reply })
            .await
            .is_err()
        {
            tracing::debug!("Supervisor already stopped");
        }
    }

    /// Latest published view
    pub fn view(&self) -> SupervisorView {
        self.view_rx.borrow().clone()
    }

    /// Subscribe to view changes
    #[cfg(test)]
    pub fn watch(&self) -> watch::Receiver<SupervisorView> {
        self.view_rx.clone()
    }
}

/// Create the inbox and view channels for the supervisor
pub fn create_supervisor_channels() -> (
    SupervisorHandle,
    mpsc::Receiver<SupervisorCommand>,
    watch::Sender<SupervisorView>,
) {
    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let (view_tx, view_rx) = watch::channel(SupervisorView::default());
    (SupervisorHandle { cmd_tx, view_rx }, cmd_rx, view_tx)
}
