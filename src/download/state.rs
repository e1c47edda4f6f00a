//! Live download state and the pause/resume/stop control path.
//!
//! [`SessionGate`] owns the state of one download id in a `watch` channel so
//! workers can wait on it (paused) or race against it (terminal). Commands
//! arrive through a [`ControlHandle`] and are applied by a small pump task.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

/// Live state of a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadState {
    /// Started, nothing written yet.
    Pending,
    /// At least one byte written.
    Downloading,
    /// Paused by the user; in-flight results wait at the writer.
    Paused,
    /// Finished successfully.
    Done,
    /// Gave up after exhausting retries or failing validation.
    Failed,
    /// Stopped by the user or because the output file vanished.
    Stopped,
}

impl DownloadState {
    /// Terminal states absorb every further command.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Stopped)
    }
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Shared, observable state of one download id.
///
/// Cloning is cheap; every clone drives the same channel.
#[derive(Debug, Clone)]
pub struct SessionGate {
    tx: Arc<watch::Sender<DownloadState>>,
}

impl Default for SessionGate {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionGate {
    /// Creates a gate in [`DownloadState::Pending`].
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(DownloadState::Pending);
        Self { tx: Arc::new(tx) }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> DownloadState {
        *self.tx.borrow()
    }

    /// Whether the current state is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Receiver for state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<DownloadState> {
        self.tx.subscribe()
    }

    fn transition(&self, apply: impl FnOnce(DownloadState) -> Option<DownloadState>) -> bool {
        self.tx.send_if_modified(|state| match apply(*state) {
            Some(next) if next != *state => {
                debug!(from = %state, to = %next, "state transition");
                *state = next;
                true
            }
            _ => false,
        })
    }

    /// `Pending|Downloading → Paused`.
    pub fn pause(&self) -> bool {
        self.transition(|state| match state {
            DownloadState::Pending | DownloadState::Downloading => Some(DownloadState::Paused),
            _ => None,
        })
    }

    /// `Paused → Downloading`.
    pub fn resume(&self) -> bool {
        self.transition(|state| match state {
            DownloadState::Paused => Some(DownloadState::Downloading),
            _ => None,
        })
    }

    /// Any non-terminal state → `Stopped`. Idempotent.
    pub fn stop(&self) -> bool {
        self.transition(|state| (!state.is_terminal()).then_some(DownloadState::Stopped))
    }

    /// Any non-terminal state → `Failed`.
    pub fn fail(&self) -> bool {
        self.transition(|state| (!state.is_terminal()).then_some(DownloadState::Failed))
    }

    /// Any non-terminal state → `Done`.
    pub fn finish(&self) -> bool {
        self.transition(|state| (!state.is_terminal()).then_some(DownloadState::Done))
    }

    /// `Pending → Downloading`, called on the first written byte.
    pub fn mark_downloading(&self) -> bool {
        self.transition(|state| match state {
            DownloadState::Pending => Some(DownloadState::Downloading),
            _ => None,
        })
    }

    /// Re-arms a failed gate for another attempt. A stopped gate stays stopped.
    ///
    /// Returns false when the download was stopped.
    pub fn rearm(&self) -> bool {
        self.transition(|state| match state {
            DownloadState::Failed | DownloadState::Done => Some(DownloadState::Pending),
            _ => None,
        });
        self.state() != DownloadState::Stopped
    }

    /// Waits while the gate is paused and returns the first non-paused state.
    pub async fn wait_while_paused(&self) -> DownloadState {
        let mut rx = self.subscribe();
        match rx.wait_for(|state| *state != DownloadState::Paused).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }

    /// Resolves once the gate reaches a terminal state.
    pub async fn terminated(&self) -> DownloadState {
        let mut rx = self.subscribe();
        match rx.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }
}

/// A user command for a running download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Pause the download.
    Pause,
    /// Resume a paused download.
    Resume,
    /// Stop and delete the partial output.
    Stop,
}

/// Sends [`ControlCommand`]s to a download.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: mpsc::UnboundedSender<ControlCommand>,
}

impl ControlHandle {
    /// Spawns the pump applying commands to `gate`.
    ///
    /// The pump exits when every handle is dropped.
    #[must_use]
    pub fn spawn(gate: SessionGate) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                let changed = match command {
                    ControlCommand::Pause => gate.pause(),
                    ControlCommand::Resume => gate.resume(),
                    ControlCommand::Stop => gate.stop(),
                };
                debug!(?command, changed, state = %gate.state(), "control command applied");
            }
        });
        (Self { tx }, pump)
    }

    /// Sends a command; returns false if the download is gone.
    pub fn send(&self, command: ControlCommand) -> bool {
        self.tx.send(command).is_ok()
    }

    /// Requests a pause.
    pub fn pause(&self) -> bool {
        self.send(ControlCommand::Pause)
    }

    /// Requests a resume.
    pub fn resume(&self) -> bool {
        self.send(ControlCommand::Resume)
    }

    /// Requests a stop.
    pub fn stop(&self) -> bool {
        self.send(ControlCommand::Stop)
    }
}
