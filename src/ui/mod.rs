//! Local status display
//!
//! Consumes the UI channel of the status bus and renders one status line
//! per transition. An ERROR line reverts to READY after ten seconds of
//! silence.

use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::status::{StatusCode, StatusMessage};

/// How long an error stays on screen without further messages
pub const ERROR_HOLD: Duration = Duration::from_secs(10);

const MAX_TEXT: usize = 80;

/// What the operator currently sees
#[derive(Debug)]
pub struct StatusDisplay {
    current: StatusMessage,
    error_until: Option<Instant>,
}

impl Default for StatusDisplay {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusDisplay {
    pub fn new() -> Self {
        Self {
            current: StatusMessage::ready("Ready", ""),
            error_until: None,
        }
    }

    #[cfg(test)]
    pub fn current(&self) -> &StatusMessage {
        &self.current
    }

    /// Deadline of the pending error auto-clear, if any
    pub fn error_deadline(&self) -> Option<Instant> {
        self.error_until
    }

    /// Show a new message; returns the rendered line
    pub fn apply(&mut self, message: StatusMessage, now: Instant) -> String {
        self.error_until = (message.code == StatusCode::Error).then(|| now + ERROR_HOLD);
        self.current = message;
        self.render()
    }

    /// Clear an expired error; returns the new line when something changed
    pub fn tick(&mut self, now: Instant) -> Option<String> {
        match self.error_until {
            Some(deadline) if now >= deadline => {
                self.error_until = None;
                let session = std::mem::take(&mut self.current.session);
                self.current = StatusMessage::ready("Ready", session);
                Some(self.render())
            }
            _ => None,
        }
    }

    pub fn render(&self) -> String {
        let text = truncate_str(&self.current.text, MAX_TEXT);
        let line = match self.current.code {
            StatusCode::Ready => format!("[READY] {}", text),
            StatusCode::Recording => format!("[RECORDING] {}", text),
            StatusCode::Trimming => format!("[TRIMMING] {}", text),
            StatusCode::Error => format!("[ERROR] **{}**", text),
        };
        if self.current.session.is_empty() {
            line
        } else {
            format!("{} ({})", line, self.current.session)
        }
    }
}

/// Truncate a string to a maximum length, adding ellipsis if needed
fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Render status transitions until the bus closes or shutdown is requested
pub async fn run_status_display(
    mut status_rx: broadcast::Receiver<StatusMessage>,
    shutdown: CancellationToken,
) {
    let mut status_display = StatusDisplay::new();
    info!("Status: {}", status_display.render());

    loop {
        let clear_at = status_display.error_deadline();

        tokio::select! {
            _ = shutdown.cancelled() => break,

            received = status_rx.recv() => match received {
                Ok(message) => {
                    let is_error = message.code == StatusCode::Error;
                    let line = status_display.apply(message, Instant::now());
                    if is_error {
                        error!("Status: {}", line);
                    } else {
                        info!("Status: {}", line);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Status display missed {} updates", n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Status channel closed, display exiting");
                    break;
                }
            },

            _ = async {
                match clear_at {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            } => {
                if let Some(line) = status_display.tick(Instant::now()) {
                    info!("Status: {}", line);
                }
            }
        }
    }
}
