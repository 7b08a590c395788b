//! Status bus - one writer, many readers
//!
//! Two sinks:
//! - the local UI channel, a bounded broadcast where a slow reader loses
//!   the oldest messages
//! - browser clients, each with its own small queue; a client that cannot
//!   keep up is dropped from the set
//!
//! The last message is cached and replayed to every new browser client.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Text that makes browsers refresh their clip listing
pub const VIDEOS_READY: &str = "Videos ready";
/// Text shown when no session is running
pub const NO_ACTIVE_SESSION: &str = "No active session";
/// One-shot frame text telling browsers to reload
pub const RELOAD: &str = "reload";

/// Smallest UI channel we accept
const MIN_UI_CAPACITY: usize = 10;
/// Messages queued per browser before it is dropped
const CLIENT_QUEUE: usize = 16;
/// Deadline for a single socket write to a browser
pub const CLIENT_SEND_DEADLINE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    #[serde(rename = "DONE", alias = "READY")]
    Ready,
    #[serde(rename = "RECORDING")]
    Recording,
    #[serde(rename = "TRIMMING")]
    Trimming,
    #[serde(rename = "ERROR")]
    Error,
}

/// One observable transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub code: StatusCode,
    pub text: String,
    pub session: String,
}

impl StatusMessage {
    pub fn new(code: StatusCode, text: impl Into<String>, session: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
            session: session.into(),
        }
    }

    pub fn ready(text: impl Into<String>, session: impl Into<String>) -> Self {
        Self::new(StatusCode::Ready, text, session)
    }

    pub fn recording(text: impl Into<String>, session: impl Into<String>) -> Self {
        Self::new(StatusCode::Recording, text, session)
    }

    pub fn trimming(text: impl Into<String>, session: impl Into<String>) -> Self {
        Self::new(StatusCode::Trimming, text, session)
    }

    pub fn error(text: impl Into<String>, session: impl Into<String>) -> Self {
        Self::new(StatusCode::Error, text, session)
    }

    /// A READY that should make browsers refresh
    pub fn is_videos_ready(&self) -> bool {
        self.code == StatusCode::Ready && self.text.contains(VIDEOS_READY)
    }

    /// What browsers receive for this message
    fn for_browser(&self) -> StatusMessage {
        if self.is_videos_ready() {
            StatusMessage::ready(RELOAD, self.session.clone())
        } else {
            self.clone()
        }
    }
}

/// A registered browser connection
#[derive(Debug)]
pub struct BrowserClient {
    pub id: Uuid,
    pub rx: mpsc::Receiver<StatusMessage>,
}

struct Inner {
    ui_tx: broadcast::Sender<StatusMessage>,
    clients: Mutex<HashMap<Uuid, mpsc::Sender<StatusMessage>>>,
    last: Mutex<Option<StatusMessage>>,
    closed: AtomicBool,
}

/// Broadcast node for status transitions
#[derive(Clone)]
pub struct StatusBus {
    inner: Arc<Inner>,
}

impl StatusBus {
    pub fn new(ui_capacity: usize) -> Self {
        let (ui_tx, _) = broadcast::channel(ui_capacity.max(MIN_UI_CAPACITY));
        Self {
            inner: Arc::new(Inner {
                ui_tx,
                clients: Mutex::new(HashMap::new()),
                last: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Receiver for the local UI renderer
    pub fn subscribe_ui(&self) -> broadcast::Receiver<StatusMessage> {
        self.inner.ui_tx.subscribe()
    }

    /// Publish to every sink. Returns false once the bus is closed.
    pub fn publish(&self, message: StatusMessage) -> bool {
        if self.is_closed() {
            debug!("Status bus closed, dropping {:?}", message);
            return false;
        }

        info!("Status {:?}: {}", message.code, message.text);

        // Clients lock is held for the whole fan-out so every reader sees
        // messages in publish order
        let mut clients = self.inner.clients.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_closed() {
            return false;
        }
        *self.inner.last.lock().unwrap_or_else(|e| e.into_inner()) = Some(message.clone());

        // No UI receiver is fine
        let _ = self.inner.ui_tx.send(message.clone());

        let browser_message = message.for_browser();
        clients.retain(|id, tx| match tx.try_send(browser_message.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Browser client {} is not keeping up, dropping it", id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Browser client {} went away", id);
                false
            }
        });

        true
    }

    /// Register a browser; the cached message is queued first
    pub fn register_client(&self) -> Option<BrowserClient> {
        if self.is_closed() {
            return None;
        }

        let (tx, rx) = mpsc::channel(CLIENT_QUEUE);
        let mut clients = self.inner.clients.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(last) = self.last() {
            let _ = tx.try_send(last);
        }

        let id = Uuid::new_v4();
        clients.insert(id, tx);
        debug!("Browser client {} registered ({} total)", id, clients.len());
        Some(BrowserClient { id, rx })
    }

    pub fn unregister_client(&self, id: Uuid) {
        let mut clients = self.inner.clients.lock().unwrap_or_else(|e| e.into_inner());
        if clients.remove(&id).is_some() {
            debug!("Browser client {} unregistered", id);
        }
    }

    #[cfg(test)]
    pub fn client_count(&self) -> usize {
        self.inner.clients.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// The latest published message
    pub fn last(&self) -> Option<StatusMessage> {
        self.inner.last.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Stop accepting messages and disconnect every browser
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut clients = self.inner.clients.lock().unwrap_or_else(|e| e.into_inner());
        info!("Status bus closed ({} browser clients disconnected)", clients.len());
        clients.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl Default for StatusBus {
    fn default() -> Self {
        Self::new(16)
    }
}
