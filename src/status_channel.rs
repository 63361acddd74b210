//! One-way status stream from the orchestration layer to whatever UI is attached.
//!
//! Events published while nobody is subscribed are dropped; a UI that attaches
//! later resynchronises through the explicit state and version queries.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::updater::DownloadProgress;

/// Channel capacity; progress bursts beyond this are skipped by slow subscribers
const CHANNEL_CAPACITY: usize = 256;

/// Event name used when forwarding to a webview
pub const UPDATE_STATUS_EVENT: &str = "update-status";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateEventKind {
    Checking,
    Available,
    NotAvailable,
    Downloading,
    Downloaded,
    Error,
}

/// Payload of the single update event type
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub status: UpdateEventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_per_second: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transferred: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusEvent {
    fn bare(status: UpdateEventKind) -> Self {
        Self {
            status,
            version: None,
            percent: None,
            bytes_per_second: None,
            transferred: None,
            total: None,
            message: None,
        }
    }

    pub fn checking() -> Self {
        Self::bare(UpdateEventKind::Checking)
    }

    pub fn available(version: impl Into<String>) -> Self {
        Self {
            version: Some(version.into()),
            ..Self::bare(UpdateEventKind::Available)
        }
    }

    pub fn not_available() -> Self {
        Self::bare(UpdateEventKind::NotAvailable)
    }

    pub fn downloading(progress: &DownloadProgress) -> Self {
        Self {
            percent: Some(progress.percent),
            bytes_per_second: Some(progress.bytes_per_second),
            transferred: Some(progress.transferred),
            total: progress.total,
            ..Self::bare(UpdateEventKind::Downloading)
        }
    }

    pub fn downloaded(version: impl Into<String>) -> Self {
        Self {
            version: Some(version.into()),
            ..Self::bare(UpdateEventKind::Downloaded)
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::bare(UpdateEventKind::Error)
        }
    }
}

/// Publish side of the status stream
#[derive(Clone)]
pub struct StatusChannel {
    tx: broadcast::Sender<StatusEvent>,
}

impl Default for StatusChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusChannel {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Deliver to every current subscriber; returns how many received it
    pub fn publish(&self, event: StatusEvent) -> usize {
        match self.tx.send(event) {
            Ok(receivers) => receivers,
            Err(broadcast::error::SendError(event)) => {
                debug!(status = ?event.status, "no UI attached, dropping status event");
                0
            }
        }
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Receive side; dropping it (or calling `unsubscribe`) detaches the listener
pub struct Subscription {
    rx: broadcast::Receiver<StatusEvent>,
}

impl Subscription {
    /// Next event, or `None` once the channel is gone
    pub async fn recv(&mut self) -> Option<StatusEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("status subscriber lagged by {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Drain without waiting
    pub fn try_recv(&mut self) -> Option<StatusEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!("status subscriber lagged by {} events", n);
                }
                Err(_) => return None,
            }
        }
    }

    pub fn unsubscribe(self) {}
}
