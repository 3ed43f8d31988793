//! Upload lifecycle events
//!
//! Purely observational: publishing never fails a request, and nothing in
//! the protocol depends on anyone listening.

use tokio::sync::broadcast;

/// Buffered events per subscriber before the slowest one starts lagging
pub const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadEvent {
    Created { key: String, size: u64 },

    /// Emitted after every chunk checkpoint
    Progress { key: String, offset: u64, size: u64 },

    Complete { key: String, size: u64 },

    /// Partial uploads were concatenated into `key`
    Merged { key: String, partials: Vec<String>, size: u64 },
}

impl UploadEvent {
    pub fn key(&self) -> &str {
        match self {
            Self::Created { key, .. }
            | Self::Progress { key, .. }
            | Self::Complete { key, .. }
            | Self::Merged { key, .. } => key,
        }
    }
}

/// Cloneable publishing side of the event channel
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<UploadEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: UploadEvent) {
        // No receivers is not an error
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
