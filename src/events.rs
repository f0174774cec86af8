//! Identity-level change notifications.
//!
//! Reconcilers collect [`ChangeEvent`]s while their transaction is open and
//! publish them only after it commits, so a subscriber never hears about a
//! state that could still be rolled back.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::Source;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ChangeEvent {
    /// A hash seen for the first time.
    Added { source: Source },
    /// Same path, new bytes. The cached preview has been cleared.
    HashChanged {
        source: Source,
        previous_hash: String,
    },
    /// Same bytes, new location.
    PathChanged {
        source: Source,
        previous_root: String,
        previous_path: String,
    },
    /// The derived `xref` flag flipped.
    XrefChanged { source: Source },
    Removed { source: Source },
}

impl ChangeEvent {
    pub fn source(&self) -> &Source {
        match self {
            ChangeEvent::Added { source }
            | ChangeEvent::HashChanged { source, .. }
            | ChangeEvent::PathChanged { source, .. }
            | ChangeEvent::XrefChanged { source }
            | ChangeEvent::Removed { source } => source,
        }
    }

    /// Whether the event changes which hashes are known to the store.
    pub fn alters_identity(&self) -> bool {
        matches!(
            self,
            ChangeEvent::Added { .. } | ChangeEvent::HashChanged { .. } | ChangeEvent::Removed { .. }
        )
    }
}

/// Fan-out of [`ChangeEvent`]s to any number of subscribers.
#[derive(Clone)]
pub struct ChangeNotifier {
    sender: broadcast::Sender<ChangeEvent>,
}

impl ChangeNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }

    /// Publish events in order. Having no subscribers is not an error.
    pub fn publish_all(&self, events: &[ChangeEvent]) {
        for event in events {
            let _ = self.sender.send(event.clone());
        }
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new(1024)
    }
}
