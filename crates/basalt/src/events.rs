//! View lifecycle events.
//!
//! With the `broadcast` feature, [`ViewEvents`] fans them out to any number
//! of subscribers over a tokio broadcast channel.

use basalt_types::ViewId;
use serde::{Deserialize, Serialize};

/// Something that happened to a view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ViewEvent {
    /// A view was registered and its build started.
    Created { view_id: ViewId, name: String },
    /// A build step ran.
    BuildProgressed {
        view_id: ViewId,
        rows_scanned: u64,
        rows_built: u64,
    },
    /// Every base partition has been scanned into the view.
    Built { view_id: ViewId },
    /// The view and its rows are gone.
    Dropped { view_id: ViewId },
}

#[cfg(feature = "broadcast")]
pub use channel::ViewEvents;

#[cfg(feature = "broadcast")]
mod channel {
    use tokio::sync::broadcast;

    use super::ViewEvent;

    /// Broadcasts view events to subscribers.
    #[derive(Debug, Clone)]
    pub struct ViewEvents {
        tx: broadcast::Sender<ViewEvent>,
    }

    impl ViewEvents {
        /// Creates a broadcaster holding up to `buffer_size` events for slow
        /// subscribers.
        pub fn new(buffer_size: usize) -> Self {
            let (tx, _rx) = broadcast::channel(buffer_size);
            Self { tx }
        }

        /// Returns the number of subscribers that received the event.
        /// Subscribers that fall behind see `RecvError::Lagged`.
        pub fn send(&self, event: ViewEvent) -> usize {
            self.tx.send(event).unwrap_or_default()
        }

        /// Receives every event sent after this call.
        pub fn subscribe(&self) -> broadcast::Receiver<ViewEvent> {
            self.tx.subscribe()
        }

        pub fn receiver_count(&self) -> usize {
            self.tx.receiver_count()
        }
    }

    impl Default for ViewEvents {
        fn default() -> Self {
            Self::new(1024)
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_a_type_tag() {
        let json = serde_json::to_value(ViewEvent::Created {
            view_id: ViewId::new(7),
            name: "by_v".to_string(),
        })
        .expect("serialize");
        assert_eq!(json["type"], "created");
        assert_eq!(json["name"], "by_v");
    }
}
