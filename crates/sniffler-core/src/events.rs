//! Event bus (§4.4, redesigned per §9 "Event-emitter patterns").
//!
//! The source layers dynamic event emitters over untyped payloads with
//! implicit duck typing. Here each listener event is a variant of a closed
//! sum type, each carrying a strongly typed payload, modeled on the
//! `broadcast`-channel bus pattern used elsewhere in this workspace but with
//! the payload itself made exhaustive instead of a bag of `serde_json::Value`.

use crate::model::{ConnectionInfo, MockComparison, Operation};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// One of the named events in §4.4, each carrying a strongly typed payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Event {
    /// A client connection was accepted and paired with an upstream socket.
    ConnectionOpened {
        /// Listener port this connection belongs to.
        port: u16,
        /// Connection metadata.
        connection: ConnectionInfo,
    },
    /// Either side of a connection closed.
    ConnectionClosed {
        /// Listener port this connection belonged to.
        port: u16,
        /// Connection id.
        connection_id: String,
    },
    /// A new operation was recorded and is now `pending`.
    OperationReceived {
        /// Listener port.
        port: u16,
        /// The newly recorded operation.
        operation: Operation,
    },
    /// An operation resolved (success, failed, or timeout).
    OperationResponse {
        /// Listener port.
        port: u16,
        /// The resolved operation.
        operation: Operation,
    },
    /// A mock was served in place of forwarding to upstream.
    MockServed {
        /// Listener port.
        port: u16,
        /// Id of the mock that was served.
        mock_id: String,
        /// Id of the operation that triggered it.
        operation_id: String,
    },
    /// A mock was added via the command surface.
    MockAdded {
        /// Listener port.
        port: u16,
        /// Id of the new mock.
        mock_id: String,
    },
    /// A mock was updated via the command surface.
    MockUpdated {
        /// Listener port.
        port: u16,
        /// Id of the updated mock.
        mock_id: String,
    },
    /// A mock was removed via the command surface.
    MockRemoved {
        /// Listener port.
        port: u16,
        /// Id of the removed mock.
        mock_id: String,
    },
    /// A mock's enabled flag was flipped.
    MockToggled {
        /// Listener port.
        port: u16,
        /// Id of the toggled mock.
        mock_id: String,
        /// New enabled state.
        enabled: bool,
    },
    /// `auto_save_as_mocks` created a disabled mock from a successful
    /// operation.
    MockAutoCreated {
        /// Listener port.
        port: u16,
        /// Id of the newly created mock.
        mock_id: String,
    },
    /// `auto_replace_on_difference` overwrote a stored mock with a live
    /// response.
    MockAutoReplaced {
        /// Listener port.
        port: u16,
        /// Id of the replaced mock.
        mock_id: String,
    },
    /// A live response differed from its fingerprint's stored mock.
    MockDifferenceDetected {
        /// Listener port.
        port: u16,
        /// Id of the mock compared against.
        mock_id: String,
        /// The computed diff.
        comparison: MockComparison,
    },
    /// A request matched a fingerprint pattern that is configured to be
    /// blocked rather than mocked or forwarded.
    MockPatternBlocked {
        /// Listener port.
        port: u16,
        /// The fingerprint that was blocked.
        fingerprint: String,
    },
    /// A non-fatal error worth surfacing to subscribers (e.g. a corrupt
    /// persistence file, or an unparseable Mongo auth frame forwarded under
    /// the conservative fallback policy).
    Error {
        /// Listener port, if the error is scoped to one.
        port: Option<u16>,
        /// Error kind, matching `Error::kind()`.
        kind: String,
        /// Human-readable message.
        message: String,
    },
}

/// A single-writer, multi-reader event bus for one listener. Publish never
/// suspends and never fails if there are no subscribers (in-process
/// subscribers only; any outbound IPC relay is the host's responsibility
/// per §6, queued and drained by its own writer).
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new bus with the given broadcast channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event. Ignored if there are currently no subscribers.
    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Current subscriber count, for diagnostics.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::default();
        bus.publish(Event::ConnectionClosed {
            port: 5432,
            connection_id: "c1".into(),
        });
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(Event::MockServed {
            port: 3306,
            mock_id: "m1".into(),
            operation_id: "op1".into(),
        });
        let received = rx.recv().await.unwrap();
        match received {
            Event::MockServed { port, .. } => assert_eq!(port, 3306),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn event_serializes_with_tagged_variant() {
        let event = Event::MockToggled {
            port: 80,
            mock_id: "m1".into(),
            enabled: true,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "mock-toggled");
    }
}
