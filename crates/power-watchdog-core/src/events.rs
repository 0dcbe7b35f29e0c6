//! Lifecycle events published by a connection supervisor.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::supervisor::ConnectionState;

/// Events emitted while supervising one device.
///
/// All events are serializable for logging and IPC.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum LinkEvent {
    /// The state machine moved between states.
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// Handshake succeeded and the link is streaming.
    Connected { address: String },
    /// A streaming session ended.
    Disconnected {
        address: String,
        reason: DisconnectReason,
    },
    /// A failed attempt is waiting before the next scan.
    BackoffScheduled { delay_ms: u64 },
    /// No valid packet arrived within the watchdog timeout.
    WatchdogExpired,
    /// A DLReport was written to the store.
    Snapshot { has_second_line: bool },
}

/// Why a streaming session ended.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new reasons
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum DisconnectReason {
    /// Stop was requested.
    Stopped,
    /// The transport reported the link as down.
    LinkLost,
    /// The link watchdog expired.
    WatchdogExpired,
    /// The notification stream ended.
    StreamClosed,
}

/// Sender for link events.
pub type EventSender = broadcast::Sender<LinkEvent>;

/// Receiver for link events.
pub type EventReceiver = broadcast::Receiver<LinkEvent>;

/// Fan-out of link events to any number of receivers.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: EventSender,
}

impl EventDispatcher {
    /// Create a new event dispatcher.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Send an event.
    pub fn send(&self, event: LinkEvent) {
        // Ignore error if no receivers
        let _ = self.sender.send(event);
    }

    /// Get the number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_without_receivers() {
        let dispatcher = EventDispatcher::default();
        dispatcher.send(LinkEvent::WatchdogExpired);
        assert_eq!(dispatcher.receiver_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_receives() {
        let dispatcher = EventDispatcher::new(8);
        let mut rx = dispatcher.subscribe();
        dispatcher.send(LinkEvent::Snapshot {
            has_second_line: true,
        });
        assert_eq!(
            rx.recv().await.unwrap(),
            LinkEvent::Snapshot {
                has_second_line: true
            }
        );
    }

    #[test]
    fn test_event_serialization() {
        let event = LinkEvent::StateChanged {
            from: ConnectionState::Scanning,
            to: ConnectionState::Connecting,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"state_changed\""));
        assert!(json.contains("\"from\":\"scanning\""));

        let event = LinkEvent::Disconnected {
            address: "AA:BB".to_string(),
            reason: DisconnectReason::WatchdogExpired,
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: LinkEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
