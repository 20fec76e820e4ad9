//! Session notifications
//!
//! The session manager only sees [`EventEmitter`]. Hosts that want a
//! channel of events use [`EventBus`], which fans every emitted event out
//! to its subscribers.

pub mod types;

pub use types::PlayerEvent;

use tokio::sync::broadcast;

/// Event channel capacity (ring buffer size)
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Outbound notification sink used by the session manager
pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: PlayerEvent);
}

/// Broadcast [`EventEmitter`]
///
/// Subscribers that fall more than the channel capacity behind see
/// `Lagged` and lose the oldest events.
///
/// # Example
///
/// ```
/// use whep_player::events::{EventBus, EventEmitter, PlayerEvent};
/// use whep_player::webrtc::ConnectionState;
///
/// let bus = EventBus::new();
/// let mut rx = bus.subscribe();
///
/// let emitter: &dyn EventEmitter = &bus;
/// emitter.emit(PlayerEvent::ConnectionStateChanged {
///     session_id: "s1".to_string(),
///     stream_url: "https://example.com/whep".to_string(),
///     from: ConnectionState::Idle,
///     state: ConnectionState::Negotiating,
/// });
///
/// let event = rx.try_recv().unwrap();
/// assert!(event.matches_topic("connection.*"));
/// ```
pub struct EventBus {
    tx: broadcast::Sender<PlayerEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Send to every current subscriber; dropped when there are none
    pub fn publish(&self, event: PlayerEvent) {
        let _ = self.tx.send(event);
    }

    /// Receive every event published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventEmitter for EventBus {
    fn emit(&self, event: PlayerEvent) {
        self.publish(event);
    }
}
