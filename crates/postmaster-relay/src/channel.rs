//! Transport endpoints the relay forwards into.

use std::fmt;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Identity of a channel. Disconnect signals carry this, not a context id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(Uuid);

impl ChannelId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ChannelId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Channel error.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,
}

/// One end of a bidirectional link to a consuming session.
pub trait Channel: Send + Sync {
    fn id(&self) -> ChannelId;

    /// Deliver a message to the far end without waiting.
    ///
    /// # Errors
    /// Returns [`ChannelError::Closed`] if the far end is gone.
    fn post(&self, message: Value) -> Result<(), ChannelError>;
}

/// In-process channel backed by an unbounded queue.
#[derive(Debug, Clone)]
pub struct PortChannel {
    id: ChannelId,
    tx: mpsc::UnboundedSender<Value>,
}

impl PortChannel {
    /// Create a channel and the receiver for its far end.
    #[must_use]
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: ChannelId::new(),
                tx,
            },
            rx,
        )
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl Channel for PortChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn post(&self, message: Value) -> Result<(), ChannelError> {
        self.tx.send(message).map_err(|_| ChannelError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_port_channel_delivers_in_order() {
        let (channel, mut rx) = PortChannel::pair();
        channel.post(json!(1)).unwrap();
        channel.post(json!(2)).unwrap();
        assert_eq!(rx.try_recv().unwrap(), json!(1));
        assert_eq!(rx.try_recv().unwrap(), json!(2));
    }

    #[test]
    fn test_post_after_receiver_dropped_fails() {
        let (channel, rx) = PortChannel::pair();
        drop(rx);
        assert!(channel.is_closed());
        assert_eq!(channel.post(json!(1)), Err(ChannelError::Closed));
    }

    #[test]
    fn test_ids_are_distinct() {
        let (a, _ra) = PortChannel::pair();
        let (b, _rb) = PortChannel::pair();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id(), a.clone().id());
    }
}
