//! Routing table from monitored contexts to panel channels.

use std::{collections::HashMap, sync::Arc};

use serde_json::Value;
use tracing::{debug, info, trace, warn};

use crate::{
    channel::{Channel, ChannelError, ChannelId},
    protocol::{ContextId, ControlMessage, Reply},
};

/// Result of forwarding a capture event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the channel registered for the context.
    Forwarded(ChannelId),
    /// No channel is registered for the context.
    Unroutable,
    /// The registered channel refused the message.
    ChannelClosed(ChannelId),
}

/// Result of a control message arriving on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOutcome {
    /// The channel now receives traffic for `context_id`.
    Registered {
        context_id: ContextId,
        replaced: Option<ChannelId>,
    },
    /// A `PING` was acknowledged.
    Ponged,
    /// A `PING` arrived but the acknowledgement could not be delivered.
    PongFailed(ChannelError),
    /// Not a control message.
    Ignored,
}

/// Maps each monitored context to the one channel that receives its traffic.
///
/// The registry only routes; it never closes channels. A channel that loses
/// its mapping to a newer registration simply stops receiving.
#[derive(Default)]
pub struct SessionRegistry {
    routes: HashMap<ContextId, Arc<dyn Channel>>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `context_id` to `channel`, replacing any earlier registration.
    ///
    /// Returns the id of the channel that was replaced.
    pub fn register(&mut self, context_id: ContextId, channel: Arc<dyn Channel>) -> Option<ChannelId> {
        let channel_id = channel.id();
        let replaced = self
            .routes
            .insert(context_id.clone(), channel)
            .map(|old| old.id())
            .filter(|old| *old != channel_id);

        info!(%context_id, %channel_id, ?replaced, "Registered context");
        replaced
    }

    /// Handle a message that arrived on `channel`.
    pub fn handle_control(&mut self, channel: &Arc<dyn Channel>, raw: &Value) -> ControlOutcome {
        match ControlMessage::parse(raw) {
            Some(ControlMessage::Init { context_id }) => {
                let replaced = self.register(context_id.clone(), Arc::clone(channel));
                ControlOutcome::Registered {
                    context_id,
                    replaced,
                }
            }
            Some(ControlMessage::Ping) => match channel.post(Reply::Pong.to_value()) {
                Ok(()) => {
                    trace!(channel_id = %channel.id(), "PONG");
                    ControlOutcome::Ponged
                }
                Err(e) => {
                    debug!(channel_id = %channel.id(), error = %e, "Could not acknowledge PING");
                    ControlOutcome::PongFailed(e)
                }
            },
            None => {
                debug!(channel_id = %channel.id(), "Ignoring unknown control message");
                ControlOutcome::Ignored
            }
        }
    }

    /// Forward a capture event, unchanged, to the channel for `context_id`.
    pub fn forward(&self, context_id: &ContextId, payload: Value) -> Delivery {
        let Some(channel) = self.routes.get(context_id) else {
            warn!(%context_id, "Dropping event for unregistered context");
            return Delivery::Unroutable;
        };

        let channel_id = channel.id();
        match channel.post(payload) {
            Ok(()) => Delivery::Forwarded(channel_id),
            Err(e) => {
                warn!(%context_id, %channel_id, error = %e, "Dropping event for closed channel");
                Delivery::ChannelClosed(channel_id)
            }
        }
    }

    /// Remove every route that points at the closing channel.
    ///
    /// Returns the contexts that lost their route.
    pub fn disconnect(&mut self, channel_id: ChannelId) -> Vec<ContextId> {
        let mut removed = Vec::new();
        self.routes.retain(|context_id, channel| {
            let keep = channel.id() != channel_id;
            if !keep {
                removed.push(context_id.clone());
            }
            keep
        });

        if removed.is_empty() {
            debug!(%channel_id, "Disconnected channel had no routes");
        } else {
            info!(%channel_id, contexts = ?removed, "Channel disconnected");
        }
        removed
    }

    /// Channel currently registered for `context_id`.
    #[must_use]
    pub fn channel_for(&self, context_id: &ContextId) -> Option<ChannelId> {
        self.routes.get(context_id).map(|c| c.id())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
