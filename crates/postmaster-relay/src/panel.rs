//! Panel side of the relay handshake.

use std::time::Duration;

use tracing::{debug, info};

use crate::{
    channel::ChannelError,
    heartbeat::Keepalive,
    hub::PortSender,
    protocol::{ContextId, ControlMessage},
};

/// Keeps one panel registered for its monitored context.
///
/// The relay forgets a route when the channel closes and the probe has to be
/// reinstalled after every navigation, so [`PanelConnection::initialize`] is
/// meant to be called again whenever the context navigates.
pub struct PanelConnection {
    context_id: ContextId,
    sender: PortSender,
    interval: Duration,
    keepalive: Option<Keepalive>,
}

impl PanelConnection {
    #[must_use]
    pub const fn new(context_id: ContextId, sender: PortSender, interval: Duration) -> Self {
        Self {
            context_id,
            sender,
            interval,
            keepalive: None,
        }
    }

    #[must_use]
    pub const fn context_id(&self) -> &ContextId {
        &self.context_id
    }

    /// Register with the relay and restart the keepalive.
    ///
    /// # Errors
    /// Returns [`ChannelError::Closed`] if the relay has stopped. The
    /// keepalive is not restarted in that case.
    pub fn initialize(&mut self) -> Result<(), ChannelError> {
        if let Some(previous) = self.keepalive.take() {
            previous.cancel();
        }

        self.sender.post(
            ControlMessage::Init {
                context_id: self.context_id.clone(),
            }
            .to_value(),
        )?;

        let sender = self.sender.clone();
        self.keepalive = Some(Keepalive::spawn(self.interval, move || {
            sender.post(ControlMessage::Ping.to_value())
        }));

        info!(context_id = %self.context_id, channel_id = %self.sender.id(), "Panel initialized");
        Ok(())
    }

    /// The monitored context finished loading a new document.
    ///
    /// # Errors
    /// See [`PanelConnection::initialize`].
    pub fn on_navigation_complete(&mut self) -> Result<(), ChannelError> {
        debug!(context_id = %self.context_id, "Navigation complete, reinitializing");
        self.initialize()
    }

    #[must_use]
    pub fn keepalive_running(&self) -> bool {
        self.keepalive.as_ref().is_some_and(|k| !k.is_finished())
    }

    /// Stop the keepalive and release the channel.
    pub fn close(self) {
        debug!(context_id = %self.context_id, "Panel closed");
    }
}
