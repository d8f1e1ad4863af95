//! Relay event loop.
//!
//! Every input to the relay (panel connections, control messages, probe
//! captures, disconnects) goes through one queue and is handled to completion
//! before the next, so the routing table is only ever touched by the hub task.

use std::{collections::HashMap, sync::Arc};

use futures::{StreamExt, future};
use serde_json::Value;
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, trace, warn};

use crate::{
    channel::{Channel, ChannelError, ChannelId, PortChannel},
    probe::{NoopInstaller, ProbeInstaller},
    protocol::{ContextId, ControlMessage, Reply},
    registry::{ControlOutcome, SessionRegistry},
};

/// Relay error.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RelayError {
    #[error("relay is not running")]
    Closed,
}

/// Input to the relay loop.
pub enum RelayEvent {
    /// A panel opened a channel.
    Connected(Arc<dyn Channel>),
    /// A panel sent a message on its channel.
    Control { channel_id: ChannelId, message: Value },
    /// A probe captured traffic in a monitored context.
    Capture { context_id: ContextId, payload: Value },
    /// A panel channel closed.
    Disconnected(ChannelId),
    /// Stop the loop.
    Shutdown,
}

/// Cloneable producer side of a [`RelayHub`].
#[derive(Clone)]
pub struct RelayHandle {
    tx: mpsc::UnboundedSender<RelayEvent>,
}

impl RelayHandle {
    /// Queue an event for the hub.
    ///
    /// # Errors
    /// Returns [`RelayError::Closed`] if the hub has stopped.
    pub fn send(&self, event: RelayEvent) -> Result<(), RelayError> {
        self.tx.send(event).map_err(|_| RelayError::Closed)
    }

    /// Open a panel channel.
    ///
    /// # Errors
    /// Returns [`RelayError::Closed`] if the hub has stopped.
    pub fn connect(&self) -> Result<PanelPort, RelayError> {
        let (channel, inbound) = PortChannel::pair();
        let id = channel.id();
        self.send(RelayEvent::Connected(Arc::new(channel)))?;

        let guard = DisconnectGuard {
            id,
            relay: self.clone(),
        };
        Ok(PanelPort {
            sender: PortSender {
                id,
                relay: self.clone(),
                _guard: Arc::new(guard),
            },
            inbound,
        })
    }

    /// Relay a payload captured in `context_id`.
    ///
    /// # Errors
    /// Returns [`RelayError::Closed`] if the hub has stopped.
    pub fn capture(&self, context_id: ContextId, payload: Value) -> Result<(), RelayError> {
        self.send(RelayEvent::Capture {
            context_id,
            payload,
        })
    }

    /// Ask the hub to stop after the events already queued.
    pub fn shutdown(&self) {
        let _ = self.send(RelayEvent::Shutdown);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Owns the session registry and processes relay events one at a time.
pub struct RelayHub {
    registry: SessionRegistry,
    channels: HashMap<ChannelId, Arc<dyn Channel>>,
    installer: Arc<dyn ProbeInstaller>,
    rx: mpsc::UnboundedReceiver<RelayEvent>,
}

impl RelayHub {
    /// Create a hub and its handle. Probe installation is a no-op until
    /// [`RelayHub::with_installer`] is used.
    #[must_use]
    pub fn new() -> (Self, RelayHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let hub = Self {
            registry: SessionRegistry::new(),
            channels: HashMap::new(),
            installer: Arc::new(NoopInstaller),
            rx,
        };
        (hub, RelayHandle { tx })
    }

    /// Use `installer` to put probes into newly registered contexts.
    #[must_use]
    pub fn with_installer(mut self, installer: Arc<dyn ProbeInstaller>) -> Self {
        self.installer = installer;
        self
    }

    /// Run until shut down or every handle is dropped.
    pub async fn run(mut self) {
        while let Some(event) = self.rx.recv().await {
            if matches!(event, RelayEvent::Shutdown) {
                break;
            }
            self.handle(event);
        }
        info!(routes = self.registry.len(), "Relay stopped");
    }

    /// Run on a new task.
    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    fn handle(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Connected(channel) => {
                debug!(channel_id = %channel.id(), "Panel connected");
                self.channels.insert(channel.id(), channel);
            }
            RelayEvent::Control {
                channel_id,
                message,
            } => {
                let Some(channel) = self.channels.get(&channel_id).cloned() else {
                    debug!(%channel_id, "Control message from unknown channel");
                    return;
                };
                if let ControlOutcome::Registered { context_id, .. } =
                    self.registry.handle_control(&channel, &message)
                {
                    self.install_probe(context_id);
                }
            }
            RelayEvent::Capture {
                context_id,
                payload,
            } => {
                if ControlMessage::parse(&payload) == Some(ControlMessage::Ping) {
                    trace!(%context_id, "Probe heartbeat");
                    return;
                }
                self.registry.forward(&context_id, payload);
            }
            RelayEvent::Disconnected(channel_id) => {
                self.channels.remove(&channel_id);
                self.registry.disconnect(channel_id);
            }
            RelayEvent::Shutdown => {}
        }
    }

    fn install_probe(&self, context_id: ContextId) {
        let installer = Arc::clone(&self.installer);
        tokio::spawn(async move {
            if let Err(e) = installer.install(&context_id).await {
                warn!(%context_id, error = %e, "Probe installation failed");
            }
        });
    }
}

/// Panel end of a relay channel.
pub struct PanelPort {
    sender: PortSender,
    inbound: mpsc::UnboundedReceiver<Value>,
}

impl PanelPort {
    #[must_use]
    pub const fn id(&self) -> ChannelId {
        self.sender.id
    }

    /// A sender that keeps the channel open while any clone is alive.
    #[must_use]
    pub fn sender(&self) -> PortSender {
        self.sender.clone()
    }

    /// Send a message to the relay.
    ///
    /// # Errors
    /// Returns [`ChannelError::Closed`] if the relay has stopped.
    pub fn post(&self, message: Value) -> Result<(), ChannelError> {
        self.sender.post(message)
    }

    /// Next message from the relay, heartbeat acknowledgements included.
    pub async fn recv(&mut self) -> Option<Value> {
        self.inbound.recv().await
    }

    /// Next message if one is already queued.
    pub fn try_recv(&mut self) -> Option<Value> {
        self.inbound.try_recv().ok()
    }

    #[must_use]
    pub fn into_parts(self) -> (PortSender, mpsc::UnboundedReceiver<Value>) {
        (self.sender, self.inbound)
    }

    /// Split into a sender and a stream of forwarded traffic, with `PONG`
    /// acknowledgements removed.
    #[must_use]
    pub fn into_event_stream(self) -> (PortSender, futures::stream::BoxStream<'static, Value>) {
        let stream = UnboundedReceiverStream::new(self.inbound)
            .filter(|message| future::ready(!Reply::is_pong(message)))
            .boxed();
        (self.sender, stream)
    }
}

/// Sending half of a [`PanelPort`].
///
/// The relay is told the channel closed once the last clone is dropped.
#[derive(Clone)]
pub struct PortSender {
    id: ChannelId,
    relay: RelayHandle,
    _guard: Arc<DisconnectGuard>,
}

impl PortSender {
    #[must_use]
    pub const fn id(&self) -> ChannelId {
        self.id
    }

    /// Send a message to the relay.
    ///
    /// # Errors
    /// Returns [`ChannelError::Closed`] if the relay has stopped.
    pub fn post(&self, message: Value) -> Result<(), ChannelError> {
        self.relay
            .send(RelayEvent::Control {
                channel_id: self.id,
                message,
            })
            .map_err(|_| ChannelError::Closed)
    }
}

struct DisconnectGuard {
    id: ChannelId,
    relay: RelayHandle,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        let _ = self.relay.send(RelayEvent::Disconnected(self.id));
    }
}
