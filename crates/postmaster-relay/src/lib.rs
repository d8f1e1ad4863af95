//! Relay between monitored contexts and inspection panels.
//!
//! Provides:
//! - Control protocol (`INIT` / `PING` / `PONG`)
//! - `SessionRegistry` - contextId to channel routing
//! - `Keepalive` - cancellable heartbeat loop
//! - Probe model and installer seam
//! - `RelayHub` - single event loop that serializes all relay traffic
//! - `PanelConnection` - panel side of the handshake

pub mod channel;
pub mod config;
pub mod heartbeat;
pub mod hub;
pub mod panel;
pub mod probe;
pub mod protocol;
pub mod registry;

pub use channel::{Channel, ChannelError, ChannelId, PortChannel};
pub use config::{ConfigError, RelayConfig};
pub use heartbeat::{HEARTBEAT_INTERVAL, Keepalive};
pub use hub::{PanelPort, PortSender, RelayError, RelayEvent, RelayHandle, RelayHub};
pub use panel::PanelConnection;
pub use probe::{Document, DocumentInstaller, NoopInstaller, Probe, ProbeInstaller};
pub use protocol::{ContextId, ControlMessage, Reply};
pub use registry::{ControlOutcome, Delivery, SessionRegistry};
