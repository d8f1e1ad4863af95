//! Instrumentation probe and the seam used to install it.
//!
//! The probe lives inside a monitored document. It installs at most once per
//! document, turns every cross-document message it observes into a capture
//! payload, and hands that payload to the relay untouched otherwise. It does
//! no filtering or buffering of its own.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex, PoisonError, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use postmaster_core::{CapturedEvent, event::UNKNOWN_ORIGIN};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::{
    heartbeat::Keepalive,
    hub::{RelayError, RelayHandle},
    protocol::{ContextId, ControlMessage},
};

/// Attribute set on a document's root element once a probe is installed.
pub const PROBE_MARKER: &str = "data-postmaster-extension";

/// Stand-in for a transferred `MessagePort`, which cannot be serialized.
pub const MESSAGE_PORT_PLACEHOLDER: &str = "[MessagePort]";

/// Probe installation error.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("no documents known for context {0}")]
    UnknownContext(ContextId),
    #[error("relay error: {0}")]
    Relay(#[from] RelayError),
}

/// Host primitive that makes a probe present in every frame of a context.
#[async_trait]
pub trait ProbeInstaller: Send + Sync {
    /// Install the probe. Installing into a context that already has one must
    /// leave the existing probe in place.
    async fn install(&self, context_id: &ContextId) -> Result<(), InstallError>;
}

/// Installer for hosts that inject probes on their own.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInstaller;

#[async_trait]
impl ProbeInstaller for NoopInstaller {
    async fn install(&self, _context_id: &ContextId) -> Result<(), InstallError> {
        Ok(())
    }
}

/// A document (one frame) inside a monitored context.
#[derive(Debug)]
pub struct Document {
    location: String,
    attributes: Mutex<HashSet<String>>,
}

impl Document {
    #[must_use]
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            attributes: Mutex::new(HashSet::new()),
        }
    }

    #[must_use]
    pub fn location(&self) -> &str {
        &self.location
    }

    #[must_use]
    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(name)
    }

    /// Set an attribute. Returns false if it was already present.
    pub fn set_attribute(&self, name: &str) -> bool {
        self.attributes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string())
    }
}

/// Handle of a transferred message port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortId(pub u64);

/// Payload of an observed message.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageData {
    Json(Value),
    Port(PortId),
}

/// A raw message event as the probe observes it.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEvent {
    /// Sender origin; empty when the platform did not supply one.
    pub origin: String,
    pub data: MessageData,
    /// Milliseconds since navigation start.
    pub time_stamp: f64,
}

impl MessageEvent {
    #[must_use]
    pub fn new(origin: impl Into<String>, data: Value, time_stamp: f64) -> Self {
        Self {
            origin: origin.into(),
            data: MessageData::Json(data),
            time_stamp,
        }
    }
}

/// Where a probe sends its capture payloads.
pub type ProbeSink = Arc<dyn Fn(Value) -> Result<(), RelayError> + Send + Sync>;

/// Probe installed in one document.
pub struct Probe {
    document: Arc<Document>,
    sink: ProbeSink,
    valid: AtomicBool,
    ports: Mutex<HashMap<PortId, String>>,
    keepalive: Mutex<Option<Keepalive>>,
}

impl Probe {
    /// Install into `document` unless a probe already marked it.
    #[must_use]
    pub fn install(document: Arc<Document>, sink: ProbeSink) -> Option<Arc<Self>> {
        if !document.set_attribute(PROBE_MARKER) {
            debug!(location = document.location(), "Probe already installed");
            return None;
        }

        Some(Arc::new(Self {
            document,
            sink,
            valid: AtomicBool::new(true),
            ports: Mutex::new(HashMap::new()),
            keepalive: Mutex::new(None),
        }))
    }

    #[must_use]
    pub fn document(&self) -> &Document {
        &self.document
    }

    /// Handle a message delivered to the document. Returns whether a capture
    /// was relayed.
    pub fn on_message(&self, event: &MessageEvent) -> bool {
        self.relay(event, None)
    }

    /// Handle a message that arrived on a port transferred in an earlier
    /// message. Ports the probe never saw are ignored.
    pub fn on_port_message(&self, port: PortId, event: &MessageEvent) -> bool {
        let origin = self
            .ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&port)
            .cloned();
        origin.is_some_and(|origin| self.relay(event, Some(&origin)))
    }

    /// Build the capture payload for `event`.
    #[must_use]
    pub fn capture(&self, event: &MessageEvent, meta_origin: Option<&str>) -> CapturedEvent {
        let origin = if event.origin.is_empty() {
            meta_origin.unwrap_or(UNKNOWN_ORIGIN)
        } else {
            &event.origin
        };
        let data = match &event.data {
            MessageData::Json(value) => value.clone(),
            MessageData::Port(_) => Value::from(MESSAGE_PORT_PLACEHOLDER),
        };

        CapturedEvent::new(
            origin,
            self.document.location(),
            data,
            event.time_stamp,
            now_millis(),
        )
    }

    /// Start pinging the relay. Replaces any loop already running.
    pub fn start_keepalive(&self, interval: Duration) {
        let sink = Arc::clone(&self.sink);
        let keepalive = Keepalive::spawn(interval, move || sink(ControlMessage::Ping.to_value()));
        *self.keepalive.lock().unwrap_or_else(PoisonError::into_inner) = Some(keepalive);
    }

    /// Whether the probe still reaches a live relay.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Stop capturing and stop the keepalive.
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
        if let Some(keepalive) = self
            .keepalive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            keepalive.cancel();
        }
    }

    fn relay(&self, event: &MessageEvent, meta_origin: Option<&str>) -> bool {
        if !self.is_valid() {
            return false;
        }

        if let MessageData::Port(port) = event.data {
            self.ports
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(port, format!("{} (MessagePort)", event.origin));
        }

        let payload = Value::from(self.capture(event, meta_origin));
        match (self.sink)(payload) {
            Ok(()) => true,
            Err(e) => {
                debug!(location = self.document.location(), error = %e, "Relay gone, disabling probe");
                self.invalidate();
                false
            }
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn now_millis() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64
}

/// Installer over an in-process set of documents, keyed by context.
pub struct DocumentInstaller {
    relay: RelayHandle,
    heartbeat: Duration,
    frames: RwLock<HashMap<ContextId, Vec<Arc<Document>>>>,
    probes: RwLock<HashMap<ContextId, Vec<Arc<Probe>>>>,
}

impl DocumentInstaller {
    #[must_use]
    pub fn new(relay: RelayHandle, heartbeat: Duration) -> Self {
        Self {
            relay,
            heartbeat,
            frames: RwLock::new(HashMap::new()),
            probes: RwLock::new(HashMap::new()),
        }
    }

    /// Record a frame belonging to `context_id`.
    pub fn add_document(&self, context_id: ContextId, document: Arc<Document>) {
        self.frames
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(context_id)
            .or_default()
            .push(document);
    }

    /// Forget a context's frames. Its probes are dropped, which stops their
    /// keepalive loops.
    pub fn remove_context(&self, context_id: &ContextId) {
        self.frames
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(context_id);
        if let Some(probes) = self
            .probes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(context_id)
        {
            for probe in probes {
                probe.invalidate();
            }
        }
    }

    /// Probes installed in `context_id`, one per frame.
    #[must_use]
    pub fn probes(&self, context_id: &ContextId) -> Vec<Arc<Probe>> {
        self.probes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(context_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ProbeInstaller for DocumentInstaller {
    async fn install(&self, context_id: &ContextId) -> Result<(), InstallError> {
        if self.relay.is_closed() {
            return Err(RelayError::Closed.into());
        }

        let documents = self
            .frames
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(context_id)
            .cloned()
            .ok_or_else(|| InstallError::UnknownContext(context_id.clone()))?;

        let mut installed = Vec::new();
        for document in documents {
            let relay = self.relay.clone();
            let target = context_id.clone();
            let sink: ProbeSink = Arc::new(move |payload| relay.capture(target.clone(), payload));

            if let Some(probe) = Probe::install(document, sink) {
                probe.start_keepalive(self.heartbeat);
                installed.push(probe);
            }
        }

        debug!(%context_id, installed = installed.len(), "Probes installed");
        self.probes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(context_id.clone())
            .or_default()
            .extend(installed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::hub::RelayHub;

    fn recording_sink() -> (Arc<Mutex<Vec<Value>>>, ProbeSink) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let sink: ProbeSink = Arc::new(move |payload| {
            s.lock().unwrap().push(payload);
            Ok(())
        });
        (seen, sink)
    }

    #[test]
    fn test_install_is_idempotent_per_document() {
        let document = Arc::new(Document::new("https://top.example/"));
        let (_seen, sink) = recording_sink();

        assert!(Probe::install(Arc::clone(&document), Arc::clone(&sink)).is_some());
        assert!(document.has_attribute(PROBE_MARKER));
        assert!(Probe::install(document, sink).is_none());
    }

    #[test]
    fn test_capture_fills_fields() {
        let (seen, sink) = recording_sink();
        let probe = Probe::install(Arc::new(Document::new("https://top.example/")), sink).unwrap();

        assert!(probe.on_message(&MessageEvent::new("https://child.example", json!({ "a": 1 }), 12.5)));
        let payload = seen.lock().unwrap()[0].clone();
        let event = postmaster_core::validate(&payload).unwrap();
        assert_eq!(event.origin, "https://child.example");
        assert_eq!(event.destination, "https://top.example/");
        assert_eq!(event.data, json!({ "a": 1 }));
        assert!((event.timestamp - 12.5).abs() < f64::EPSILON);
        assert!(event.datetime > 0.0);
    }

    #[test]
    fn test_missing_origin_is_unknown() {
        let (_seen, sink) = recording_sink();
        let probe = Probe::install(Arc::new(Document::new("about:blank")), sink).unwrap();
        let event = probe.capture(&MessageEvent::new("", json!(null), 0.0), None);
        assert_eq!(event.origin, UNKNOWN_ORIGIN);
    }

    #[test]
    fn test_message_port_is_replaced_and_followed() {
        let (seen, sink) = recording_sink();
        let probe = Probe::install(Arc::new(Document::new("https://top.example/")), sink).unwrap();

        let transfer = MessageEvent {
            origin: "https://worker.example".into(),
            data: MessageData::Port(PortId(1)),
            time_stamp: 1.0,
        };
        assert!(probe.on_message(&transfer));
        assert!(probe.on_port_message(PortId(1), &MessageEvent::new("", json!("over port"), 2.0)));
        assert!(!probe.on_port_message(PortId(2), &MessageEvent::new("", json!("unknown"), 3.0)));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0]["data"], json!(MESSAGE_PORT_PLACEHOLDER));
        assert_eq!(seen[1]["origin"], json!("https://worker.example (MessagePort)"));
        assert_eq!(seen[1]["data"], json!("over port"));
    }

    #[test]
    fn test_failed_send_disables_probe() {
        let calls = Arc::new(Mutex::new(0));
        let c = Arc::clone(&calls);
        let sink: ProbeSink = Arc::new(move |_| {
            *c.lock().unwrap() += 1;
            Err(RelayError::Closed)
        });
        let probe = Probe::install(Arc::new(Document::new("https://x/")), sink).unwrap();

        assert!(!probe.on_message(&MessageEvent::new("o", json!(1), 0.0)));
        assert!(!probe.is_valid());
        assert!(!probe.on_message(&MessageEvent::new("o", json!(2), 0.0)));
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_document_installer_covers_every_frame_once() {
        let (_hub, relay) = RelayHub::new();
        let installer = DocumentInstaller::new(relay, Duration::from_secs(10));
        let ctx = ContextId::from("7");
        installer.add_document(ctx.clone(), Arc::new(Document::new("https://top/")));
        installer.add_document(ctx.clone(), Arc::new(Document::new("https://top/frame")));

        tokio_test::assert_ok!(installer.install(&ctx).await);
        tokio_test::assert_ok!(installer.install(&ctx).await);
        assert_eq!(installer.probes(&ctx).len(), 2);

        installer.remove_context(&ctx);
        assert!(installer.probes(&ctx).is_empty());
    }

    #[tokio::test]
    async fn test_document_installer_unknown_context() {
        let (_hub, relay) = RelayHub::new();
        let installer = DocumentInstaller::new(relay, Duration::from_secs(10));
        let err = installer.install(&"nope".into()).await.unwrap_err();
        assert!(matches!(err, InstallError::UnknownContext(_)));
    }
}
