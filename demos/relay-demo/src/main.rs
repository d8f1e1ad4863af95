//! Simulated capture session.
//!
//! Wires a probe in a two-frame page through the relay into one panel, then
//! prints the panel's view of what it captured.
//!
//! Run with: `cargo run -p relay-demo`

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use postmaster_core::{EventStore, Field, FieldPattern, FilterInput, LogView, StoreState};
use postmaster_relay::{
    ContextId, Document, DocumentInstaller, PanelConnection, Probe, RelayConfig, RelayHub,
    probe::{MessageData, MessageEvent, PortId},
};
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = RelayConfig::from_env()?;
    tracing::info!(
        heartbeat = ?config.heartbeat_interval,
        capacity = config.store_capacity,
        "Starting relay demo"
    );
    let context_id = ContextId::from(1_u64);

    let (hub, relay) = RelayHub::new();
    let installer = Arc::new(DocumentInstaller::new(relay.clone(), config.heartbeat_interval));
    installer.add_document(context_id.clone(), Arc::new(Document::new("https://shop.example/")));
    installer.add_document(
        context_id.clone(),
        Arc::new(Document::new("https://pay.example/checkout-frame")),
    );
    let hub_task = hub.with_installer(installer.clone()).spawn();

    let store = Arc::new(EventStore::new(config.store_config()));
    let mut view = LogView::default();
    view.exclusion.set_open(&store, true);
    view.exclusion.edit(&store, |input| {
        *input = FilterInput::new().with(Field::Data, FieldPattern::new(r"^\{.type.:.heartbeat").regex());
    })?;

    let port = relay.connect()?;
    let mut panel = PanelConnection::new(context_id.clone(), port.sender(), config.heartbeat_interval);
    let (_sender, inbound) = port.into_event_stream();
    let forwarder = Arc::clone(&store).spawn_forwarder(inbound);
    panel.initialize()?;

    let probes = wait_for_probes(&installer, &context_id, 2).await?;
    simulate_traffic(&probes);

    let mut states = store.watch();
    let state = tokio::time::timeout(Duration::from_secs(2), states.wait_for(|s| s.len() >= 4))
        .await
        .context("events never reached the store")??
        .clone();

    print_view(&view, &state);

    view.search.set_open(true);
    view.search.edit(|input| input.set_text(Field::Origin, "pay"))?;
    view.toggle_prettify();
    print_view(&view, &state);

    view.exclusion.set_open(&store, false);
    panel.close();
    relay.shutdown();
    hub_task.await?;
    forwarder.abort();
    Ok(())
}

async fn wait_for_probes(
    installer: &DocumentInstaller,
    context_id: &ContextId,
    frames: usize,
) -> Result<Vec<Arc<Probe>>> {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let probes = installer.probes(context_id);
            if probes.len() == frames {
                return probes;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .context("probes were not installed")
}

fn simulate_traffic(probes: &[Arc<Probe>]) {
    let (top, frame) = (&probes[0], &probes[1]);

    frame.on_message(&MessageEvent::new(
        "https://shop.example",
        json!({ "type": "init-payment", "amount": 4200, "currency": "EUR" }),
        812.0,
    ));
    top.on_message(&MessageEvent::new(
        "https://pay.example",
        json!({ "type": "heartbeat" }),
        1_020.0,
    ));
    top.on_message(&MessageEvent::new(
        "https://pay.example",
        json!({ "type": "resize", "height": 540 }),
        1_033.0,
    ));
    top.on_message(&MessageEvent {
        origin: "https://pay.example".to_string(),
        data: MessageData::Port(PortId(1)),
        time_stamp: 1_100.0,
    });
    top.on_port_message(PortId(1), &MessageEvent::new("", json!({ "status": "authorized" }), 2_450.5));
}

fn print_view(view: &LogView, state: &StoreState) {
    println!("== {} ==", view.summary(state));
    for event in view.render(state) {
        println!("{}  {}", event.header, event.route);
        println!("{}", event.body);
    }
    println!();
}
