//! WebSocket control channel to the backend (spec.md §4.8).
//!
//! One long-lived connection per process: an identity handshake, a
//! `config_update` push, a periodic C-ECHO health sweep, inbound event
//! dispatch through [`crate::events::EventHandlers`], and a reconnect loop
//! that never gives up. Shares its `CancellationToken` shutdown shape with
//! [`crate::monitor::StudyMonitor::spawn`] and its tracing/error conventions
//! with [`crate::backend`].

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ProxyConfig, ProxyConfigurationHandle};
use crate::dispatch::ScuDispatcher;
use crate::events::{EventHandlers, InboundEvent};
use crate::nodes::NodeRegistry;

const CONFIG_UPDATE_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
const HEALTH_SWEEP_SOFT_CAP: Duration = Duration::from_secs(20);
const PROXY_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone)]
pub struct ControlChannelConfig {
    pub ws_url: String,
    pub api_url: String,
    pub health_interval: Duration,
    pub reconnect_delay: Duration,
}

impl ControlChannelConfig {
    pub fn from_proxy_config(proxy: &ProxyConfig) -> Self {
        Self {
            ws_url: to_ws_url(&proxy.resolver_api_url, &proxy.proxy_key),
            api_url: proxy.resolver_api_url.clone(),
            health_interval: Duration::from_secs(proxy.health_interval_secs),
            reconnect_delay: Duration::from_secs(proxy.reconnect_delay_secs),
        }
    }
}

fn to_ws_url(resolver_api_url: &str, proxy_key: &str) -> String {
    let ws_base = resolver_api_url
        .replacen("https://", "wss://", 1)
        .replacen("http://", "ws://", 1);
    let ws_base = ws_base.trim_end_matches('/');
    format!("{ws_base}/api/v1/proxy/ws?proxy_key={proxy_key}")
}

#[derive(Debug, thiserror::Error)]
enum ControlChannelError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("connection closed by peer")]
    Closed,
}

/// Spawn the control channel's background task. Reconnects forever (after
/// `config.reconnect_delay`) until `shutdown` is cancelled, sending a final
/// offline `health_update` before it exits.
#[allow(clippy::too_many_arguments)]
pub fn spawn(
    config: ControlChannelConfig,
    proxy_configuration: ProxyConfigurationHandle,
    nodes: Arc<NodeRegistry>,
    dispatcher: Arc<ScuDispatcher>,
    events: Arc<EventHandlers>,
    mut outbound_rx: UnboundedReceiver<Value>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while !shutdown.is_cancelled() {
            match run_connection(
                &config,
                &proxy_configuration,
                &nodes,
                &dispatcher,
                &events,
                &mut outbound_rx,
                &shutdown,
            )
            .await
            {
                Ok(()) => break,
                Err(e) => warn!(error = %e, "control channel connection lost"),
            }
            if shutdown.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(config.reconnect_delay) => {}
                _ = shutdown.cancelled() => break,
            }
        }
        info!("control channel stopped");
    })
}

async fn run_connection(
    config: &ControlChannelConfig,
    proxy_configuration: &ProxyConfigurationHandle,
    nodes: &Arc<NodeRegistry>,
    dispatcher: &Arc<ScuDispatcher>,
    events: &Arc<EventHandlers>,
    outbound_rx: &mut UnboundedReceiver<Value>,
    shutdown: &CancellationToken,
) -> Result<(), ControlChannelError> {
    info!(url = %config.ws_url, "connecting control channel");
    let (stream, _) = tokio_tungstenite::connect_async(config.ws_url.as_str()).await?;
    let (mut write, mut read) = stream.split();

    let pending_first_event = identity_handshake(&mut read, events).await?;

    send_json(
        &mut write,
        config_update_message(&proxy_configuration.load(), &config.api_url),
    )
    .await?;
    await_config_update_response(&mut read).await;

    // Populate the node registry before any dispatch event can reach it —
    // it otherwise stays empty until the backend happens to push a
    // proxy.nodes_changed event.
    events
        .handle(InboundEvent {
            event_type: "proxy.config_changed".to_string(),
            entity_type: None,
            entity_id: None,
            correlation_id: None,
            payload: Value::Null,
        })
        .await;

    if let Some(event) = pending_first_event {
        if let Some(event) = InboundEvent::from_value(event) {
            events.handle(event).await;
        }
    }

    let mut health_ticker = tokio::time::interval(config.health_interval);
    health_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    health_ticker.tick().await; // first tick fires immediately; skip it, we just connected

    let result = loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                break Ok(());
            }
            _ = health_ticker.tick() => {
                run_health_sweep(&mut write, nodes, dispatcher).await?;
            }
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(message) => send_json(&mut write, message).await?,
                    None => {} // sender dropped at shutdown; keep serving inbound until cancelled
                }
            }
            incoming = read.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => handle_inbound_text(&text, events).await,
                    Some(Ok(Message::Close(_))) | None => break Err(ControlChannelError::Closed),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Err(ControlChannelError::WebSocket(e)),
                }
            }
        }
    };

    let final_status = send_health_update(&mut write, nodes, "offline").await;
    if let Err(e) = final_status {
        warn!(error = %e, "failed to send final offline health_update");
    }
    let _ = write.send(Message::Close(None)).await;

    result
}

type WsWrite = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;
type WsRead =
    futures_util::stream::SplitStream<tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>>;

/// Consume the connection's first message. Returns `Some(value)` when that
/// message was itself an event (the "immediately delivers first event"
/// fallback in §4.8), so the caller can dispatch it after the handshake
/// completes.
async fn identity_handshake(read: &mut WsRead, events: &Arc<EventHandlers>) -> Result<Option<Value>, ControlChannelError> {
    let Some(message) = read.next().await else {
        return Err(ControlChannelError::Closed);
    };
    let Message::Text(text) = message? else {
        return Ok(None);
    };
    let Ok(value) = serde_json::from_str::<Value>(&text) else {
        return Ok(None);
    };

    let workspace_id = value
        .get("workspace_id")
        .and_then(Value::as_str)
        .or_else(|| value.get("entity_id").and_then(Value::as_str));
    if let Some(workspace_id) = workspace_id {
        events.backend().set_workspace_id(workspace_id);
    }

    if value.get("type").and_then(Value::as_str) == Some("connected") {
        info!(proxy_id = ?value.get("proxy_id"), "control channel identity handshake complete");
        Ok(None)
    } else {
        debug!("first control channel message was an event, deferring dispatch until after handshake");
        Ok(Some(value))
    }
}

fn config_update_message(snapshot: &crate::config::ProxyConfiguration, api_url: &str) -> Value {
    json!({
        "type": "config_update",
        "payload": {
            "ip_address": snapshot.observed_ip_address,
            "port": snapshot.port,
            "ae_title": snapshot.ae_title,
            "api_url": api_url,
            "proxy_version": PROXY_VERSION,
        }
    })
}

/// Waits up to [`CONFIG_UPDATE_RESPONSE_TIMEOUT`] for a `config_update_response`.
/// A timeout is logged and otherwise ignored; this acknowledgement is
/// non-fatal.
async fn await_config_update_response(read: &mut WsRead) {
    let wait = tokio::time::timeout(CONFIG_UPDATE_RESPONSE_TIMEOUT, read.next());
    match wait.await {
        Ok(Some(Ok(Message::Text(text)))) => {
            if serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| v.get("type").and_then(Value::as_str).map(str::to_string))
                .as_deref()
                != Some("config_update_response")
            {
                debug!("expected config_update_response, got something else; continuing");
            }
        }
        Ok(_) => debug!("config_update_response wait ended without a usable message"),
        Err(_) => debug!("timed out waiting for config_update_response, continuing anyway"),
    }
}

async fn run_health_sweep(
    write: &mut WsWrite,
    nodes: &Arc<NodeRegistry>,
    dispatcher: &Arc<ScuDispatcher>,
) -> Result<(), ControlChannelError> {
    let active: Vec<_> = nodes.all().into_iter().filter(|n| n.is_active).collect();
    let sweep = async {
        for node in &active {
            let reachable = dispatcher.verify(node).await;
            nodes.set_reachable(&node.node_id, reachable);
        }
    };
    if tokio::time::timeout(HEALTH_SWEEP_SOFT_CAP, sweep).await.is_err() {
        warn!("health sweep exceeded soft cap, reporting partial results");
    }
    send_health_update(write, nodes, "online").await
}

async fn send_health_update(write: &mut WsWrite, nodes: &Arc<NodeRegistry>, proxy_status: &str) -> Result<(), ControlChannelError> {
    let node_statuses: Vec<Value> = nodes
        .all()
        .into_iter()
        .filter(|n| n.is_active)
        .map(|n| json!({ "node_id": n.node_id, "is_reachable": n.is_reachable }))
        .collect();
    send_json(
        write,
        json!({
            "type": "health_update",
            "payload": {
                "proxy_status": proxy_status,
                "proxy_version": PROXY_VERSION,
                "nodes": node_statuses,
            }
        }),
    )
    .await
}

async fn handle_inbound_text(text: &str, events: &Arc<EventHandlers>) {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        warn!("control channel received non-JSON message, ignoring");
        return;
    };
    match value.get("type").and_then(Value::as_str) {
        Some("ping") => return,
        Some("config_update_response") | Some("health_update_response") => {
            debug!(response_type = ?value.get("type"), "received acknowledgement");
            return;
        }
        _ => {}
    }
    let Some(event) = InboundEvent::from_value(value) else {
        debug!("control channel message did not parse as an event, ignoring");
        return;
    };
    events.handle(event).await;
}

async fn send_json(write: &mut WsWrite, value: Value) -> Result<(), ControlChannelError> {
    write.send(Message::Text(value.to_string())).await?;
    Ok(())
}
