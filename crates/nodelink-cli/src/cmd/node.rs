//! `nodelink run` and `nodelink invoke`: a live endpoint on this machine.

use crate::ui;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nodelink_types::config::NodeConfig;
use nodelink_types::{ChannelTemplate, EndpointId};
use nodelink_wire::{
    CommandHandler, KeepAliveHandler, ProtocolEvent, ProtocolLayer, WireResult,
};
use serde_json::{json, Value};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

/// Returns its arguments.
struct EchoCommand;

#[async_trait]
impl CommandHandler for EchoCommand {
    async fn invoke(&self, _sender: &EndpointId, arguments: Value) -> Result<Value, String> {
        Ok(arguments)
    }
}

/// Reports uptime and the endpoints this node talks to.
struct StatusCommand {
    node: Weak<ProtocolLayer>,
    started: DateTime<Utc>,
}

#[async_trait]
impl CommandHandler for StatusCommand {
    async fn invoke(&self, _sender: &EndpointId, _arguments: Value) -> Result<Value, String> {
        let node = self.node.upgrade().ok_or("node is shutting down")?;
        let peers: Vec<String> = node
            .approved_endpoints()
            .iter()
            .map(ToString::to_string)
            .collect();
        Ok(json!({
            "endpoint": node.local_id().to_string(),
            "started": self.started.to_rfc3339(),
            "uptime_secs": (Utc::now() - self.started).num_seconds(),
            "peers": peers,
        }))
    }
}

fn runtime() -> tokio::runtime::Runtime {
    match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            ui::error(&format!("Failed to start async runtime: {e}"));
            std::process::exit(1);
        }
    }
}

/// Build the node, install the built-in commands and sign in.
async fn start_node(config: &NodeConfig) -> WireResult<Arc<ProtocolLayer>> {
    let node = ProtocolLayer::from_config(config)?;
    node.register_command("echo", Arc::new(EchoCommand));
    node.register_command(
        "status",
        Arc::new(StatusCommand {
            node: Arc::downgrade(&node),
            started: Utc::now(),
        }),
    );
    node.register_keep_alive_handler(Arc::new(
        KeepAliveHandler::new()
            .with_responder(|_, _| Some(json!({ "at": Utc::now().to_rfc3339() })))
            .on_response(|from, data| debug!(endpoint = %from, data = %data, "Keep-alive answered")),
    ));
    node.sign_in().await?;
    Ok(node)
}

fn print_identity(node: &ProtocolLayer) {
    ui::section("NodeLink node");
    ui::kv("Endpoint", &node.local_id().uuid().to_string());
    ui::kv("Machine", node.local_id().machine());
    let description = node.local_description();
    let subjects: Vec<&str> = description.subjects.iter().map(|s| s.0.as_str()).collect();
    ui::kv("Subjects", &subjects.join(", "));
    for template in [ChannelTemplate::LocalIpc, ChannelTemplate::Tcp] {
        match node
            .local_protocol_info(template)
            .and_then(|info| info.message_address)
        {
            Some(address) => ui::kv_ok(&template.to_string(), address.as_str()),
            None => ui::kv_warn(&template.to_string(), "disabled"),
        }
    }
    ui::blank();
    ui::hint("Press Ctrl+C to sign out");
}

pub fn cmd_run(mut config: NodeConfig, subjects: Vec<String>) {
    if !subjects.is_empty() {
        config.subjects = subjects;
    }
    if let Err(e) = runtime().block_on(run_node(&config)) {
        ui::error_with_fix(
            &format!("Node stopped: {e}"),
            "Check the [tcp] and [ipc] sections of the config",
        );
        std::process::exit(1);
    }
}

async fn run_node(config: &NodeConfig) -> WireResult<()> {
    let node = start_node(config).await?;
    print_identity(&node);

    let mut events = node.subscribe();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ProtocolEvent::EndpointConnected { info, description }) => {
                    info!(endpoint = %info.id, commands = ?description.commands, "Peer connected");
                }
                Ok(ProtocolEvent::EndpointDisconnected { id }) => {
                    info!(endpoint = %id, "Peer disconnected");
                }
                Ok(ProtocolEvent::DataReceived { from, path, file_name }) => {
                    info!(endpoint = %from, file = %file_name, path = %path.display(), "Data received");
                }
                Err(RecvError::Lagged(missed)) => warn!(missed, "Event listener lagged"),
                Err(RecvError::Closed) => break,
            },
            _ = &mut shutdown => {
                info!("Ctrl+C received, signing out");
                break;
            }
        }
    }

    node.sign_out().await
}

pub fn cmd_invoke(config: NodeConfig, peer: uuid::Uuid, command: String, arguments: String, wait: u64) {
    let arguments: Value = match serde_json::from_str(&arguments) {
        Ok(value) => value,
        Err(e) => {
            ui::error_with_fix(
                &format!("Arguments are not valid JSON: {e}"),
                "Quote the JSON, e.g. '{\"key\": 1}'",
            );
            std::process::exit(1);
        }
    };

    let outcome = runtime().block_on(async {
        let node = start_node(&config).await?;
        let result = match wait_for_peer(&node, peer, Duration::from_secs(wait)).await {
            Some(target) => node
                .invoke_command(&target, &command, arguments)
                .await
                .map(Some),
            None => Ok(None),
        };
        node.sign_out().await?;
        result
    });

    match outcome {
        Ok(Some(value)) => match serde_json::to_string_pretty(&value) {
            Ok(pretty) => println!("{pretty}"),
            Err(_) => println!("{value}"),
        },
        Ok(None) => {
            ui::error_with_fix(
                &format!("Peer {peer} was not approved within {wait}s"),
                "Check that the peer is running, shares a subject and is listed under [[peers]]",
            );
            std::process::exit(1);
        }
        Err(e) => {
            ui::error(&format!("Invoke failed: {e}"));
            std::process::exit(1);
        }
    }
}

/// Wait until the endpoint with `peer` as UUID is approved.
async fn wait_for_peer(node: &ProtocolLayer, peer: uuid::Uuid, wait: Duration) -> Option<EndpointId> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        if let Some(id) = node
            .approved_endpoints()
            .into_iter()
            .find(|id| id.uuid() == peer)
        {
            return Some(id);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_returns_arguments() {
        let sender = EndpointId::new("alpha");
        let result = EchoCommand.invoke(&sender, json!([1, 2])).await;
        assert_eq!(result, Ok(json!([1, 2])));
    }

    #[tokio::test]
    async fn test_status_after_node_dropped() {
        let status = StatusCommand {
            node: Weak::new(),
            started: Utc::now(),
        };
        let result = status.invoke(&EndpointId::new("alpha"), Value::Null).await;
        assert!(result.unwrap_err().contains("shutting down"));
    }

    #[tokio::test]
    async fn test_wait_for_unknown_peer_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = NodeConfig::default();
        config.tcp.listen_addr = "127.0.0.1:0".to_string();
        config.tcp.data_listen_addr = "127.0.0.1:0".to_string();
        config.ipc.enabled = false;
        config.download_dir = Some(dir.path().to_path_buf());

        let node = start_node(&config).await.unwrap();
        let found = wait_for_peer(&node, uuid::Uuid::new_v4(), Duration::from_millis(100)).await;
        assert!(found.is_none());
        node.sign_out().await.unwrap();
    }
}
