//! Send an action to the backend, queued until the connection opens.
//!
//! Run with tracing enabled:
//! ```sh
//! RUST_LOG=debug cargo run --example action_request -- ws://localhost:8000/ws <task-id> <action>
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use task_channel_client::types::ServerMessage;
use task_channel_client::{ClientMessage, Config, ConnectionManager, SendOptions};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let endpoint = args
        .next()
        .unwrap_or_else(|| "ws://localhost:8000/ws".to_owned());
    let task_id = args.next().unwrap_or_else(|| "demo-task".to_owned());
    let action = args.next().unwrap_or_else(|| "pause".to_owned());

    let manager = ConnectionManager::new(&endpoint, Config::default())?;
    let _handler = manager.add_message_handler(Arc::new(|message: &ServerMessage| {
        if let ServerMessage::Error(e) = message {
            error!(message = %e.message, "backend rejected frame");
        } else {
            info!(message_type = message.message_type(), "received");
        }
    }));

    // Sent before connecting, so this lands in the outbound queue
    manager.send_with(
        ClientMessage::action_request(action.as_str(), json!({ "source": "demo" }))
            .for_task(task_id.as_str()),
        SendOptions::retryable(5),
    );
    manager.connect();

    let mut states = manager.state_receiver();
    match tokio::time::timeout(Duration::from_secs(15), states.wait_for(|s| s.is_connected())).await {
        Ok(Ok(_)) => info!(%action, %task_id, "connected; queued action flushed"),
        _ => error!(state = ?manager.state(), "could not connect"),
    }

    tokio::time::sleep(Duration::from_secs(2)).await;
    manager.disconnect();

    Ok(())
}
