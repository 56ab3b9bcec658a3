//! Follow a task's progress and watch the connection state.
//!
//! Subscribes to one task twice: once with a callback and once as a stream,
//! and logs every global message plus each connection state change.
//!
//! Run with tracing enabled:
//! ```sh
//! RUST_LOG=info cargo run --example task_updates -- ws://localhost:8000/ws <task-id>
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt as _;
use serde_json::Value;
use task_channel_client::types::ServerMessage;
use task_channel_client::{Config, ConnectionManager};
use tokio::time::timeout;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let endpoint = args
        .next()
        .unwrap_or_else(|| "ws://localhost:8000/ws".to_owned());
    let task_id = args.next().unwrap_or_else(|| "demo-task".to_owned());

    let manager = ConnectionManager::new(&endpoint, Config::default())?;
    info!(client_id = %manager.client_id(), %endpoint, "created manager");

    let mut states = manager.state_receiver();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            info!(?state, "connection state changed");
        }
    });

    let handler = manager.add_message_handler(Arc::new(|message: &ServerMessage| match message {
        ServerMessage::Error(error) => warn!(message = %error.message, "backend error"),
        other => info!(message_type = other.message_type(), "message"),
    }));

    let subscription = manager.subscribe_to_task(
        &task_id,
        Arc::new(|data: &Value| {
            info!(stream = "callback", status = ?data.get("status"), "task update");
        }),
    );

    let mut updates = Box::pin(manager.task_updates(&task_id));
    let mut count = 0;
    while let Ok(Some(data)) = timeout(Duration::from_secs(60), updates.next()).await {
        info!(stream = "task_updates", %data);
        count += 1;
        if data.get("status").and_then(Value::as_str) == Some("completed") {
            break;
        }
    }
    info!(received = count, last_pong = ?manager.last_pong());

    subscription.unsubscribe();
    handler.remove();
    manager.disconnect();

    Ok(())
}
