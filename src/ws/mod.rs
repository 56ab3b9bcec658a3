//! Resilient WebSocket channel to the task backend.
//!
//! # Architecture
//!
//! - [`ConnectionManager`]: public handle; forwards every request to a single
//!   background task that owns the transport and all state
//! - [`registry`]: task subscriptions and the set still to be announced
//! - [`router`]: parses inbound frames and fans them out to callbacks
//! - [`queue`]: FIFO buffer for messages that could not be sent yet
//! - [`heartbeat`]: liveness bookkeeping for the open transport
//!
//! Reconnection uses exponential backoff with additive jitter; see
//! [`config::ReconnectConfig`].

pub mod config;
pub mod connection;
pub mod error;
pub mod heartbeat;
pub mod queue;
pub mod registry;
pub mod router;
mod timers;
mod transport;

pub use connection::{ConnectionManager, ConnectionState};
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
pub use queue::SendOptions;
pub use registry::{TaskCallback, TaskSubscription};
pub use router::{HandlerId, HandlerRegistration, MessageHandler};
