//! Message envelope and identifier types shared by the channel.

pub mod request;
pub mod response;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use request::ClientMessage;
pub use response::{
    Beat, ConnectionEstablished, ErrorMessage, ServerMessage, TaskUpdate, UnknownMessage,
    parse_frame,
};

/// Stable identifier sent as the `client_id` query parameter on every
/// connection attempt, so the backend can correlate reconnects.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Generate a fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
