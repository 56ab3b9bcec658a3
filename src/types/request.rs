use chrono::Utc;
use serde::Serialize;
use serde_json::Value;

/// Outbound envelope, tagged by `type`.
///
/// ```
/// use task_channel_client::types::ClientMessage;
///
/// let frame = serde_json::to_string(&ClientMessage::subscribe_task("t-1")).unwrap();
/// assert_eq!(frame, r#"{"type":"subscribe_task","task_id":"t-1"}"#);
/// ```
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Serialize, strum_macros::IntoStaticStr)]
#[serde(tag = "type", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ClientMessage {
    /// Register interest in a task's updates
    SubscribeTask { task_id: String },
    /// Deregister interest in a task's updates
    UnsubscribeTask { task_id: String },
    /// Liveness probe; the backend echoes `timestamp` in its `pong`
    Ping {
        /// Unix timestamp in milliseconds
        timestamp: i64,
    },
    /// Opaque command passed through to the backend
    ActionRequest {
        /// Name of the action to perform
        action: String,
        /// Task the action belongs to, if any
        #[serde(skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
        /// Action-specific parameters
        #[serde(skip_serializing_if = "Value::is_null")]
        params: Value,
    },
}

impl ClientMessage {
    #[must_use]
    pub fn subscribe_task<S: Into<String>>(task_id: S) -> Self {
        Self::SubscribeTask {
            task_id: task_id.into(),
        }
    }

    #[must_use]
    pub fn unsubscribe_task<S: Into<String>>(task_id: S) -> Self {
        Self::UnsubscribeTask {
            task_id: task_id.into(),
        }
    }

    /// Create a ping stamped with the current time.
    #[must_use]
    pub fn ping() -> Self {
        Self::Ping {
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    #[must_use]
    pub fn action_request<S: Into<String>>(action: S, params: Value) -> Self {
        Self::ActionRequest {
            action: action.into(),
            task_id: None,
            params,
        }
    }

    /// Scope an action request to a task. No-op for other message types.
    #[must_use]
    pub fn for_task<S: Into<String>>(mut self, id: S) -> Self {
        if let Self::ActionRequest { task_id, .. } = &mut self {
            *task_id = Some(id.into());
        }
        self
    }

    /// The wire `type` of this message.
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        self.into()
    }

    /// The task this message refers to, if any.
    #[must_use]
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::SubscribeTask { task_id } | Self::UnsubscribeTask { task_id } => Some(task_id),
            Self::ActionRequest { task_id, .. } => task_id.as_deref(),
            Self::Ping { .. } => None,
        }
    }
}
