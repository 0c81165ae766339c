//! # Protocol Messages
//!
//! Every frame carries one JSON document tagged by `type`. [`Message`] is the
//! closed set of tags the client emits or understands; arguments and results
//! inside a message are already in their codec wire shape (`serde_json::Value`).
//!
//! ## Invariants
//! - **Forward Compatibility**: unknown tags decode to [`Message::Unknown`]
//!   instead of failing, and unknown members are ignored.
//! - Optional members are omitted on the wire rather than sent as `null`.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value as Json;

use crate::error::Result;

/// Host error code marking a stale remote reference.
pub const ENTITY_GONE: &str = "ENTITY_GONE";

/// Host error code for atomic-batch entries skipped after an earlier failure.
pub const ATOMIC_ABORT: &str = "ATOMIC_ABORT";

/// One remote method invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallMessage {
    pub id: u64,
    pub method: String,
    /// Positional arguments, already encoded.
    #[serde(default)]
    pub args_list: Vec<Json>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Named arguments, already encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Map<String, Json>>,
    /// Attribute name for `set_attr` writes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// Attribute value for `set_attr` writes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Json>,
}

impl CallMessage {
    pub fn new(id: u64, method: impl Into<String>, args_list: Vec<Json>) -> Self {
        Self {
            id,
            method: method.into(),
            args_list,
            handle: None,
            target: None,
            args: None,
            field: None,
            value: None,
        }
    }

    pub fn with_handle(mut self, handle: i64) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Attaches named arguments; an empty mapping is left off the wire.
    pub fn with_named(mut self, args: Map<String, Json>) -> Self {
        self.args = (!args.is_empty()).then_some(args);
        self
    }

    pub fn with_assignment(mut self, field: impl Into<String>, value: Json) -> Self {
        self.field = Some(field.into());
        self.value = Some(value);
        self
    }
}

/// Host event priority tier, lowest runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Lowest,
    Low,
    #[default]
    Normal,
    High,
    Highest,
    Monitor,
}

/// Which override an `event_result` carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultKind {
    Chat,
    Damage,
}

/// A complete protocol frame body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    // client -> host
    Auth {
        token: String,
    },
    Call(CallMessage),
    CallBatch {
        atomic: bool,
        messages: Vec<CallMessage>,
    },
    Wait {
        id: u64,
        ticks: u64,
    },
    Subscribe {
        event: String,
        once_per_tick: bool,
        priority: Priority,
        throttle_ms: u64,
    },
    RegisterCommand {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        permission: Option<String>,
    },
    Release {
        handles: Vec<i64>,
    },
    EventCancel {
        id: i64,
    },
    EventResult {
        id: i64,
        result: Json,
        result_type: ResultKind,
    },
    EventDone {
        id: i64,
    },
    ShutdownAck,
    Ready,

    // host -> client
    Return {
        id: u64,
        #[serde(default)]
        result: Json,
    },
    Error {
        #[serde(default)]
        id: Option<u64>,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        code: Option<String>,
    },
    Event {
        event: String,
        #[serde(default)]
        payload: Json,
    },
    EventBatch {
        event: String,
        #[serde(default)]
        payloads: Vec<Json>,
    },
    Shutdown,

    /// Any tag this client does not know.
    #[serde(other)]
    Unknown,
}

impl Message {
    /// The wire tag of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Auth { .. } => "auth",
            Message::Call(_) => "call",
            Message::CallBatch { .. } => "call_batch",
            Message::Wait { .. } => "wait",
            Message::Subscribe { .. } => "subscribe",
            Message::RegisterCommand { .. } => "register_command",
            Message::Release { .. } => "release",
            Message::EventCancel { .. } => "event_cancel",
            Message::EventResult { .. } => "event_result",
            Message::EventDone { .. } => "event_done",
            Message::ShutdownAck => "shutdown_ack",
            Message::Ready => "ready",
            Message::Return { .. } => "return",
            Message::Error { .. } => "error",
            Message::Event { .. } => "event",
            Message::EventBatch { .. } => "event_batch",
            Message::Shutdown => "shutdown",
            Message::Unknown => "unknown",
        }
    }

    /// Serializes the message into a frame payload.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parses a frame payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
