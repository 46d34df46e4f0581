
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Upper bound for one JSON line on any hub socket.
pub const MAX_JSON_LINE_BYTES: usize = 4 * 1024 * 1024;

/// Correlation token chosen by the runner for each request.
pub type Tid = u64;

/// Transport identity of one runner connection.
pub type PeerId = String;

/// Canonical task identifier.
///
/// Runners send task ids either as JSON strings or as JSON integers; both
/// forms decode to the same string-backed id.
#[derive(Serialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for TaskId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<u64> for TaskId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl<'de> Deserialize<'de> for TaskId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Unsigned(u64),
            Signed(i64),
        }

        Ok(match Raw::deserialize(d)? {
            Raw::Text(s) => TaskId(s),
            Raw::Unsigned(n) => TaskId(n.to_string()),
            Raw::Signed(n) => TaskId(n.to_string()),
        })
    }
}

/// Runner-to-hub requests sent as JSON lines over the runner socket.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Request {
    /// Lifecycle event; never answered.
    Notify {
        tid: Tid,
        body: serde_json::Value,
    },
    /// Service request; answered synchronously or, for `interact`, later.
    Cmd {
        tid: Tid,
        body: serde_json::Value,
    },
}

impl Request {
    pub fn tid(&self) -> Tid {
        match self {
            Request::Notify { tid, .. } | Request::Cmd { tid, .. } => *tid,
        }
    }

    pub fn body(&self) -> &serde_json::Value {
        match self {
            Request::Notify { body, .. } | Request::Cmd { body, .. } => body,
        }
    }
}

/// Sub-commands carried in the `cmd` field of a `Cmd` body.
pub mod command {
    pub const GET_PROBE: &str = "get_probe";
    pub const START_PROBE: &str = "start_probe";
    pub const STOP_PROBE: &str = "stop_probe";
    pub const INTERACT: &str = "interact";
}

/// Hub-to-runner replies, correlated by `tid`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ok { tid: Tid, body: serde_json::Value },
    Failed { tid: Tid, body: serde_json::Value },
}

impl Response {
    pub fn ok(tid: Tid, body: serde_json::Value) -> Self {
        Self::Ok { tid, body }
    }

    pub fn failed(tid: Tid, body: serde_json::Value) -> Self {
        Self::Failed { tid, body }
    }

    pub fn tid(&self) -> Tid {
        match self {
            Response::Ok { tid, .. } | Response::Failed { tid, .. } => *tid,
        }
    }
}

/// Error codes placed in the `res` field of a failed command reply.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    CommandError,
}

/// Hub-to-collaborator call, one JSON line per call.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ServiceCall {
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
    /// When false the collaborator must not answer.
    #[serde(default = "default_expect_reply")]
    pub expect_reply: bool,
}

/// Collaborator answer to a `ServiceCall` with `expect_reply = true`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ServiceReply {
    pub ok: bool,
    #[serde(default)]
    pub result: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServiceReply {
    pub fn success(result: serde_json::Value) -> Self {
        Self {
            ok: true,
            result,
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            result: serde_json::Value::Null,
            error: Some(message.into()),
        }
    }
}

/// Operator requests accepted on the control socket.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum ControlRequest {
    RegisterTask {
        task_id: TaskId,
        #[serde(default)]
        background: bool,
    },
    Status,
    Shutdown,
}

/// Control socket replies.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlResponse {
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    Error {
        message: String,
    },
}

/// Snapshot returned by the `status` control request.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HubStatus {
    pub sessions: usize,
    pub tasks: usize,
    pub interact_pending: usize,
    pub interact_submitted: u64,
}

fn default_expect_reply() -> bool {
    true
}
