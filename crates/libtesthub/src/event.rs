//! Typed view over the JSON body of a runner notify.

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use testhub_protocol::TaskId;

use crate::error::HubError;
use crate::registry::AgentBinding;
use crate::services::{PlanCounts, ResultRecord};

pub const AGENT_READY: &str = "agent-ready";
pub const AGENT_RESET: &str = "agent-reset";
pub const SCRIPT_STOPPED: &str = "script-stopped";

const AGENT_EVENTS: [&str; 6] = [
    "agent-data",
    "agent-notify",
    "agent-init",
    AGENT_RESET,
    "agent-alive",
    AGENT_READY,
];

/// Execution granularity of a terminal `...-stopped` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    TestCase,
    TestAbstract,
    TestUnit,
    TestSuite,
    TestGlobal,
    TestPlan,
}

impl Granularity {
    pub fn from_event(kind: &str) -> Option<Self> {
        match kind {
            "testcase-stopped" => Some(Self::TestCase),
            "testabstract-stopped" => Some(Self::TestAbstract),
            "testunit-stopped" => Some(Self::TestUnit),
            "testsuite-stopped" => Some(Self::TestSuite),
            "testglobal-stopped" => Some(Self::TestGlobal),
            "testplan-stopped" => Some(Self::TestPlan),
            _ => None,
        }
    }
}

/// Statistics record extracted from a terminal event.
#[derive(Debug, Clone, PartialEq)]
pub enum TerminalRecord {
    TestCase(ResultRecord),
    TestAbstract(ResultRecord, u64),
    TestUnit(ResultRecord, u64),
    TestSuite(ResultRecord, u64),
    TestGlobal(ResultRecord, PlanCounts),
    TestPlan(ResultRecord, PlanCounts),
}

#[derive(Deserialize)]
struct Header {
    #[serde(rename = "task-id")]
    task_id: Option<TaskId>,
    event: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    from: Option<String>,
    #[serde(rename = "channel-id", default, deserialize_with = "lenient_string")]
    channel_id: Option<String>,
}

#[derive(Deserialize)]
struct TerminalFields {
    #[serde(deserialize_with = "required_string")]
    result: String,
    #[serde(rename = "user-id", deserialize_with = "required_string")]
    user_id: String,
    #[serde(deserialize_with = "numeric")]
    duration: f64,
    #[serde(rename = "prj-id", deserialize_with = "numeric")]
    project_id: u64,
    #[serde(rename = "nb-tc")]
    testcases: Option<u64>,
    #[serde(rename = "nb-ts")]
    testsuites: Option<u64>,
    #[serde(rename = "nb-tu")]
    testunits: Option<u64>,
}

#[derive(Deserialize)]
struct ReadyFields {
    #[serde(rename = "destination-agent", deserialize_with = "required_string")]
    agent_name: String,
    #[serde(deserialize_with = "required_string")]
    script_id: String,
    #[serde(deserialize_with = "required_string")]
    uuid: String,
    #[serde(rename = "source-adapter", deserialize_with = "required_string")]
    source_adapter: String,
}

/// A decoded notify body. The raw body is kept for forwarding.
#[derive(Debug, Clone)]
pub struct NotifyEvent {
    pub task_id: TaskId,
    pub kind: String,
    pub from: Option<String>,
    pub channel_id: Option<String>,
    pub body: Value,
}

impl NotifyEvent {
    pub fn parse(body: Value) -> Result<Self, HubError> {
        let header = Header::deserialize(&body).map_err(|e| HubError::MalformedEvent {
            kind: "notify".to_string(),
            reason: e.to_string(),
        })?;
        let task_id = header.task_id.ok_or(HubError::MissingField("task-id"))?;
        let kind = header.event.ok_or(HubError::MissingField("event"))?;
        Ok(Self {
            task_id,
            kind,
            from: header.from,
            channel_id: header.channel_id,
            body,
        })
    }

    pub fn is_agent_event(&self) -> bool {
        AGENT_EVENTS.contains(&self.kind.as_str())
    }

    pub fn granularity(&self) -> Option<Granularity> {
        Granularity::from_event(&self.kind)
    }

    /// Build the statistics record of a terminal event, `None` for other kinds.
    pub fn terminal_record(&self) -> Result<Option<TerminalRecord>, HubError> {
        let Some(granularity) = self.granularity() else {
            return Ok(None);
        };
        let fields = TerminalFields::deserialize(&self.body).map_err(|e| self.malformed(e))?;
        let record = ResultRecord {
            result: fields.result,
            actor: fields.user_id,
            duration: fields.duration,
            project_id: fields.project_id,
        };

        let testcases = || fields.testcases.ok_or(HubError::MissingField("nb-tc"));
        let plan_counts = || -> Result<PlanCounts, HubError> {
            Ok(PlanCounts {
                testsuites: fields.testsuites.ok_or(HubError::MissingField("nb-ts"))?,
                testunits: fields.testunits.ok_or(HubError::MissingField("nb-tu"))?,
                testcases: testcases()?,
            })
        };

        let out = match granularity {
            Granularity::TestCase => TerminalRecord::TestCase(record),
            Granularity::TestAbstract => TerminalRecord::TestAbstract(record, testcases()?),
            Granularity::TestUnit => TerminalRecord::TestUnit(record, testcases()?),
            Granularity::TestSuite => TerminalRecord::TestSuite(record, testcases()?),
            Granularity::TestGlobal => TerminalRecord::TestGlobal(record, plan_counts()?),
            Granularity::TestPlan => TerminalRecord::TestPlan(record, plan_counts()?),
        };
        Ok(Some(out))
    }

    /// Agent binding announced by an `agent-ready` event.
    pub fn agent_binding(&self) -> Result<AgentBinding, HubError> {
        let fields = ReadyFields::deserialize(&self.body).map_err(|e| self.malformed(e))?;
        Ok(AgentBinding {
            agent_name: fields.agent_name,
            script_id: fields.script_id,
            uuid: fields.uuid,
            source_adapter: fields.source_adapter,
        })
    }

    fn malformed(&self, err: serde_json::Error) -> HubError {
        HubError::MalformedEvent {
            kind: self.kind.clone(),
            reason: err.to_string(),
        }
    }
}

/// Extract the task id every runner request carries.
pub fn task_id_of(body: &Value) -> Result<TaskId, HubError> {
    let raw = body.get("task-id").ok_or(HubError::MissingField("task-id"))?;
    TaskId::deserialize(raw).map_err(|e| HubError::MalformedEvent {
        kind: "request".to_string(),
        reason: e.to_string(),
    })
}

/// Read an optional string field, accepting numbers and treating
/// null, `false` and empty strings as absent.
pub fn optional_string(body: &Value, key: &str) -> Option<String> {
    match body.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn lenient_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    let value = Option::<Value>::deserialize(d)?;
    Ok(match value {
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn required_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    match Value::deserialize(d)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

/// Accept a number or a string holding one.
fn numeric<'de, D, T>(d: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: std::str::FromStr + serde::de::DeserializeOwned,
    T::Err: std::fmt::Display,
{
    match Value::deserialize(d)? {
        Value::String(s) => s.trim().parse().map_err(serde::de::Error::custom),
        other => T::deserialize(other).map_err(serde::de::Error::custom),
    }
}
