//! Interfaces of the external services the hub talks to.
//!
//! The dispatcher never reaches a service through global state; every
//! service is handed in through [`Collaborators`] at construction.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use testhub_protocol::{PeerId, Tid};

/// Probe-management service.
#[async_trait]
pub trait ProbeService: Send + Sync {
    async fn find(&self, request: &Value) -> Result<Value>;
    /// Must answer with an object carrying the `callid` of the started probe.
    async fn start(&self, request: &Value) -> Result<Value>;
    async fn stop(&self, request: &Value) -> Result<Value>;
}

/// A live agent as known by the agent-management service.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AgentHandle {
    pub name: String,
    pub address: String,
}

/// Agent-management service.
#[async_trait]
pub trait AgentService: Send + Sync {
    /// Relay an agent-lifecycle event emitted by a runner.
    async fn forward(&self, peer_id: &PeerId, tid: Tid, event: &Value) -> Result<()>;
    async fn lookup(&self, agent_name: &str) -> Result<Option<AgentHandle>>;
    async fn notify(&self, address: &str, data: Value) -> Result<()>;
}

/// Where a published event goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishScope {
    Broadcast,
    Channel(String),
}

/// Live-monitoring subscriber service.
#[async_trait]
pub trait MonitorSink: Send + Sync {
    async fn publish(&self, event: &Value, scope: PublishScope) -> Result<()>;
    /// Ask a human (or remote process) and wait up to `timeout`.
    /// `Ok(None)` means nobody answered in time.
    async fn interact(&self, body: &Value, timeout: Duration) -> Result<Option<Value>>;
}

/// Fields shared by every per-granularity result record.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ResultRecord {
    pub result: String,
    pub actor: String,
    pub duration: f64,
    pub project_id: u64,
}

/// Counts carried by global and plan results.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanCounts {
    pub testsuites: u64,
    pub testunits: u64,
    pub testcases: u64,
}

/// Statistics aggregation sink, one method per granularity.
#[async_trait]
pub trait StatsSink: Send + Sync {
    async fn record_testcase(&self, record: ResultRecord) -> Result<()>;
    async fn record_testabstract(&self, record: ResultRecord, testcases: u64) -> Result<()>;
    async fn record_testunit(&self, record: ResultRecord, testcases: u64) -> Result<()>;
    async fn record_testsuite(&self, record: ResultRecord, testcases: u64) -> Result<()>;
    async fn record_testglobal(&self, record: ResultRecord, counts: PlanCounts) -> Result<()>;
    async fn record_testplan(&self, record: ResultRecord, counts: PlanCounts) -> Result<()>;
}

/// Directory entry of a logged-in user.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserPresence {
    pub connected_at_ms: u64,
}

/// Read-only user/session directory.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn lookup(&self, login: &str) -> Result<Option<UserPresence>>;
}

/// Every service the hub depends on.
#[derive(Clone)]
pub struct Collaborators {
    pub probes: Arc<dyn ProbeService>,
    pub agents: Arc<dyn AgentService>,
    pub monitor: Arc<dyn MonitorSink>,
    pub stats: Arc<dyn StatsSink>,
    pub users: Arc<dyn UserDirectory>,
}
