//! Recording in-memory collaborators for deterministic tests without live services.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::{Value, json};
use testhub_protocol::{PeerId, Tid};

use crate::event::TerminalRecord;
use crate::services::{
    AgentHandle, AgentService, Collaborators, MonitorSink, PlanCounts, ProbeService,
    PublishScope, ResultRecord, StatsSink, UserDirectory, UserPresence,
};

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn probe_name(request: &Value) -> String {
    request
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Probe service handing out sequential call ids.
#[derive(Default)]
pub struct MockProbes {
    next_call: AtomicUsize,
    failing_starts: Mutex<HashSet<String>>,
    failing_stops: Mutex<HashSet<String>>,
    found: Mutex<Vec<Value>>,
    started: Mutex<Vec<Value>>,
    stopped: Mutex<Vec<Value>>,
}

impl MockProbes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_start(&self, name: &str) {
        locked(&self.failing_starts).insert(name.to_string());
    }

    pub fn fail_stop(&self, name: &str) {
        locked(&self.failing_stops).insert(name.to_string());
    }

    pub fn found(&self) -> Vec<Value> {
        locked(&self.found).clone()
    }

    pub fn started(&self) -> Vec<Value> {
        locked(&self.started).clone()
    }

    /// Every stop request received, failed ones included.
    pub fn stopped(&self) -> Vec<Value> {
        locked(&self.stopped).clone()
    }

    pub fn stopped_names(&self) -> Vec<String> {
        self.stopped().iter().map(probe_name).collect()
    }
}

#[async_trait]
impl ProbeService for MockProbes {
    async fn find(&self, request: &Value) -> Result<Value> {
        locked(&self.found).push(request.clone());
        Ok(json!({"name": probe_name(request), "available": true}))
    }

    async fn start(&self, request: &Value) -> Result<Value> {
        let name = probe_name(request);
        if locked(&self.failing_starts).contains(&name) {
            return Err(anyhow!("probe {name} refused to start"));
        }
        locked(&self.started).push(request.clone());
        let n = self.next_call.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(json!({"callid": format!("call-{n}"), "name": name}))
    }

    async fn stop(&self, request: &Value) -> Result<Value> {
        let name = probe_name(request);
        locked(&self.stopped).push(request.clone());
        if locked(&self.failing_stops).contains(&name) {
            return Err(anyhow!("probe {name} refused to stop"));
        }
        Ok(json!({"name": name, "stopped": true}))
    }
}

/// Agent service with a static table of live agents.
#[derive(Default)]
pub struct MockAgents {
    live: Mutex<HashMap<String, String>>,
    forwarded: Mutex<Vec<(PeerId, Tid, Value)>>,
    notifications: Mutex<Vec<(String, Value)>>,
    fail_forward: Mutex<bool>,
}

impl MockAgents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_agent(&self, name: &str, address: &str) {
        locked(&self.live).insert(name.to_string(), address.to_string());
    }

    pub fn fail_forwarding(&self) {
        *locked(&self.fail_forward) = true;
    }

    pub fn forwarded(&self) -> Vec<(PeerId, Tid, Value)> {
        locked(&self.forwarded).clone()
    }

    pub fn notifications(&self) -> Vec<(String, Value)> {
        locked(&self.notifications).clone()
    }
}

#[async_trait]
impl AgentService for MockAgents {
    async fn forward(&self, peer_id: &PeerId, tid: Tid, event: &Value) -> Result<()> {
        locked(&self.forwarded).push((peer_id.clone(), tid, event.clone()));
        if *locked(&self.fail_forward) {
            return Err(anyhow!("agent service unavailable"));
        }
        Ok(())
    }

    async fn lookup(&self, agent_name: &str) -> Result<Option<AgentHandle>> {
        Ok(locked(&self.live).get(agent_name).map(|address| AgentHandle {
            name: agent_name.to_string(),
            address: address.clone(),
        }))
    }

    async fn notify(&self, address: &str, data: Value) -> Result<()> {
        locked(&self.notifications).push((address.to_string(), data));
        Ok(())
    }
}

/// Monitoring sink recording publishes and answering interactions.
///
/// Interactions echo their body back after `interact_delay`, or answer
/// nothing once [`MockMonitor::answer_nothing`] is set.
#[derive(Default)]
pub struct MockMonitor {
    published: Mutex<Vec<(Value, PublishScope)>>,
    interactions: Mutex<Vec<Value>>,
    interact_delay: Mutex<Duration>,
    silent: Mutex<bool>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_interact_delay(&self, delay: Duration) {
        *locked(&self.interact_delay) = delay;
    }

    pub fn answer_nothing(&self) {
        *locked(&self.silent) = true;
    }

    pub fn published(&self) -> Vec<(Value, PublishScope)> {
        locked(&self.published).clone()
    }

    /// Interaction bodies in the order they completed.
    pub fn interactions(&self) -> Vec<Value> {
        locked(&self.interactions).clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MonitorSink for MockMonitor {
    async fn publish(&self, event: &Value, scope: PublishScope) -> Result<()> {
        locked(&self.published).push((event.clone(), scope));
        Ok(())
    }

    async fn interact(&self, body: &Value, timeout: Duration) -> Result<Option<Value>> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *locked(&self.interact_delay);
        tokio::time::sleep(delay.min(timeout)).await;
        locked(&self.interactions).push(body.clone());
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if *locked(&self.silent) || delay > timeout {
            return Ok(None);
        }
        Ok(Some(json!({"echo": body})))
    }
}

/// Statistics sink keeping every record it receives.
#[derive(Default)]
pub struct MockStats {
    records: Mutex<Vec<TerminalRecord>>,
}

impl MockStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TerminalRecord> {
        locked(&self.records).clone()
    }

    fn push(&self, record: TerminalRecord) -> Result<()> {
        locked(&self.records).push(record);
        Ok(())
    }
}

#[async_trait]
impl StatsSink for MockStats {
    async fn record_testcase(&self, record: ResultRecord) -> Result<()> {
        self.push(TerminalRecord::TestCase(record))
    }

    async fn record_testabstract(&self, record: ResultRecord, testcases: u64) -> Result<()> {
        self.push(TerminalRecord::TestAbstract(record, testcases))
    }

    async fn record_testunit(&self, record: ResultRecord, testcases: u64) -> Result<()> {
        self.push(TerminalRecord::TestUnit(record, testcases))
    }

    async fn record_testsuite(&self, record: ResultRecord, testcases: u64) -> Result<()> {
        self.push(TerminalRecord::TestSuite(record, testcases))
    }

    async fn record_testglobal(&self, record: ResultRecord, counts: PlanCounts) -> Result<()> {
        self.push(TerminalRecord::TestGlobal(record, counts))
    }

    async fn record_testplan(&self, record: ResultRecord, counts: PlanCounts) -> Result<()> {
        self.push(TerminalRecord::TestPlan(record, counts))
    }
}

/// User directory backed by a login -> connection time table.
#[derive(Default)]
pub struct MockUsers {
    users: Mutex<HashMap<String, u64>>,
    lookups: Mutex<Vec<String>>,
}

impl MockUsers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_user(&self, login: &str, connected_at_ms: u64) {
        locked(&self.users).insert(login.to_string(), connected_at_ms);
    }

    /// Logins looked up, in call order.
    pub fn lookups(&self) -> Vec<String> {
        locked(&self.lookups).clone()
    }
}

#[async_trait]
impl UserDirectory for MockUsers {
    async fn lookup(&self, login: &str) -> Result<Option<UserPresence>> {
        locked(&self.lookups).push(login.to_string());
        Ok(locked(&self.users)
            .get(login)
            .map(|&connected_at_ms| UserPresence { connected_at_ms }))
    }
}

/// One of each mock, with typed handles kept for assertions.
#[derive(Clone, Default)]
pub struct MockServices {
    pub probes: Arc<MockProbes>,
    pub agents: Arc<MockAgents>,
    pub monitor: Arc<MockMonitor>,
    pub stats: Arc<MockStats>,
    pub users: Arc<MockUsers>,
}

impl MockServices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            probes: self.probes.clone(),
            agents: self.agents.clone(),
            monitor: self.monitor.clone(),
            stats: self.stats.clone(),
            users: self.users.clone(),
        }
    }
}
