use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use testhub_protocol::{PeerId, TaskId};
use tracing::{debug, info, warn};

use crate::outbound::Outbound;

/// A probe started on behalf of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeInvocation {
    pub name: String,
    pub call_id: String,
    /// Start request with the service-assigned `callid` merged in.
    pub request: Value,
}

/// An agent bound to a running script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentBinding {
    pub agent_name: String,
    pub script_id: String,
    pub uuid: String,
    pub source_adapter: String,
}

/// Live state of one connected test runner.
#[derive(Debug)]
pub struct Session {
    pub peer_id: PeerId,
    connected_at_ms: u64,
    pub current_task_id: Option<TaskId>,
    pub probes: Vec<ProbeInvocation>,
    pub agents: Vec<AgentBinding>,
    pub outbound: Outbound,
}

impl Session {
    pub fn connected_at_ms(&self) -> u64 {
        self.connected_at_ms
    }
}

/// Authoritative store of live sessions and registered tasks.
pub struct SessionRegistry {
    sessions: HashMap<PeerId, Session>,
    tasks: HashMap<TaskId, bool>, // task -> runs in background
    last_connected_at_ms: u64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            tasks: HashMap::new(),
            last_connected_at_ms: 0,
        }
    }

    /// Track a new connection. Timestamps are strictly increasing so two
    /// connections never share one.
    pub fn on_connect(&mut self, peer_id: PeerId, outbound: Outbound) -> &Session {
        let connected_at_ms = now_ms().max(self.last_connected_at_ms.saturating_add(1));
        self.on_connect_at(peer_id, connected_at_ms, outbound)
    }

    /// Track a new connection with an explicit timestamp.
    /// An existing session for the same peer is replaced.
    pub fn on_connect_at(
        &mut self,
        peer_id: PeerId,
        connected_at_ms: u64,
        outbound: Outbound,
    ) -> &Session {
        self.last_connected_at_ms = self.last_connected_at_ms.max(connected_at_ms);
        let session = Session {
            peer_id: peer_id.clone(),
            connected_at_ms,
            current_task_id: None,
            probes: Vec::new(),
            agents: Vec::new(),
            outbound,
        };
        if self.sessions.insert(peer_id.clone(), session).is_some() {
            warn!(peer_id = %peer_id, "session replaced by reconnect");
        }
        info!(peer_id = %peer_id, connected_at_ms, "test is starting");
        &self.sessions[&peer_id]
    }

    /// Forget a connection. Probes and agents of the session are not reset.
    pub fn on_disconnect(&mut self, peer_id: &PeerId) -> Option<Session> {
        let removed = self.sessions.remove(peer_id);
        info!(peer_id = %peer_id, tracked = removed.is_some(), "test is ending");
        removed
    }

    pub fn register_task(&mut self, task_id: TaskId, background: bool) {
        info!(task_id = %task_id, background, "task registered");
        self.tasks.insert(task_id, background);
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&Session> {
        self.sessions.get(peer_id)
    }

    pub fn get_mut(&mut self, peer_id: &PeerId) -> Option<&mut Session> {
        self.sessions.get_mut(peer_id)
    }

    pub fn task_exists(&self, task_id: &TaskId) -> bool {
        self.tasks.contains_key(task_id)
    }

    pub fn is_background(&self, task_id: &TaskId) -> Option<bool> {
        self.tasks.get(task_id).copied()
    }

    pub fn remove_task(&mut self, task_id: &TaskId) -> bool {
        if self.tasks.remove(task_id).is_some() {
            debug!(task_id = %task_id, "task removed");
            true
        } else {
            warn!(task_id = %task_id, "task-id unknown");
            false
        }
    }

    pub fn remove_session(&mut self, peer_id: &PeerId) -> Option<Session> {
        let removed = self.sessions.remove(peer_id);
        if removed.is_none() {
            warn!(peer_id = %peer_id, "test unknown");
        }
        removed
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
