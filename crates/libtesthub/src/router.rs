use std::sync::Arc;

use testhub_protocol::{PeerId, TaskId, Tid};
use tracing::{debug, info, warn};

use crate::error::HubError;
use crate::event::{
    AGENT_READY, AGENT_RESET, Granularity, NotifyEvent, SCRIPT_STOPPED, TerminalRecord,
};
use crate::lifecycle::LifecycleCoordinator;
use crate::registry::{Session, SessionRegistry};
use crate::services::{
    AgentService, Collaborators, MonitorSink, PublishScope, StatsSink, UserDirectory,
};

/// Outcome of the visibility gate for one event or interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    UnknownTask,
    Background,
    UnknownSession,
    UnknownUser,
    /// The user connected at or after the session started.
    ConnectedLater,
}

/// Decides where a runner notify goes and applies its side effects.
pub struct EventRouter {
    agents: Arc<dyn AgentService>,
    monitor: Arc<dyn MonitorSink>,
    stats: Arc<dyn StatsSink>,
    users: Arc<dyn UserDirectory>,
    lifecycle: LifecycleCoordinator,
}

impl EventRouter {
    pub fn new(services: &Collaborators, lifecycle: LifecycleCoordinator) -> Self {
        Self {
            agents: services.agents.clone(),
            monitor: services.monitor.clone(),
            stats: services.stats.clone(),
            users: services.users.clone(),
            lifecycle,
        }
    }

    /// A live viewer is eligible only if the task is registered, runs in the
    /// foreground, and the viewer was already connected when the session began.
    pub async fn visibility(
        &self,
        registry: &SessionRegistry,
        peer_id: &PeerId,
        task_id: &TaskId,
        from: Option<&str>,
    ) -> Visibility {
        match registry.is_background(task_id) {
            None => return Visibility::UnknownTask,
            Some(true) => return Visibility::Background,
            Some(false) => {}
        }
        let Some(session) = registry.get(peer_id) else {
            return Visibility::UnknownSession;
        };
        let Some(login) = from else {
            return Visibility::UnknownUser;
        };
        match self.users.lookup(login).await {
            Ok(Some(user)) if user.connected_at_ms < session.connected_at_ms() => {
                Visibility::Visible
            }
            Ok(Some(_)) => Visibility::ConnectedLater,
            Ok(None) => Visibility::UnknownUser,
            Err(err) => {
                warn!(login, "user lookup failed: {err:#}");
                Visibility::UnknownUser
            }
        }
    }

    pub async fn route(
        &self,
        registry: &mut SessionRegistry,
        peer_id: &PeerId,
        tid: Tid,
        event: &NotifyEvent,
    ) -> Result<Visibility, HubError> {
        if event.is_agent_event() {
            self.route_agent_event(registry, peer_id, tid, event).await;
        }

        if let Some(record) = event.terminal_record()? {
            self.record_stats(record).await;
            if event.granularity() == Some(Granularity::TestCase) {
                let session = session_mut(registry, peer_id)?;
                self.lifecycle.reset_agents(session).await;
            }
        }

        let visibility = self
            .visibility(registry, peer_id, &event.task_id, event.from.as_deref())
            .await;
        match visibility {
            Visibility::Visible => self.publish(event).await,
            Visibility::UnknownTask => {
                warn!(task_id = %event.task_id, event = %event.kind, "test unknown")
            }
            Visibility::UnknownSession => warn!(peer_id = %peer_id, "unknown test"),
            other => debug!(
                task_id = %event.task_id,
                event = %event.kind,
                visibility = ?other,
                "event not forwarded"
            ),
        }

        if event.kind == SCRIPT_STOPPED {
            self.finish_script(registry, peer_id, &event.task_id).await;
        }
        Ok(visibility)
    }

    async fn route_agent_event(
        &self,
        registry: &mut SessionRegistry,
        peer_id: &PeerId,
        tid: Tid,
        event: &NotifyEvent,
    ) {
        if let Some(session) = registry.get_mut(peer_id) {
            match event.kind.as_str() {
                AGENT_READY => match event.agent_binding() {
                    Ok(binding) => {
                        debug!(peer_id = %peer_id, agent = %binding.agent_name, "agent bound");
                        session.agents.push(binding);
                    }
                    Err(err) => {
                        warn!(peer_id = %peer_id, "unable to handle notify for agent: {err}")
                    }
                },
                AGENT_RESET => {
                    self.lifecycle.release_agent(session, &event.body);
                }
                _ => {}
            }
        }

        if let Err(err) = self.agents.forward(peer_id, tid, &event.body).await {
            warn!(
                peer_id = %peer_id,
                event = %event.kind,
                "unable to forward agent event: {err:#}"
            );
        }
    }

    async fn record_stats(&self, record: TerminalRecord) {
        let result = match record {
            TerminalRecord::TestCase(r) => self.stats.record_testcase(r).await,
            TerminalRecord::TestAbstract(r, tc) => self.stats.record_testabstract(r, tc).await,
            TerminalRecord::TestUnit(r, tc) => self.stats.record_testunit(r, tc).await,
            TerminalRecord::TestSuite(r, tc) => self.stats.record_testsuite(r, tc).await,
            TerminalRecord::TestGlobal(r, counts) => self.stats.record_testglobal(r, counts).await,
            TerminalRecord::TestPlan(r, counts) => self.stats.record_testplan(r, counts).await,
        };
        if let Err(err) = result {
            warn!("unable to record statistics: {err:#}");
        }
    }

    async fn publish(&self, event: &NotifyEvent) {
        let scope = match &event.channel_id {
            Some(channel) => PublishScope::Channel(channel.clone()),
            None => PublishScope::Broadcast,
        };
        if let Err(err) = self.monitor.publish(&event.body, scope).await {
            warn!(
                task_id = %event.task_id,
                event = %event.kind,
                "unable to publish event: {err:#}"
            );
        }
    }

    async fn finish_script(
        &self,
        registry: &mut SessionRegistry,
        peer_id: &PeerId,
        task_id: &TaskId,
    ) {
        if let Some(session) = registry.get_mut(peer_id) {
            self.lifecycle.reset_probes(session).await;
            self.lifecycle.reset_agents(session).await;
        }
        registry.remove_task(task_id);
        if registry.remove_session(peer_id).is_some() {
            info!(peer_id = %peer_id, task_id = %task_id, "script stopped, session closed");
        }
    }
}

fn session_mut<'a>(
    registry: &'a mut SessionRegistry,
    peer_id: &PeerId,
) -> Result<&'a mut Session, HubError> {
    registry
        .get_mut(peer_id)
        .ok_or_else(|| HubError::UnknownSession(peer_id.clone()))
}
