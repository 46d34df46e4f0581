use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures_util::FutureExt;
use serde_json::{Value, json};
use testhub_protocol::{ErrorCode, HubStatus, PeerId, Request, Response, TaskId, Tid, command};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::error::HubError;
use crate::event::{NotifyEvent, optional_string, task_id_of};
use crate::executor::{InteractExecutor, InteractJob};
use crate::lifecycle::LifecycleCoordinator;
use crate::outbound::{Outbound, enqueue_response};
use crate::registry::SessionRegistry;
use crate::router::{EventRouter, Visibility};
use crate::services::Collaborators;

/// Entry point for every runner request.
///
/// One lock guards the registry and every routing decision; interactive
/// exchanges are handed to the executor so they never run under it.
pub struct Dispatcher {
    state: Mutex<SessionRegistry>,
    router: EventRouter,
    lifecycle: LifecycleCoordinator,
    executor: InteractExecutor,
}

impl Dispatcher {
    /// Build the dispatcher and start its interactive worker.
    /// Must be called from within a tokio runtime.
    pub fn new(services: Collaborators) -> Self {
        let lifecycle = LifecycleCoordinator::new(services.probes.clone(), services.agents.clone());
        Self {
            state: Mutex::new(SessionRegistry::new()),
            router: EventRouter::new(&services, lifecycle.clone()),
            lifecycle,
            executor: InteractExecutor::start(services.monitor.clone()),
        }
    }

    /// Track a freshly accepted connection; returns its connection timestamp.
    pub async fn connect(&self, peer_id: PeerId, outbound: Outbound) -> u64 {
        let mut registry = self.state.lock().await;
        registry.on_connect(peer_id, outbound).connected_at_ms()
    }

    pub async fn connect_at(&self, peer_id: PeerId, connected_at_ms: u64, outbound: Outbound) {
        let mut registry = self.state.lock().await;
        registry.on_connect_at(peer_id, connected_at_ms, outbound);
    }

    /// Forget a closed connection. Probes and agents it still holds are not
    /// reset; only `script-stopped` does that.
    pub async fn disconnect(&self, peer_id: &PeerId) -> bool {
        let mut registry = self.state.lock().await;
        match registry.on_disconnect(peer_id) {
            Some(session) => {
                if !session.probes.is_empty() || !session.agents.is_empty() {
                    warn!(
                        peer_id = %peer_id,
                        probes = session.probes.len(),
                        agents = session.agents.len(),
                        "session closed without script-stopped, probes and agents left running"
                    );
                }
                true
            }
            None => false,
        }
    }

    pub async fn register_task(&self, task_id: TaskId, background: bool) {
        self.state.lock().await.register_task(task_id, background);
    }

    pub async fn status(&self) -> HubStatus {
        let registry = self.state.lock().await;
        HubStatus {
            sessions: registry.session_count(),
            tasks: registry.task_count(),
            interact_pending: self.executor.pending(),
            interact_submitted: self.executor.submitted(),
        }
    }

    /// Drain queued interactive exchanges and stop the worker.
    pub async fn shutdown(&self) {
        self.executor.shutdown().await;
    }

    /// Handle one request. Failures are logged and the request is dropped;
    /// nothing propagates to the caller.
    pub async fn handle(&self, peer_id: &PeerId, request: Request) {
        let tid = request.tid();
        let mut registry = self.state.lock().await;
        let outcome = AssertUnwindSafe(self.handle_locked(&mut registry, peer_id, request))
            .catch_unwind()
            .await;
        drop(registry);

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) if err.is_protocol_anomaly() => {
                warn!(peer_id = %peer_id, tid, "request dropped: {err}");
            }
            Ok(Err(err)) => {
                error!(peer_id = %peer_id, tid, "unable to handle incoming request: {err:#}");
            }
            Err(_) => {
                error!(peer_id = %peer_id, tid, "request handler panicked");
            }
        }
    }

    async fn handle_locked(
        &self,
        registry: &mut SessionRegistry,
        peer_id: &PeerId,
        request: Request,
    ) -> Result<(), HubError> {
        let Some(session) = registry.get_mut(peer_id) else {
            debug!(peer_id = %peer_id, "request from unknown session ignored");
            return Ok(());
        };
        let task_id = task_id_of(request.body())?;
        session.current_task_id = Some(task_id.clone());

        match request {
            Request::Notify { tid, body } => {
                let event = NotifyEvent::parse(body)?;
                self.router.route(registry, peer_id, tid, &event).await?;
            }
            Request::Cmd { tid, body } => {
                self.handle_cmd(registry, peer_id, tid, task_id, body).await?;
            }
        }
        Ok(())
    }

    async fn handle_cmd(
        &self,
        registry: &mut SessionRegistry,
        peer_id: &PeerId,
        tid: Tid,
        task_id: TaskId,
        body: Value,
    ) -> Result<(), HubError> {
        let Some(cmd) = body.get("cmd").and_then(Value::as_str).map(str::to_owned) else {
            warn!(peer_id = %peer_id, tid, "cmd is missing");
            return Ok(());
        };
        debug!(peer_id = %peer_id, tid, cmd = %cmd, "cmd received");

        match cmd.as_str() {
            command::GET_PROBE => {
                let res = self.lifecycle.find_probe(&body).await?;
                reply(registry, peer_id, Response::ok(tid, json!({"cmd": cmd, "res": res})));
            }
            command::START_PROBE => {
                let session = registry
                    .get_mut(peer_id)
                    .ok_or_else(|| HubError::UnknownSession(peer_id.clone()))?;
                let res = self.lifecycle.start_probe(session, &body).await?;
                reply(registry, peer_id, Response::ok(tid, json!({"cmd": cmd, "res": res})));
            }
            command::STOP_PROBE => {
                let res = self.lifecycle.stop_probe(&body).await?;
                reply(registry, peer_id, Response::ok(tid, json!({"cmd": cmd, "res": res})));
            }
            command::INTERACT => {
                self.interact(registry, peer_id, tid, task_id, body).await?;
            }
            other => {
                warn!(peer_id = %peer_id, tid, cmd = %other, "cmd unknown");
                let body = json!({"cmd": other, "res": ErrorCode::CommandError});
                reply(registry, peer_id, Response::failed(tid, body));
            }
        }
        Ok(())
    }

    async fn interact(
        &self,
        registry: &SessionRegistry,
        peer_id: &PeerId,
        tid: Tid,
        task_id: TaskId,
        body: Value,
    ) -> Result<(), HubError> {
        let from = optional_string(&body, "from");
        match self
            .router
            .visibility(registry, peer_id, &task_id, from.as_deref())
            .await
        {
            Visibility::Visible => {}
            Visibility::UnknownTask => {
                warn!(task_id = %task_id, "test unknown, interact dropped");
                return Ok(());
            }
            other => {
                debug!(task_id = %task_id, visibility = ?other, "interact not eligible, dropped");
                return Ok(());
            }
        }

        let outbound = registry
            .get(peer_id)
            .map(|s| s.outbound.clone())
            .ok_or_else(|| HubError::UnknownSession(peer_id.clone()))?;
        let timeout = interact_timeout(&body);
        self.executor.submit(InteractJob {
            peer_id: peer_id.clone(),
            tid,
            body,
            timeout,
            outbound,
        })
    }
}

/// Longest wait granted to one interactive request.
const MAX_INTERACT_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Timeout of an interactive request, in seconds on the wire.
/// Missing, negative or unparsable values mean no wait at all; larger
/// values are capped at [`MAX_INTERACT_TIMEOUT`].
fn interact_timeout(body: &Value) -> Duration {
    let secs = body
        .get("timeout")
        .and_then(|v| match v {
            Value::String(s) => s.trim().parse::<f64>().ok(),
            other => other.as_f64(),
        })
        .unwrap_or(0.0);
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(secs.min(MAX_INTERACT_TIMEOUT.as_secs_f64()))
}

fn reply(registry: &SessionRegistry, peer_id: &PeerId, response: Response) {
    let Some(session) = registry.get(peer_id) else {
        warn!(peer_id = %peer_id, "reply for vanished session dropped");
        return;
    };
    if let Err(err) = enqueue_response(&session.outbound, response) {
        warn!(peer_id = %peer_id, "reply not delivered: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockServices;
    use tokio::sync::mpsc;

    fn cmd(tid: Tid, body: Value) -> Request {
        Request::Cmd { tid, body }
    }

    async fn hub_with_session(at: u64) -> (MockServices, Dispatcher, mpsc::Receiver<Response>) {
        let mocks = MockServices::new();
        let hub = Dispatcher::new(mocks.collaborators());
        let (tx, rx) = mpsc::channel(16);
        hub.connect_at("p1".to_string(), at, tx).await;
        (mocks, hub, rx)
    }

    #[test]
    fn interact_timeout_parsing() {
        assert_eq!(interact_timeout(&json!({"timeout": 2.5})), Duration::from_millis(2500));
        assert_eq!(interact_timeout(&json!({"timeout": "3"})), Duration::from_secs(3));
        assert_eq!(interact_timeout(&json!({"timeout": -1})), Duration::ZERO);
        assert_eq!(interact_timeout(&json!({})), Duration::ZERO);
        assert_eq!(interact_timeout(&json!({"timeout": 1e30})), MAX_INTERACT_TIMEOUT);
        assert_eq!(interact_timeout(&json!({"timeout": "inf"})), MAX_INTERACT_TIMEOUT);
    }

    #[tokio::test]
    async fn unknown_session_is_ignored() {
        let (mocks, hub, mut rx) = hub_with_session(20).await;
        hub.handle(
            &"stranger".to_string(),
            cmd(1, json!({"task-id": "t1", "cmd": "get_probe", "name": "x"})),
        )
        .await;
        assert!(rx.try_recv().is_err());
        assert!(mocks.probes.found().is_empty());
    }

    #[tokio::test]
    async fn probe_commands_reply_synchronously() {
        let (mocks, hub, mut rx) = hub_with_session(20).await;
        let peer = "p1".to_string();

        hub.handle(&peer, cmd(1, json!({"task-id": "t1", "cmd": "get_probe", "name": "net"})))
            .await;
        hub.handle(&peer, cmd(2, json!({"task-id": "t1", "cmd": "start_probe", "name": "net"})))
            .await;
        hub.handle(&peer, cmd(3, json!({"task-id": "t1", "cmd": "stop_probe", "name": "net"})))
            .await;

        let first = rx.try_recv().unwrap();
        assert_eq!(first.tid(), 1);
        let second = rx.try_recv().unwrap();
        assert_eq!(
            second,
            Response::ok(
                2,
                json!({"cmd": "start_probe", "res": {"callid": "call-1", "name": "net"}})
            )
        );
        assert_eq!(rx.try_recv().unwrap().tid(), 3);
        assert_eq!(mocks.probes.started().len(), 1);
        assert_eq!(mocks.probes.stopped_names(), vec!["net"]);
    }

    #[tokio::test]
    async fn unknown_command_gets_command_error() {
        let (_mocks, hub, mut rx) = hub_with_session(20).await;
        hub.handle(&"p1".to_string(), cmd(4, json!({"task-id": "t1", "cmd": "reboot"})))
            .await;
        assert_eq!(
            rx.try_recv().unwrap(),
            Response::failed(4, json!({"cmd": "reboot", "res": "command_error"}))
        );
    }

    #[tokio::test]
    async fn missing_command_gets_no_reply() {
        let (_mocks, hub, mut rx) = hub_with_session(20).await;
        hub.handle(&"p1".to_string(), cmd(5, json!({"task-id": "t1"}))).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn probe_failure_drops_request_and_releases_lock() {
        let (mocks, hub, mut rx) = hub_with_session(20).await;
        mocks.probes.fail_start("net");
        let peer = "p1".to_string();

        hub.handle(&peer, cmd(1, json!({"task-id": "t1", "cmd": "start_probe", "name": "net"})))
            .await;
        assert!(rx.try_recv().is_err());

        hub.handle(&peer, cmd(2, json!({"task-id": "t1", "cmd": "get_probe", "name": "net"})))
            .await;
        assert_eq!(rx.try_recv().unwrap().tid(), 2);
    }

    #[tokio::test]
    async fn notify_updates_current_task() {
        let (_mocks, hub, _rx) = hub_with_session(20).await;
        hub.handle(
            &"p1".to_string(),
            Request::Notify {
                tid: 1,
                body: json!({"task-id": 77, "event": "script-started", "from": "alice"}),
            },
        )
        .await;
        let registry = hub.state.lock().await;
        assert_eq!(
            registry.get(&"p1".to_string()).unwrap().current_task_id,
            Some(TaskId::from("77"))
        );
    }

    #[tokio::test]
    async fn interact_for_background_task_is_not_queued() {
        let (mocks, hub, mut rx) = hub_with_session(20).await;
        mocks.users.set_user("alice", 10);
        hub.register_task(TaskId::from("bg"), true).await;

        hub.handle(
            &"p1".to_string(),
            cmd(1, json!({"task-id": "bg", "cmd": "interact", "from": "alice", "timeout": 1})),
        )
        .await;
        let status = hub.status().await;
        assert_eq!(status.interact_submitted, 0);
        assert_eq!(status.interact_pending, 0);
        hub.shutdown().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn interact_from_late_user_is_not_queued() {
        let (mocks, hub, _rx) = hub_with_session(20).await;
        mocks.users.set_user("bob", 30);
        hub.register_task(TaskId::from("t1"), false).await;

        hub.handle(
            &"p1".to_string(),
            cmd(1, json!({"task-id": "t1", "cmd": "interact", "from": "bob", "timeout": 1})),
        )
        .await;
        assert_eq!(hub.status().await.interact_submitted, 0);
    }

    #[tokio::test]
    async fn eligible_interact_replies_later() {
        let (mocks, hub, mut rx) = hub_with_session(20).await;
        mocks.users.set_user("alice", 10);
        hub.register_task(TaskId::from("t1"), false).await;

        hub.handle(
            &"p1".to_string(),
            cmd(9, json!({"task-id": "t1", "cmd": "interact", "from": "alice", "timeout": 1})),
        )
        .await;
        assert_eq!(hub.status().await.interact_submitted, 1);
        hub.shutdown().await;

        match rx.try_recv().unwrap() {
            Response::Ok { tid, body } => {
                assert_eq!(tid, 9);
                assert_eq!(body["cmd"], json!("interact"));
                assert_eq!(body["rsp"]["echo"]["from"], json!("alice"));
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn disconnect_leaves_probes_running() {
        let (mocks, hub, _rx) = hub_with_session(20).await;
        let peer = "p1".to_string();
        hub.handle(&peer, cmd(1, json!({"task-id": "t1", "cmd": "start_probe", "name": "net"})))
            .await;

        assert!(hub.disconnect(&peer).await);
        assert!(!hub.disconnect(&peer).await);
        assert!(mocks.probes.stopped().is_empty());
        assert_eq!(hub.status().await.sessions, 0);
    }
}
