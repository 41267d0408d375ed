use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, trace, warn};

use flowlink_core::error::FlowlinkError;
use flowlink_core::event::EventBus;
use flowlink_core::types::{EngineEvent, ExecutionState, NodeStatus};

use crate::deployment::DeploymentStateMachine;
use crate::dispatcher::RequestDispatcher;
use crate::protocol::{Broadcast, InboundFrame};
use crate::store::ScopedStateStore;
use crate::triggers::TriggerWaitRegistry;

/// Classifies inbound frames as responses or broadcasts and routes each to
/// exactly one handler. Frames are processed in arrival order on the
/// connection task.
pub struct FrameRouter {
    dispatcher: Arc<RequestDispatcher>,
    store: Arc<ScopedStateStore>,
    deployments: Arc<DeploymentStateMachine>,
    triggers: Arc<TriggerWaitRegistry>,
    events: Arc<EventBus>,
}

impl FrameRouter {
    pub fn new(
        dispatcher: Arc<RequestDispatcher>,
        store: Arc<ScopedStateStore>,
        deployments: Arc<DeploymentStateMachine>,
        triggers: Arc<TriggerWaitRegistry>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            dispatcher,
            store,
            deployments,
            triggers,
            events,
        }
    }

    /// Handle one inbound text frame. Never fails: malformed frames are
    /// logged, reported on the event bus, and dropped.
    pub fn dispatch(&self, text: &str) {
        let frame = match InboundFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => return self.violation(e),
        };

        if let Some(id) = frame.request_id.clone() {
            if self.dispatcher.is_pending(&id) {
                self.dispatcher.resolve_response(&id, frame.body);
                self.triggers.forget(&id);
                return;
            }
            if frame.frame_type.is_none() {
                debug!(request_id = %id, "Dropping response for unknown or settled request");
                return;
            }
        }

        match Broadcast::from_frame(frame) {
            Ok(broadcast) => self.handle(broadcast),
            Err(e) => self.violation(e),
        }
    }

    fn handle(&self, broadcast: Broadcast) {
        match broadcast {
            Broadcast::ExecutionStatus {
                scope_id,
                node_id,
                status,
                payload,
            } => {
                let state = status.status;
                self.store.set_node_status(&scope_id, &node_id, status.clone());
                self.events.publish(EngineEvent::NodeStatusChanged {
                    scope_id: scope_id.clone(),
                    node_id: node_id.clone(),
                    status,
                });
                match state {
                    ExecutionState::Success => {
                        self.triggers.fire(Some(&scope_id), &node_id, &payload);
                    }
                    ExecutionState::Error => {
                        self.triggers.fail(Some(&scope_id), &node_id, &payload);
                    }
                    _ => {}
                }
            }
            Broadcast::NodeOutput {
                scope_id,
                node_id,
                payload,
            } => {
                if let Some(scope_id) = &scope_id {
                    let data = payload
                        .get("output")
                        .or_else(|| payload.get("data"))
                        .cloned()
                        .unwrap_or(Value::Null);
                    let mut status = NodeStatus::new(ExecutionState::Success, data);
                    status.output_ref = payload
                        .get("output_ref")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    self.store.set_node_status(scope_id, &node_id, status.clone());
                    self.events.publish(EngineEvent::NodeStatusChanged {
                        scope_id: scope_id.clone(),
                        node_id: node_id.clone(),
                        status,
                    });
                }
                self.triggers.fire(scope_id.as_ref(), &node_id, &payload);
            }
            Broadcast::DeploymentStatus { scope_id, event } => {
                if let Err(e) = self.deployments.apply(scope_id.as_ref(), &event) {
                    self.violation(e);
                }
            }
            Broadcast::VariableUpdate { scope_id, update } => {
                self.store.apply_variables(&scope_id, &update);
                self.events.publish(EngineEvent::VariablesChanged {
                    scope_id,
                    names: update.names(),
                });
            }
            Broadcast::WorkflowLock { scope_id, lock } => {
                self.store.set_lock(&scope_id, lock.clone());
                self.events.publish(EngineEvent::LockChanged { scope_id, lock });
            }
            Broadcast::Pong => trace!("Received pong"),
            Broadcast::Unknown { frame_type } => {
                debug!(frame_type = %frame_type, "Ignoring unknown broadcast type");
            }
        }
    }

    /// Reset routing state after the transport drops.
    pub fn connection_lost(&self) {
        let cleared = self.triggers.clear();
        if cleared > 0 {
            debug!(cleared, "Cleared trigger waiters on connection loss");
        }
        self.store.mark_all_stale();
    }

    fn violation(&self, error: FlowlinkError) {
        warn!(error = %error, "Dropping inbound frame");
        self.events.publish(EngineEvent::ProtocolViolation {
            reason: error.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowlink_core::types::{ConnectionState, DeploymentState, ScopeId};
    use serde_json::{json, Map};
    use std::time::Duration;
    use tokio::sync::{broadcast, mpsc, watch};

    use crate::protocol::{Operation, Timeout};

    struct Fixture {
        router: FrameRouter,
        dispatcher: Arc<RequestDispatcher>,
        store: Arc<ScopedStateStore>,
        deployments: Arc<DeploymentStateMachine>,
        triggers: Arc<TriggerWaitRegistry>,
        events: broadcast::Receiver<EngineEvent>,
        _outbound: mpsc::UnboundedReceiver<String>,
        _state: watch::Sender<ConnectionState>,
    }

    fn fixture() -> Fixture {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Open { generation: 1 });
        let dispatcher = Arc::new(RequestDispatcher::new(tx, state_rx, Duration::from_secs(30)));
        let store = Arc::new(ScopedStateStore::new());
        let bus = Arc::new(EventBus::default());
        let deployments = Arc::new(DeploymentStateMachine::new(store.clone(), bus.clone()));
        let triggers = Arc::new(TriggerWaitRegistry::new(dispatcher.clone()));
        let events = bus.subscribe();
        Fixture {
            router: FrameRouter::new(
                dispatcher.clone(),
                store.clone(),
                deployments.clone(),
                triggers.clone(),
                bus,
            ),
            dispatcher,
            store,
            deployments,
            triggers,
            events,
            _outbound: rx,
            _state: state_tx,
        }
    }

    fn scope(id: &str) -> ScopeId {
        ScopeId::from(id)
    }

    #[tokio::test]
    async fn response_frame_resolves_request() {
        let f = fixture();
        let mut fields = Map::new();
        fields.insert("workflow_id".into(), json!("w1"));
        let pending = f
            .dispatcher
            .start(Operation::ExecuteWorkflow, fields, Timeout::Default)
            .unwrap();
        let id = pending.id().to_string();

        f.router
            .dispatch(&json!({"request_id": id, "success": true}).to_string());
        assert_eq!(pending.recv().await.unwrap()["success"], true);
    }

    #[test]
    fn unknown_response_is_dropped_quietly() {
        let mut f = fixture();
        f.router
            .dispatch(&json!({"request_id": "req-gone", "ok": true}).to_string());
        assert!(f.events.try_recv().is_err());
    }

    #[test]
    fn execution_status_updates_only_its_scope() {
        let f = fixture();
        f.router.dispatch(
            &json!({
                "type": "execution_status",
                "workflow_id": "w1",
                "node_id": "n1",
                "status": "success",
                "data": {"rows": 3}
            })
            .to_string(),
        );
        let status = f.store.node_status(&scope("w1"), "n1").unwrap();
        assert_eq!(status.status, ExecutionState::Success);
        assert_eq!(status.data["rows"], 3);
        assert!(f.store.node_status(&scope("w2"), "n1").is_none());
    }

    #[test]
    fn unscoped_execution_status_is_a_violation() {
        let mut f = fixture();
        f.router.dispatch(
            &json!({"type": "execution_status", "node_id": "n1", "status": "success"}).to_string(),
        );
        assert!(f.store.scopes().is_empty());
        assert!(matches!(
            f.events.try_recv(),
            Ok(EngineEvent::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn malformed_frame_is_reported() {
        let mut f = fixture();
        f.router.dispatch("{{{");
        assert!(matches!(
            f.events.try_recv(),
            Ok(EngineEvent::ProtocolViolation { .. })
        ));
    }

    #[tokio::test]
    async fn node_output_fires_trigger_waiters() {
        let f = fixture();
        let wait = f.triggers.register(&scope("w1"), "hook", Map::new()).unwrap();
        f.router.dispatch(
            &json!({
                "type": "node_output",
                "workflow_id": "w1",
                "node_id": "hook",
                "output": {"body": "hi"}
            })
            .to_string(),
        );
        let payload = wait.wait().await.unwrap();
        assert_eq!(payload["output"]["body"], "hi");
        let status = f.store.node_status(&scope("w1"), "hook").unwrap();
        assert_eq!(status.status, ExecutionState::Success);
        assert_eq!(status.data["body"], "hi");
    }

    #[tokio::test]
    async fn direct_trigger_response_clears_waiter() {
        let f = fixture();
        let wait = f.triggers.register(&scope("w1"), "hook", Map::new()).unwrap();
        let id = wait.waiter_id().to_string();
        f.router
            .dispatch(&json!({"request_id": id, "event": {"n": 1}}).to_string());
        assert_eq!(f.triggers.waiter_count(), 0);
        assert_eq!(wait.wait().await.unwrap()["event"]["n"], 1);
    }

    #[test]
    fn unscoped_deployment_goes_to_active_scope() {
        let f = fixture();
        f.store.activate(&scope("w1"));
        f.router
            .dispatch(&json!({"type": "deployment_status", "status": "starting"}).to_string());
        assert_eq!(
            f.deployments.status(&scope("w1")).state,
            DeploymentState::Starting
        );
    }

    #[test]
    fn variable_and_lock_broadcasts_apply() {
        let f = fixture();
        f.router.dispatch(
            &json!({"type": "variable_update", "workflow_id": "w1", "variables": {"a": 1}})
                .to_string(),
        );
        f.router.dispatch(
            &json!({"type": "workflow_lock", "workflow_id": "w1", "locked": true}).to_string(),
        );
        let p = f.store.snapshot(&scope("w1"));
        assert_eq!(p.variables["a"], 1);
        assert!(p.lock.locked);
    }

    #[test]
    fn unknown_broadcast_is_ignored() {
        let mut f = fixture();
        f.router
            .dispatch(&json!({"type": "canvas_hint", "workflow_id": "w1"}).to_string());
        assert!(f.events.try_recv().is_err());
        assert!(f.store.scopes().is_empty());
    }
}
