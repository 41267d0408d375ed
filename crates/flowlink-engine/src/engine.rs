use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{info, warn};

use flowlink_core::config::AppConfig;
use flowlink_core::error::{FlowlinkError, Result};
use flowlink_core::event::EventBus;
use flowlink_core::traits::Connector;
use flowlink_core::types::{ConnectionState, DeploymentStatus, EngineEvent, ScopeId};

use crate::connection::{ConnectionManager, ConnectionSettings};
use crate::deployment::DeploymentStateMachine;
use crate::dispatcher::{RequestDispatcher, ResponseHook};
use crate::protocol::{Operation, StatusSnapshot, Timeout};
use crate::router::FrameRouter;
use crate::store::{ScopeView, ScopedStateStore};
use crate::triggers::{TriggerWait, TriggerWaitRegistry};

/// Runtime settings of a `SyncEngine`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub keepalive_interval: Duration,
    pub reconnect_delay: Duration,
    pub request_timeout: Duration,
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(30),
            reconnect_delay: Duration::from_millis(3000),
            request_timeout: Duration::from_secs(30),
            event_capacity: 256,
        }
    }
}

impl From<&AppConfig> for EngineConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            keepalive_interval: Duration::from_secs(config.connection.keepalive_interval_secs),
            reconnect_delay: Duration::from_millis(config.connection.reconnect_delay_ms),
            request_timeout: Duration::from_secs(config.requests.default_timeout_secs),
            event_capacity: config.events.capacity,
        }
    }
}

struct EngineInner {
    connection: Arc<ConnectionManager>,
    dispatcher: Arc<RequestDispatcher>,
    store: Arc<ScopedStateStore>,
    deployments: Arc<DeploymentStateMachine>,
    triggers: Arc<TriggerWaitRegistry>,
    events: Arc<EventBus>,
}

/// Client-side synchronization engine for a workflow execution backend.
///
/// Cheap to clone; all clones share one connection and one state store.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    pub fn new(config: EngineConfig, connector: Arc<dyn Connector>) -> Self {
        let events = Arc::new(EventBus::new(config.event_capacity));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let dispatcher = Arc::new(RequestDispatcher::new(
            outbound_tx,
            state_rx,
            config.request_timeout,
        ));
        let store = Arc::new(ScopedStateStore::new());
        let deployments = Arc::new(DeploymentStateMachine::new(store.clone(), events.clone()));
        let triggers = Arc::new(TriggerWaitRegistry::new(dispatcher.clone()));
        let router = Arc::new(FrameRouter::new(
            dispatcher.clone(),
            store.clone(),
            deployments.clone(),
            triggers.clone(),
            events.clone(),
        ));
        let connection = Arc::new(ConnectionManager::new(
            connector,
            router,
            dispatcher.clone(),
            events.clone(),
            ConnectionSettings {
                keepalive_interval: config.keepalive_interval,
                reconnect_delay: config.reconnect_delay,
            },
            state_tx,
            outbound_rx,
        ));

        Self {
            inner: Arc::new(EngineInner {
                connection,
                dispatcher,
                store,
                deployments,
                triggers,
                events,
            }),
        }
    }

    // ── Connection ──────────────────────────────────────────────

    /// Start connecting in the background. Must be called within a tokio
    /// runtime.
    pub fn connect(&self) {
        self.inner.connection.connect();
    }

    /// Close the connection. No reconnect follows.
    pub async fn close(&self) {
        self.inner.connection.close().await;
    }

    /// Wait until the transport is open, returning its generation.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<u64> {
        let mut state = self.inner.connection.subscribe_state();
        let opened = tokio::time::timeout(timeout, state.wait_for(ConnectionState::is_open))
            .await
            .ok()
            .and_then(|waited| waited.ok().map(|open| *open));
        match opened {
            Some(ConnectionState::Open { generation }) => Ok(generation),
            _ => Err(FlowlinkError::NotConnected),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    pub fn endpoint(&self) -> &str {
        self.inner.connection.endpoint()
    }

    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.inner.connection.last_activity()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.dispatcher.pending_count()
    }

    // ── Scopes ──────────────────────────────────────────────────

    /// Live view of one scope's state.
    pub fn scope(&self, scope: impl Into<ScopeId>) -> ScopeView {
        ScopeView::new(self.inner.store.clone(), scope.into())
    }

    pub fn active_scope(&self) -> Option<ScopeId> {
        self.inner.store.active_scope()
    }

    pub fn scopes(&self) -> Vec<ScopeId> {
        self.inner.store.scopes()
    }

    /// Make `scope` the active scope and resync it from the backend.
    ///
    /// The switch itself always takes effect; a failed resync leaves the
    /// scope active but stale and returns the error.
    pub async fn switch_active_scope(&self, scope: impl Into<ScopeId>) -> Result<()> {
        let scope = scope.into();
        let previous = self.inner.store.activate(&scope);
        if previous.as_ref() != Some(&scope) {
            info!(scope = %scope, previous = ?previous, "Active scope switched");
            self.inner.events.publish(EngineEvent::ScopeActivated {
                scope_id: scope.clone(),
                previous,
            });
        }
        self.resync(&scope).await
    }

    /// Replace a scope's state with the backend's authoritative snapshot.
    ///
    /// The snapshot is applied on the connection task as the response is
    /// routed, so broadcasts that follow the response are never overwritten.
    pub async fn resync(&self, scope: &ScopeId) -> Result<()> {
        let store = self.inner.store.clone();
        let events = self.inner.events.clone();
        let target = scope.clone();
        let apply: ResponseHook = Box::new(move |response: Value| {
            let snapshot = StatusSnapshot::from_response(response)?;
            if let Some(reported) = &snapshot.workflow_id {
                if reported != &target {
                    return Err(FlowlinkError::ProtocolViolation(format!(
                        "status snapshot for {reported} returned for {target}"
                    )));
                }
            }
            store.apply_snapshot(&target, snapshot);
            events.publish(EngineEvent::ScopeResynced { scope_id: target });
            Ok(Value::Null)
        });

        self.inner
            .dispatcher
            .start_with(Operation::GetStatus, scope_fields(scope), Timeout::Default, apply)?
            .recv()
            .await?;
        Ok(())
    }

    // ── Requests ────────────────────────────────────────────────

    /// Send an arbitrary operation and wait for its response.
    pub async fn request(
        &self,
        operation: Operation,
        fields: Map<String, Value>,
        timeout: Timeout,
    ) -> Result<Value> {
        self.inner.dispatcher.send(operation, fields, timeout).await
    }

    pub async fn execute_node(
        &self,
        scope: &ScopeId,
        node_id: &str,
        params: Map<String, Value>,
    ) -> Result<Value> {
        let mut fields = merge(scope_fields(scope), params);
        fields.insert("node_id".into(), Value::String(node_id.to_string()));
        self.request(Operation::ExecuteNode, fields, Timeout::Default)
            .await
    }

    pub async fn execute_workflow(&self, scope: &ScopeId, params: Map<String, Value>) -> Result<Value> {
        self.request(
            Operation::ExecuteWorkflow,
            merge(scope_fields(scope), params),
            Timeout::Default,
        )
        .await
    }

    pub async fn stop_execution(&self, scope: &ScopeId) -> Result<Value> {
        self.request(Operation::StopExecution, scope_fields(scope), Timeout::Default)
            .await
    }

    // ── Deployments ─────────────────────────────────────────────

    pub async fn deploy_workflow(&self, scope: &ScopeId, params: Map<String, Value>) -> Result<Value> {
        self.request(
            Operation::DeployWorkflow,
            merge(scope_fields(scope), params),
            Timeout::Default,
        )
        .await
    }

    pub async fn cancel_deployment(&self, scope: &ScopeId) -> Result<Value> {
        self.request(Operation::CancelDeployment, scope_fields(scope), Timeout::Default)
            .await
    }

    /// Fetch the authoritative deployment status and reconcile the local
    /// record with it.
    pub async fn fetch_deployment_status(&self, scope: &ScopeId) -> Result<DeploymentStatus> {
        let response = self
            .request(Operation::GetDeploymentStatus, scope_fields(scope), Timeout::Default)
            .await?;
        let body = response.get("deployment").cloned().unwrap_or(response);
        let status = DeploymentStatus::deserialize(&body)
            .map_err(|e| FlowlinkError::ProtocolViolation(format!("invalid deployment status: {e}")))?;
        Ok(self.inner.deployments.reconcile(scope, status))
    }

    /// Local, possibly stale, deployment record.
    pub fn deployment_status(&self, scope: &ScopeId) -> DeploymentStatus {
        self.inner.deployments.status(scope)
    }

    /// Return a terminal deployment to idle.
    pub fn acknowledge_deployment(&self, scope: &ScopeId) -> bool {
        self.inner.deployments.acknowledge(scope)
    }

    // ── Trigger waits ───────────────────────────────────────────

    /// Arm a trigger node. The returned wait has no deadline; it settles
    /// when the trigger fires, on cancel, or on connection loss. Waits do
    /// not survive a reconnect and must be registered again.
    pub fn wait_for_trigger(
        &self,
        scope: &ScopeId,
        node_id: &str,
        params: Map<String, Value>,
    ) -> Result<TriggerWait> {
        self.inner.triggers.register(scope, node_id, params)
    }

    /// Cancel trigger waits on a node: one waiter or all of them. The
    /// backend is told on a best-effort basis. Returns how many local
    /// waits were cancelled.
    pub async fn cancel_trigger_wait(
        &self,
        scope: &ScopeId,
        node_id: &str,
        waiter_id: Option<&str>,
    ) -> Result<usize> {
        let cancelled = self.inner.triggers.cancel(Some(scope), node_id, waiter_id);

        if self.connection_state().is_open() {
            let mut fields = scope_fields(scope);
            fields.insert("node_id".into(), Value::String(node_id.to_string()));
            if let Some(waiter_id) = waiter_id {
                fields.insert("waiter_id".into(), Value::String(waiter_id.to_string()));
            }
            if let Err(e) = self
                .request(Operation::CancelEventWait, fields, Timeout::Default)
                .await
            {
                warn!(scope = %scope, node_id, error = %e, "Backend did not acknowledge wait cancel");
            }
        }
        Ok(cancelled)
    }

    // ── Local maintenance ───────────────────────────────────────

    /// Clear node statuses locally: the listed nodes, or all when `None`.
    pub fn clear_node_statuses(&self, scope: &ScopeId, nodes: Option<&[String]>) -> usize {
        let cleared = self.inner.store.clear_node_statuses(scope, nodes);
        self.inner.events.publish(EngineEvent::NodeStatusesCleared {
            scope_id: scope.clone(),
            cleared,
        });
        cleared
    }

    /// Evict least-recently-used scopes beyond `keep`.
    pub fn evict_lru_scopes(&self, keep: usize) -> Vec<ScopeId> {
        let evicted = self.inner.store.evict_lru(keep);
        if !evicted.is_empty() {
            info!(count = evicted.len(), "Evicted idle scopes");
        }
        evicted
    }

    /// Nodes with a live trigger waiter.
    pub fn waiting_triggers(&self) -> Vec<(ScopeId, String, DateTime<Utc>)> {
        self.inner.triggers.waiting_nodes()
    }
}

fn scope_fields(scope: &ScopeId) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert("workflow_id".into(), Value::String(scope.to_string()));
    fields
}

/// Caller params never override the scope.
fn merge(mut base: Map<String, Value>, params: Map<String, Value>) -> Map<String, Value> {
    for (key, value) in params {
        base.entry(key).or_insert(value);
    }
    base
}
