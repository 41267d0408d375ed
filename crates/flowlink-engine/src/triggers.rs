use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{debug, info};

use flowlink_core::error::{FlowlinkError, Result};
use flowlink_core::types::ScopeId;

use crate::dispatcher::{PendingResponse, RequestDispatcher};
use crate::lock;
use crate::protocol::{Operation, Timeout};

struct Waiter {
    waiter_id: String,
    scope_id: ScopeId,
    registered_at: DateTime<Utc>,
}

/// Outstanding trigger waits, keyed by node id.
///
/// A trigger wait is a request without a deadline. It is settled by a
/// matching broadcast, a direct response, a cancel, or connection loss.
/// Lock order: the waiter map is taken before the dispatcher's pending map.
pub struct TriggerWaitRegistry {
    dispatcher: Arc<RequestDispatcher>,
    waiters: Mutex<HashMap<String, Vec<Waiter>>>,
}

impl TriggerWaitRegistry {
    pub fn new(dispatcher: Arc<RequestDispatcher>) -> Self {
        Self {
            dispatcher,
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Arm a trigger node and register a waiter for its next activation.
    pub fn register(
        self: &Arc<Self>,
        scope: &ScopeId,
        node_id: &str,
        mut fields: Map<String, Value>,
    ) -> Result<TriggerWait> {
        fields.insert("workflow_id".into(), Value::String(scope.to_string()));
        fields.insert("node_id".into(), Value::String(node_id.to_string()));

        let mut waiters = lock(&self.waiters);
        let pending = self
            .dispatcher
            .start(Operation::WaitForTrigger, fields, Timeout::Never)?;
        waiters.entry(node_id.to_string()).or_default().push(Waiter {
            waiter_id: pending.id().to_string(),
            scope_id: scope.clone(),
            registered_at: Utc::now(),
        });
        drop(waiters);

        info!(scope = %scope, node_id, waiter_id = pending.id(), "Trigger wait registered");
        Ok(TriggerWait {
            scope_id: scope.clone(),
            node_id: node_id.to_string(),
            waiter_id: pending.id().to_string(),
            pending: Some(pending),
            registry: Arc::downgrade(self),
        })
    }

    /// Resolve every waiter on `node_id` with the activation payload.
    /// `scope` of `None` matches waiters in any scope.
    pub fn fire(&self, scope: Option<&ScopeId>, node_id: &str, payload: &Value) -> usize {
        self.settle_matching(scope, node_id, || Ok(payload.clone()))
    }

    /// Reject every waiter on `node_id` with the server-reported error.
    pub fn fail(&self, scope: Option<&ScopeId>, node_id: &str, payload: &Value) -> usize {
        self.settle_matching(scope, node_id, || {
            Err(FlowlinkError::server_reported(payload.clone()))
        })
    }

    /// Cancel waiters on `node_id` in `scope` (any scope when `None`): one
    /// by waiter id, or all of them. Returns how many were cancelled;
    /// repeating a cancel returns 0.
    pub fn cancel(&self, scope: Option<&ScopeId>, node_id: &str, waiter_id: Option<&str>) -> usize {
        let removed = {
            let mut waiters = lock(&self.waiters);
            let Some(list) = waiters.get_mut(node_id) else {
                return 0;
            };
            let (removed, kept): (Vec<Waiter>, Vec<Waiter>) =
                std::mem::take(list).into_iter().partition(|w| {
                    scope.map_or(true, |s| &w.scope_id == s)
                        && waiter_id.map_or(true, |id| w.waiter_id == id)
                });
            *list = kept;
            if list.is_empty() {
                waiters.remove(node_id);
            }
            removed
        };

        let cancelled = removed
            .iter()
            .filter(|w| {
                self.dispatcher.settle(
                    &w.waiter_id,
                    Err(FlowlinkError::WaitCancelled {
                        node_id: node_id.to_string(),
                    }),
                )
            })
            .count();
        if cancelled > 0 {
            info!(node_id, cancelled, "Trigger wait cancelled");
        }
        cancelled
    }

    /// Drop bookkeeping for a waiter settled elsewhere (direct response) or
    /// abandoned by its holder.
    pub fn forget(&self, waiter_id: &str) -> bool {
        let mut waiters = lock(&self.waiters);
        let mut found = false;
        waiters.retain(|_, list| {
            list.retain(|w| {
                let matched = w.waiter_id == waiter_id;
                found |= matched;
                !matched
            });
            !list.is_empty()
        });
        found
    }

    /// Forget all waiters. The dispatcher has already rejected their
    /// requests when this runs on connection loss.
    pub fn clear(&self) -> usize {
        let mut waiters = lock(&self.waiters);
        let count = waiters.values().map(Vec::len).sum();
        waiters.clear();
        count
    }

    /// Nodes with at least one live waiter, with the age of the oldest.
    pub fn waiting_nodes(&self) -> Vec<(ScopeId, String, DateTime<Utc>)> {
        let waiters = lock(&self.waiters);
        let mut nodes: Vec<_> = waiters
            .iter()
            .flat_map(|(node, list)| {
                list.iter()
                    .map(move |w| (w.scope_id.clone(), node.clone(), w.registered_at))
            })
            .collect();
        nodes.sort();
        nodes.dedup_by(|a, b| a.0 == b.0 && a.1 == b.1);
        nodes
    }

    pub fn waiter_count(&self) -> usize {
        lock(&self.waiters).values().map(Vec::len).sum()
    }

    fn settle_matching(
        &self,
        scope: Option<&ScopeId>,
        node_id: &str,
        outcome: impl Fn() -> Result<Value>,
    ) -> usize {
        let matched: Vec<Waiter> = {
            let mut waiters = lock(&self.waiters);
            let Some(list) = waiters.get_mut(node_id) else {
                return 0;
            };
            let (matched, kept): (Vec<Waiter>, Vec<Waiter>) = std::mem::take(list)
                .into_iter()
                .partition(|w| scope.map_or(true, |s| &w.scope_id == s));
            *list = kept;
            if list.is_empty() {
                waiters.remove(node_id);
            }
            matched
        };

        let settled = matched
            .iter()
            .filter(|w| self.dispatcher.settle(&w.waiter_id, outcome()))
            .count();
        if settled > 0 {
            debug!(node_id, settled, "Trigger waiters settled");
        }
        settled
    }
}

/// A registered trigger wait. Dropping it withdraws the waiter.
pub struct TriggerWait {
    scope_id: ScopeId,
    node_id: String,
    waiter_id: String,
    pending: Option<PendingResponse>,
    registry: Weak<TriggerWaitRegistry>,
}

impl TriggerWait {
    pub fn scope_id(&self) -> &ScopeId {
        &self.scope_id
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Correlation id of the underlying request; identifies this waiter
    /// for a targeted cancel.
    pub fn waiter_id(&self) -> &str {
        &self.waiter_id
    }

    /// Wait for the trigger to fire. Has no deadline.
    pub async fn wait(mut self) -> Result<Value> {
        match self.pending.take() {
            Some(pending) => pending.recv().await,
            None => Err(FlowlinkError::WaitCancelled {
                node_id: self.node_id.clone(),
            }),
        }
    }
}

impl Drop for TriggerWait {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.forget(&self.waiter_id);
        }
    }
}
