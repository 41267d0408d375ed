use std::collections::HashMap;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use flowlink_core::error::Result;
use flowlink_core::types::ScopeId;
use flowlink_engine::SyncEngine;

/// How long to wait for the engine to reconnect before giving up.
const RECONNECT_WAIT: Duration = Duration::from_secs(300);

struct Subscription {
    scope: ScopeId,
    node_id: String,
    params: Map<String, Value>,
}

/// A trigger activation.
pub struct Firing {
    pub scope: ScopeId,
    pub node_id: String,
    pub payload: Value,
}

/// Trigger waits that outlive the connection.
///
/// The engine rejects trigger waits when the transport drops. This list
/// remembers what was armed and registers it again once the engine is
/// connected, and re-arms a node after each activation.
pub struct TriggerSubscriptions {
    engine: SyncEngine,
    entries: Vec<Subscription>,
    armed: FuturesUnordered<BoxFuture<'static, (usize, Result<Value>)>>,
    waiters: HashMap<usize, String>,
}

impl TriggerSubscriptions {
    pub fn new(engine: SyncEngine) -> Self {
        Self {
            engine,
            entries: Vec::new(),
            armed: FuturesUnordered::new(),
            waiters: HashMap::new(),
        }
    }

    pub fn add(&mut self, scope: ScopeId, node_id: String, params: Map<String, Value>) {
        self.entries.push(Subscription {
            scope,
            node_id,
            params,
        });
    }

    /// Register every subscription on the current connection.
    pub fn arm_all(&mut self) -> Result<()> {
        for index in 0..self.entries.len() {
            self.arm(index)?;
        }
        Ok(())
    }

    /// Wait for the next activation of any subscribed node.
    pub async fn next(&mut self) -> anyhow::Result<Firing> {
        loop {
            if self.armed.is_empty() {
                self.rearm().await?;
                continue;
            }
            let Some((index, outcome)) = self.armed.next().await else {
                continue;
            };
            self.waiters.remove(&index);

            match outcome {
                Ok(payload) => {
                    if let Err(e) = self.arm(index) {
                        if !e.is_retryable() {
                            return Err(e.into());
                        }
                        debug!(error = %e, "Deferring re-arm until reconnect");
                    }
                    let entry = &self.entries[index];
                    return Ok(Firing {
                        scope: entry.scope.clone(),
                        node_id: entry.node_id.clone(),
                        payload,
                    });
                }
                Err(e) if e.is_retryable() => {
                    let entry = &self.entries[index];
                    warn!(node_id = %entry.node_id, error = %e, "Trigger wait interrupted");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Cancel every armed wait, locally and on the backend.
    pub async fn cancel_all(&mut self) {
        // Armed futures own the waits; cancel before dropping them so the
        // waiters are still registered.
        for (index, waiter_id) in std::mem::take(&mut self.waiters) {
            let entry = &self.entries[index];
            if let Err(e) = self
                .engine
                .cancel_trigger_wait(&entry.scope, &entry.node_id, Some(&waiter_id))
                .await
            {
                warn!(node_id = %entry.node_id, error = %e, "Failed to cancel trigger wait");
            }
        }
        self.armed.clear();
    }

    async fn rearm(&mut self) -> anyhow::Result<()> {
        self.engine.wait_connected(RECONNECT_WAIT).await?;
        match self.arm_all() {
            Ok(()) => {
                info!(count = self.entries.len(), "Trigger waits registered");
                Ok(())
            }
            Err(e) if e.is_retryable() => {
                // Dropped again before every node was armed; start over.
                self.armed.clear();
                self.waiters.clear();
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn arm(&mut self, index: usize) -> Result<()> {
        let entry = &self.entries[index];
        let wait = self
            .engine
            .wait_for_trigger(&entry.scope, &entry.node_id, entry.params.clone())?;
        self.waiters.insert(index, wait.waiter_id().to_string());
        self.armed
            .push(Box::pin(async move { (index, wait.wait().await) }));
        Ok(())
    }
}
