use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use flowlink_core::types::{DeploymentStatus, NodeStatus, ScopeId, ScopeLock};

use crate::deployment::{derive_lock, normalize};
use crate::lock;
use crate::protocol::{StatusSnapshot, VariableUpdate};

/// State of one workflow. No operation on one partition reads or writes
/// another.
#[derive(Debug, Clone, Serialize)]
pub struct ScopePartition {
    pub scope_id: ScopeId,
    pub node_statuses: HashMap<String, NodeStatus>,
    pub variables: Map<String, Value>,
    pub deployment: DeploymentStatus,
    pub lock: ScopeLock,
    /// Set when events for this scope may have been missed.
    pub stale: bool,
    pub last_resync: Option<DateTime<Utc>>,
    #[serde(skip)]
    access_tick: u64,
}

impl ScopePartition {
    pub fn new(scope_id: ScopeId) -> Self {
        Self {
            scope_id,
            node_statuses: HashMap::new(),
            variables: Map::new(),
            deployment: DeploymentStatus::default(),
            lock: ScopeLock::default(),
            stale: false,
            last_resync: None,
            access_tick: 0,
        }
    }
}

/// Per-scope state, keyed by workflow id, plus the active scope marker.
///
/// Partitions are created lazily on first touch and are never implicitly
/// discarded; `evict_lru` is the only way a partition goes away.
pub struct ScopedStateStore {
    partitions: Mutex<HashMap<ScopeId, ScopePartition>>,
    active: Mutex<Option<ScopeId>>,
    tick: AtomicU64,
}

impl ScopedStateStore {
    pub fn new() -> Self {
        Self {
            partitions: Mutex::new(HashMap::new()),
            active: Mutex::new(None),
            tick: AtomicU64::new(0),
        }
    }

    /// Run `f` against a scope's partition, creating it if needed.
    pub fn with_partition<R>(&self, scope: &ScopeId, f: impl FnOnce(&mut ScopePartition) -> R) -> R {
        let tick = self.tick.fetch_add(1, Ordering::Relaxed);
        let mut partitions = lock(&self.partitions);
        let partition = partitions
            .entry(scope.clone())
            .or_insert_with(|| ScopePartition::new(scope.clone()));
        partition.access_tick = tick;
        f(partition)
    }

    /// Read a scope's partition without creating it. Unknown scopes read
    /// as an empty partition.
    pub fn read<R>(&self, scope: &ScopeId, f: impl FnOnce(&ScopePartition) -> R) -> R {
        let partitions = lock(&self.partitions);
        match partitions.get(scope) {
            Some(partition) => f(partition),
            None => f(&ScopePartition::new(scope.clone())),
        }
    }

    pub fn contains(&self, scope: &ScopeId) -> bool {
        lock(&self.partitions).contains_key(scope)
    }

    pub fn snapshot(&self, scope: &ScopeId) -> ScopePartition {
        self.read(scope, ScopePartition::clone)
    }

    pub fn node_status(&self, scope: &ScopeId, node_id: &str) -> Option<NodeStatus> {
        self.read(scope, |p| p.node_statuses.get(node_id).cloned())
    }

    /// Replace a node's status wholesale.
    pub fn set_node_status(&self, scope: &ScopeId, node_id: &str, status: NodeStatus) {
        self.with_partition(scope, |p| {
            p.node_statuses.insert(node_id.to_string(), status);
        });
    }

    /// Remove node statuses: the listed nodes, or all of them when `nodes`
    /// is `None`. Returns how many were removed.
    pub fn clear_node_statuses(&self, scope: &ScopeId, nodes: Option<&[String]>) -> usize {
        self.with_partition(scope, |p| match nodes {
            None => {
                let cleared = p.node_statuses.len();
                p.node_statuses.clear();
                cleared
            }
            Some(nodes) => nodes
                .iter()
                .filter(|node| p.node_statuses.remove(node.as_str()).is_some())
                .count(),
        })
    }

    /// Merge a variable update into the scope.
    pub fn apply_variables(&self, scope: &ScopeId, update: &VariableUpdate) {
        self.with_partition(scope, |p| {
            for (name, value) in &update.set {
                p.variables.insert(name.clone(), value.clone());
            }
            for name in &update.removed {
                p.variables.remove(name);
            }
        });
    }

    pub fn set_lock(&self, scope: &ScopeId, lock: ScopeLock) {
        self.with_partition(scope, |p| p.lock = lock);
    }

    /// Make `scope` the active scope and return the previous one.
    ///
    /// Switching to a different scope marks it stale: broadcasts received
    /// while it was inactive were stored, but anything sent before the
    /// client first saw it was not.
    pub fn activate(&self, scope: &ScopeId) -> Option<ScopeId> {
        let previous = lock(&self.active).replace(scope.clone());
        let switched = previous.as_ref() != Some(scope);
        self.with_partition(scope, |p| {
            if switched {
                p.stale = true;
            }
        });
        previous
    }

    pub fn active_scope(&self) -> Option<ScopeId> {
        lock(&self.active).clone()
    }

    pub fn is_stale(&self, scope: &ScopeId) -> bool {
        self.read(scope, |p| p.stale)
    }

    /// Mark every partition stale. Called when the transport drops, since
    /// broadcasts sent while disconnected are lost.
    pub fn mark_all_stale(&self) {
        for partition in lock(&self.partitions).values_mut() {
            partition.stale = true;
        }
    }

    /// Replace a scope's state with an authoritative snapshot.
    pub fn apply_snapshot(&self, scope: &ScopeId, snapshot: StatusSnapshot) {
        self.with_partition(scope, |p| {
            p.node_statuses = snapshot.node_statuses;
            p.variables = snapshot.variables;
            p.deployment = snapshot.deployment.unwrap_or_default();
            normalize(&mut p.deployment, scope);
            match snapshot.lock {
                Some(lock) => p.lock = lock,
                None => {
                    p.lock = ScopeLock::default();
                    derive_lock(p);
                }
            }
            p.stale = false;
            p.last_resync = Some(Utc::now());
        });
    }

    pub fn scopes(&self) -> Vec<ScopeId> {
        let mut scopes: Vec<ScopeId> = lock(&self.partitions).keys().cloned().collect();
        scopes.sort();
        scopes
    }

    /// Drop least-recently-used partitions until at most `keep` remain.
    /// The active scope and scopes with a running deployment are never
    /// evicted. Returns the evicted scopes.
    pub fn evict_lru(&self, keep: usize) -> Vec<ScopeId> {
        let active = self.active_scope();
        let mut partitions = lock(&self.partitions);
        if partitions.len() <= keep {
            return Vec::new();
        }

        let mut candidates: Vec<(u64, ScopeId)> = partitions
            .values()
            .filter(|p| Some(&p.scope_id) != active.as_ref() && !p.deployment.is_running)
            .map(|p| (p.access_tick, p.scope_id.clone()))
            .collect();
        candidates.sort();

        let excess = partitions.len() - keep;
        candidates
            .into_iter()
            .take(excess)
            .map(|(_, scope)| {
                partitions.remove(&scope);
                scope
            })
            .collect()
    }
}

impl Default for ScopedStateStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Live, read-only accessor for one scope.
#[derive(Clone)]
pub struct ScopeView {
    store: Arc<ScopedStateStore>,
    scope: ScopeId,
}

impl ScopeView {
    pub(crate) fn new(store: Arc<ScopedStateStore>, scope: ScopeId) -> Self {
        Self { store, scope }
    }

    pub fn scope_id(&self) -> &ScopeId {
        &self.scope
    }

    pub fn node_status(&self, node_id: &str) -> Option<NodeStatus> {
        self.store.node_status(&self.scope, node_id)
    }

    pub fn node_statuses(&self) -> HashMap<String, NodeStatus> {
        self.store.read(&self.scope, |p| p.node_statuses.clone())
    }

    pub fn variables(&self) -> Map<String, Value> {
        self.store.read(&self.scope, |p| p.variables.clone())
    }

    pub fn variable(&self, name: &str) -> Option<Value> {
        self.store.read(&self.scope, |p| p.variables.get(name).cloned())
    }

    pub fn deployment(&self) -> DeploymentStatus {
        self.store.read(&self.scope, |p| p.deployment.clone())
    }

    pub fn lock(&self) -> ScopeLock {
        self.store.read(&self.scope, |p| p.lock.clone())
    }

    pub fn is_stale(&self) -> bool {
        self.store.is_stale(&self.scope)
    }

    pub fn snapshot(&self) -> ScopePartition {
        self.store.snapshot(&self.scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowlink_core::types::{DeploymentState, ExecutionState};
    use serde_json::json;

    fn scope(id: &str) -> ScopeId {
        ScopeId::from(id)
    }

    #[test]
    fn partitions_are_isolated() {
        let store = ScopedStateStore::new();
        let (x, y) = (scope("x"), scope("y"));
        store.set_node_status(&x, "n1", NodeStatus::new(ExecutionState::Success, json!(1)));
        store.set_node_status(&y, "n1", NodeStatus::new(ExecutionState::Error, json!(2)));

        assert_eq!(store.node_status(&x, "n1").unwrap().status, ExecutionState::Success);
        assert_eq!(store.node_status(&y, "n1").unwrap().status, ExecutionState::Error);

        assert_eq!(store.clear_node_statuses(&x, None), 1);
        assert!(store.node_status(&x, "n1").is_none());
        assert!(store.node_status(&y, "n1").is_some());
    }

    #[test]
    fn read_does_not_create_partition() {
        let store = ScopedStateStore::new();
        assert!(store.node_status(&scope("ghost"), "n1").is_none());
        assert!(!store.contains(&scope("ghost")));
    }

    #[test]
    fn selective_clear_counts_removed() {
        let store = ScopedStateStore::new();
        let x = scope("x");
        for node in ["a", "b", "c"] {
            store.set_node_status(&x, node, NodeStatus::new(ExecutionState::Success, Value::Null));
        }
        let cleared = store.clear_node_statuses(&x, Some(&["a".to_string(), "zz".to_string()]));
        assert_eq!(cleared, 1);
        assert_eq!(store.snapshot(&x).node_statuses.len(), 2);
    }

    #[test]
    fn variables_merge_and_remove() {
        let store = ScopedStateStore::new();
        let x = scope("x");
        let mut update = VariableUpdate::default();
        update.set.insert("a".into(), json!(1));
        update.set.insert("b".into(), json!("two"));
        store.apply_variables(&x, &update);

        let update = VariableUpdate {
            set: Map::new(),
            removed: vec!["a".into()],
        };
        store.apply_variables(&x, &update);

        let vars = store.snapshot(&x).variables;
        assert_eq!(vars.len(), 1);
        assert_eq!(vars["b"], "two");
    }

    #[test]
    fn activation_marks_new_scope_stale() {
        let store = ScopedStateStore::new();
        assert_eq!(store.activate(&scope("a")), None);
        assert!(store.is_stale(&scope("a")));

        store.apply_snapshot(&scope("a"), StatusSnapshot::default());
        assert!(!store.is_stale(&scope("a")));

        // Re-activating the same scope is not a switch.
        assert_eq!(store.activate(&scope("a")), Some(scope("a")));
        assert!(!store.is_stale(&scope("a")));

        assert_eq!(store.activate(&scope("b")), Some(scope("a")));
        assert_eq!(store.active_scope(), Some(scope("b")));
    }

    #[test]
    fn snapshot_replaces_state_and_derives_lock() {
        let store = ScopedStateStore::new();
        let x = scope("x");
        store.set_node_status(&x, "old", NodeStatus::new(ExecutionState::Error, Value::Null));

        let snapshot = StatusSnapshot::from_response(json!({
            "node_statuses": {"n1": {"status": "success"}},
            "variables": {"v": 1},
            "deployment": {"status": "running", "active_runs": 1}
        }))
        .unwrap();
        store.apply_snapshot(&x, snapshot);

        let p = store.snapshot(&x);
        assert!(p.node_statuses.contains_key("n1"));
        assert!(!p.node_statuses.contains_key("old"));
        assert_eq!(p.deployment.state, DeploymentState::Running);
        assert!(p.deployment.is_running);
        assert!(p.lock.locked);
        assert!(p.last_resync.is_some());
    }

    #[test]
    fn eviction_spares_active_and_running() {
        let store = ScopedStateStore::new();
        for id in ["a", "b", "c", "d"] {
            store.set_node_status(&scope(id), "n", NodeStatus::new(ExecutionState::Idle, Value::Null));
        }
        store.activate(&scope("a"));
        store.with_partition(&scope("b"), |p| p.deployment.is_running = true);

        let evicted = store.evict_lru(2);
        assert_eq!(evicted, vec![scope("c"), scope("d")]);
        assert_eq!(store.scopes(), vec![scope("a"), scope("b")]);

        assert!(store.evict_lru(0).is_empty());
    }

    #[test]
    fn connection_loss_marks_everything_stale() {
        let store = ScopedStateStore::new();
        store.apply_snapshot(&scope("a"), StatusSnapshot::default());
        store.apply_snapshot(&scope("b"), StatusSnapshot::default());
        store.mark_all_stale();
        assert!(store.is_stale(&scope("a")));
        assert!(store.is_stale(&scope("b")));
    }
}
