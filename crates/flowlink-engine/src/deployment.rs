use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use flowlink_core::error::{FlowlinkError, Result};
use flowlink_core::event::EventBus;
use flowlink_core::types::{DeploymentState, DeploymentStatus, EngineEvent, ScopeId, ScopeLock};

use crate::store::{ScopePartition, ScopedStateStore};

/// Reason recorded on locks derived from a running deployment.
pub(crate) const DEPLOYMENT_LOCK_REASON: &str = "deployment running";

/// A lifecycle event carried by a `deployment_status` broadcast.
#[derive(Debug, Clone, PartialEq)]
pub enum DeploymentEvent {
    Starting,
    /// `running` or `started`.
    Running { active_runs: Option<u32> },
    RunStarted { active_runs: Option<u32> },
    RunComplete { total_time_ms: Option<u64> },
    Stopped { total_time_ms: Option<u64> },
    Cancelled,
    Failed { error: Option<String> },
}

impl DeploymentEvent {
    pub(crate) fn from_body(body: &Map<String, Value>) -> Result<Self> {
        let name = ["status", "state", "event"]
            .iter()
            .find_map(|key| body.get(*key).and_then(Value::as_str))
            .ok_or_else(|| {
                FlowlinkError::ProtocolViolation("deployment_status carries no status".into())
            })?;

        let active_runs = body
            .get("active_runs")
            .and_then(Value::as_u64)
            .map(|n| u32::try_from(n).unwrap_or(u32::MAX));
        let total_time_ms = ["total_time_ms", "total_time"].iter().find_map(|key| {
            let value = body.get(*key)?;
            value
                .as_u64()
                .or_else(|| value.as_f64().map(|f| f.max(0.0).round() as u64))
        });

        let event = match name {
            "starting" => Self::Starting,
            "running" | "started" => Self::Running { active_runs },
            "run_started" => Self::RunStarted { active_runs },
            "run_complete" => Self::RunComplete { total_time_ms },
            "stopped" => Self::Stopped { total_time_ms },
            "cancelled" => Self::Cancelled,
            "error" => Self::Failed {
                error: match body.get("error") {
                    None | Some(Value::Null) => None,
                    Some(Value::String(s)) => Some(s.clone()),
                    Some(other) => Some(other.to_string()),
                },
            },
            other => {
                return Err(FlowlinkError::ProtocolViolation(format!(
                    "unknown deployment status `{other}`"
                )))
            }
        };
        Ok(event)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running { .. } => "running",
            Self::RunStarted { .. } => "run_started",
            Self::RunComplete { .. } => "run_complete",
            Self::Stopped { .. } => "stopped",
            Self::Cancelled => "cancelled",
            Self::Failed { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Stopped { .. } | Self::Cancelled | Self::Failed { .. }
        )
    }
}

/// Outcome of applying an event to a deployment record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Applied,
    Ignored { reason: String },
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Apply one event to a deployment record.
///
/// `event_scope` is the scope named by the broadcast (if any); `partition`
/// is the scope whose record is being updated. Terminal events naming a
/// scope other than the record's current owner are ignored.
pub(crate) fn transition(
    status: &mut DeploymentStatus,
    event: &DeploymentEvent,
    event_scope: Option<&ScopeId>,
    partition: &ScopeId,
) -> Transition {
    if event.is_terminal() {
        if let (Some(owner), Some(scope)) = (status.scope_id.as_ref(), event_scope) {
            if owner != scope {
                return Transition::Ignored {
                    reason: format!("{} for {scope} but deployment is owned by {owner}", event.name()),
                };
            }
        }
    }

    let owner = || Some(event_scope.unwrap_or(partition).clone());

    match event {
        DeploymentEvent::Starting => {
            status.state = DeploymentState::Starting;
            status.is_running = true;
            status.active_runs = 0;
            status.scope_id = owner();
            status.total_time_ms = None;
            status.error = None;
        }
        DeploymentEvent::Running { active_runs } => {
            status.state = DeploymentState::Running;
            status.is_running = true;
            if let Some(n) = active_runs {
                status.active_runs = *n;
            }
            if status.scope_id.is_none() {
                status.scope_id = owner();
            }
        }
        DeploymentEvent::RunStarted { active_runs } => {
            status.is_running = true;
            if !status.state.is_active() {
                status.state = DeploymentState::Running;
            }
            status.active_runs = active_runs.unwrap_or_else(|| status.active_runs.saturating_add(1));
            if status.scope_id.is_none() {
                status.scope_id = owner();
            }
        }
        DeploymentEvent::RunComplete { total_time_ms } => {
            status.active_runs = status.active_runs.saturating_sub(1);
            if total_time_ms.is_some() {
                status.total_time_ms = *total_time_ms;
            }
        }
        DeploymentEvent::Stopped { total_time_ms } => {
            finish(status, DeploymentState::Stopped);
            if total_time_ms.is_some() {
                status.total_time_ms = *total_time_ms;
            }
        }
        DeploymentEvent::Cancelled => finish(status, DeploymentState::Cancelled),
        DeploymentEvent::Failed { error } => {
            finish(status, DeploymentState::Error);
            status.error = error.clone();
        }
    }
    Transition::Applied
}

fn finish(status: &mut DeploymentStatus, state: DeploymentState) {
    status.state = state;
    status.is_running = false;
    status.active_runs = 0;
    status.scope_id = None;
}

/// Keep the derived lock in line with the deployment. Returns true if the
/// lock changed. Locks set explicitly by the backend are left alone.
pub(crate) fn derive_lock(partition: &mut ScopePartition) -> bool {
    if partition.deployment.is_running && !partition.lock.locked {
        partition.lock = ScopeLock {
            locked: true,
            scope_id: Some(partition.scope_id.clone()),
            locked_at: Some(Utc::now()),
            reason: Some(DEPLOYMENT_LOCK_REASON.to_string()),
        };
        true
    } else if !partition.deployment.is_running
        && partition.lock.locked
        && partition.lock.reason.as_deref() == Some(DEPLOYMENT_LOCK_REASON)
    {
        partition.lock = ScopeLock::default();
        true
    } else {
        false
    }
}

/// Tracks the lifecycle of deployed workflows, one record per scope.
pub struct DeploymentStateMachine {
    store: Arc<ScopedStateStore>,
    events: Arc<EventBus>,
}

impl DeploymentStateMachine {
    pub fn new(store: Arc<ScopedStateStore>, events: Arc<EventBus>) -> Self {
        Self { store, events }
    }

    /// Apply a broadcast event. Unscoped events are applied to the active
    /// scope; with no active scope they are a protocol violation.
    pub fn apply(&self, scope: Option<&ScopeId>, event: &DeploymentEvent) -> Result<Transition> {
        let target = match scope {
            Some(scope) => scope.clone(),
            None => self.store.active_scope().ok_or_else(|| {
                FlowlinkError::ProtocolViolation(format!(
                    "unscoped deployment_status `{}` with no active scope",
                    event.name()
                ))
            })?,
        };

        let (outcome, status, lock) = self.store.with_partition(&target, |partition| {
            let partition_scope = partition.scope_id.clone();
            let outcome = transition(&mut partition.deployment, event, scope, &partition_scope);
            let lock_changed = outcome.is_applied() && derive_lock(partition);
            (
                outcome,
                partition.deployment.clone(),
                lock_changed.then(|| partition.lock.clone()),
            )
        });

        match &outcome {
            Transition::Applied => {
                debug!(
                    scope = %target,
                    event = event.name(),
                    state = %status.state,
                    active_runs = status.active_runs,
                    "Deployment transition"
                );
                self.events.publish(EngineEvent::DeploymentChanged {
                    scope_id: target.clone(),
                    status,
                });
                if let Some(lock) = lock {
                    self.events.publish(EngineEvent::LockChanged {
                        scope_id: target,
                        lock,
                    });
                }
            }
            Transition::Ignored { reason } => {
                warn!(scope = %target, event = event.name(), reason = %reason, "Deployment event ignored");
            }
        }
        Ok(outcome)
    }

    /// Local view of a scope's deployment. May be stale; use an explicit
    /// status fetch when certainty is needed.
    pub fn status(&self, scope: &ScopeId) -> DeploymentStatus {
        self.store.read(scope, |partition| partition.deployment.clone())
    }

    /// Acknowledge a terminal state, returning the record to idle.
    /// Returns false if the deployment was not in a terminal state.
    pub fn acknowledge(&self, scope: &ScopeId) -> bool {
        let status = self.store.with_partition(scope, |partition| {
            if !partition.deployment.state.is_terminal() {
                return None;
            }
            partition.deployment = DeploymentStatus::default();
            Some(partition.deployment.clone())
        });
        match status {
            Some(status) => {
                self.events.publish(EngineEvent::DeploymentChanged {
                    scope_id: scope.clone(),
                    status,
                });
                true
            }
            None => false,
        }
    }

    /// Replace the local record with an authoritative status from the backend.
    pub fn reconcile(&self, scope: &ScopeId, mut authoritative: DeploymentStatus) -> DeploymentStatus {
        normalize(&mut authoritative, scope);
        let (status, lock) = self.store.with_partition(scope, |partition| {
            partition.deployment = authoritative;
            let lock_changed = derive_lock(partition);
            (
                partition.deployment.clone(),
                lock_changed.then(|| partition.lock.clone()),
            )
        });
        self.events.publish(EngineEvent::DeploymentChanged {
            scope_id: scope.clone(),
            status: status.clone(),
        });
        if let Some(lock) = lock {
            self.events.publish(EngineEvent::LockChanged {
                scope_id: scope.clone(),
                lock,
            });
        }
        status
    }
}

/// Make `is_running` and ownership agree with the reported state.
pub(crate) fn normalize(status: &mut DeploymentStatus, scope: &ScopeId) {
    if status.state.is_active() {
        status.is_running = true;
        if status.scope_id.is_none() {
            status.scope_id = Some(scope.clone());
        }
    } else {
        status.is_running = false;
        status.active_runs = 0;
        status.scope_id = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(id: &str) -> ScopeId {
        ScopeId::from(id)
    }

    fn machine() -> (DeploymentStateMachine, Arc<ScopedStateStore>) {
        let store = Arc::new(ScopedStateStore::new());
        let machine = DeploymentStateMachine::new(store.clone(), Arc::new(EventBus::default()));
        (machine, store)
    }

    #[test]
    fn starting_sets_running_and_resets_runs() {
        let mut status = DeploymentStatus {
            active_runs: 4,
            ..Default::default()
        };
        let w1 = scope("w1");
        transition(&mut status, &DeploymentEvent::Starting, Some(&w1), &w1);
        assert_eq!(status.state, DeploymentState::Starting);
        assert!(status.is_running);
        assert_eq!(status.active_runs, 0);
        assert_eq!(status.scope_id, Some(w1));
    }

    #[test]
    fn run_counters_floor_at_zero() {
        let w1 = scope("w1");
        let mut status = DeploymentStatus::default();
        transition(&mut status, &DeploymentEvent::Running { active_runs: None }, Some(&w1), &w1);
        transition(&mut status, &DeploymentEvent::RunStarted { active_runs: None }, Some(&w1), &w1);
        transition(&mut status, &DeploymentEvent::RunStarted { active_runs: None }, Some(&w1), &w1);
        assert_eq!(status.active_runs, 2);

        for _ in 0..3 {
            transition(
                &mut status,
                &DeploymentEvent::RunComplete { total_time_ms: None },
                Some(&w1),
                &w1,
            );
        }
        assert_eq!(status.active_runs, 0);
        assert_eq!(status.state, DeploymentState::Running);
        assert!(status.is_running);
    }

    #[test]
    fn payload_run_count_wins() {
        let w1 = scope("w1");
        let mut status = DeploymentStatus::default();
        transition(
            &mut status,
            &DeploymentEvent::Running { active_runs: Some(5) },
            Some(&w1),
            &w1,
        );
        assert_eq!(status.active_runs, 5);
        transition(
            &mut status,
            &DeploymentEvent::RunStarted { active_runs: Some(9) },
            Some(&w1),
            &w1,
        );
        assert_eq!(status.active_runs, 9);
    }

    #[test]
    fn terminal_for_other_owner_is_ignored() {
        let w1 = scope("w1");
        let w2 = scope("w2");
        let mut status = DeploymentStatus::default();
        transition(&mut status, &DeploymentEvent::Starting, Some(&w1), &w1);

        let outcome = transition(&mut status, &DeploymentEvent::Cancelled, Some(&w2), &w1);
        assert!(!outcome.is_applied());
        assert!(status.is_running);

        // Unscoped terminal events are accepted for backward compatibility.
        let outcome = transition(&mut status, &DeploymentEvent::Cancelled, None, &w1);
        assert!(outcome.is_applied());
        assert!(!status.is_running);
        assert_eq!(status.scope_id, None);
        assert_eq!(status.state, DeploymentState::Cancelled);
    }

    #[test]
    fn failed_records_error() {
        let w1 = scope("w1");
        let mut status = DeploymentStatus::default();
        transition(&mut status, &DeploymentEvent::Starting, Some(&w1), &w1);
        transition(
            &mut status,
            &DeploymentEvent::Failed {
                error: Some("trigger crashed".into()),
            },
            Some(&w1),
            &w1,
        );
        assert_eq!(status.state, DeploymentState::Error);
        assert_eq!(status.error.as_deref(), Some("trigger crashed"));
        assert_eq!(status.active_runs, 0);
    }

    #[test]
    fn terminal_in_one_scope_leaves_other_running() {
        let (machine, _store) = machine();
        let (x, y) = (scope("x"), scope("y"));
        for s in [&x, &y] {
            machine.apply(Some(s), &DeploymentEvent::Starting).unwrap();
            machine
                .apply(Some(s), &DeploymentEvent::Running { active_runs: None })
                .unwrap();
        }

        for terminal in [
            DeploymentEvent::Stopped { total_time_ms: Some(10) },
            DeploymentEvent::Cancelled,
            DeploymentEvent::Failed { error: None },
        ] {
            machine.apply(Some(&x), &terminal).unwrap();
            assert!(!machine.status(&x).is_running);
            assert!(machine.status(&y).is_running);
        }
    }

    #[test]
    fn unscoped_event_needs_active_scope() {
        let (machine, store) = machine();
        let err = machine.apply(None, &DeploymentEvent::Starting).unwrap_err();
        assert!(matches!(err, FlowlinkError::ProtocolViolation(_)));

        store.activate(&scope("w1"));
        machine.apply(None, &DeploymentEvent::Starting).unwrap();
        assert!(machine.status(&scope("w1")).is_running);
    }

    #[test]
    fn running_deployment_derives_lock() {
        let (machine, store) = machine();
        let w1 = scope("w1");
        machine.apply(Some(&w1), &DeploymentEvent::Starting).unwrap();
        let lock = store.read(&w1, |p| p.lock.clone());
        assert!(lock.locked);
        assert_eq!(lock.reason.as_deref(), Some(DEPLOYMENT_LOCK_REASON));

        machine.apply(Some(&w1), &DeploymentEvent::Cancelled).unwrap();
        assert!(!store.read(&w1, |p| p.lock.locked));
    }

    #[test]
    fn acknowledge_returns_terminal_to_idle() {
        let (machine, _store) = machine();
        let w1 = scope("w1");
        assert!(!machine.acknowledge(&w1));
        machine.apply(Some(&w1), &DeploymentEvent::Starting).unwrap();
        assert!(!machine.acknowledge(&w1));
        machine
            .apply(Some(&w1), &DeploymentEvent::Stopped { total_time_ms: None })
            .unwrap();
        assert!(machine.acknowledge(&w1));
        assert_eq!(machine.status(&w1).state, DeploymentState::Idle);
    }

    #[test]
    fn reconcile_normalizes_running_flag() {
        let (machine, _store) = machine();
        let w1 = scope("w1");
        let status = machine.reconcile(
            &w1,
            DeploymentStatus {
                state: DeploymentState::Running,
                active_runs: 2,
                ..Default::default()
            },
        );
        assert!(status.is_running);
        assert_eq!(status.scope_id, Some(w1));
    }

    #[test]
    fn event_decoding() {
        let body = |v: serde_json::Value| v.as_object().unwrap().clone();
        assert_eq!(
            DeploymentEvent::from_body(&body(serde_json::json!({"status": "started", "active_runs": 3})))
                .unwrap(),
            DeploymentEvent::Running { active_runs: Some(3) }
        );
        assert_eq!(
            DeploymentEvent::from_body(&body(serde_json::json!({"state": "stopped", "total_time": 12.6})))
                .unwrap(),
            DeploymentEvent::Stopped { total_time_ms: Some(13) }
        );
        assert!(DeploymentEvent::from_body(&body(serde_json::json!({"status": "paused"}))).is_err());
    }
}
