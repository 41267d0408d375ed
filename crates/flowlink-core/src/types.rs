use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a scope: one workflow's isolated state partition.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeId(pub String);

impl ScopeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ScopeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ScopeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for ScopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Execution state of a single node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    #[default]
    Idle,
    #[serde(alias = "running")]
    Executing,
    Success,
    Error,
    Waiting,
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Executing => "executing",
            Self::Success => "success",
            Self::Error => "error",
            Self::Waiting => "waiting",
        };
        f.write_str(s)
    }
}

/// Last reported status of a node. Replaced wholesale on every update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub status: ExecutionState,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_ref: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl NodeStatus {
    pub fn new(status: ExecutionState, data: serde_json::Value) -> Self {
        Self {
            status,
            data,
            output_ref: None,
            timestamp: Utc::now(),
        }
    }
}

/// Lifecycle state of a deployed (continuously triggered) workflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentState {
    #[default]
    Idle,
    Starting,
    #[serde(alias = "started")]
    Running,
    Stopped,
    Cancelled,
    Error,
}

impl DeploymentState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Cancelled | Self::Error)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

impl std::fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Deployment record of one scope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentStatus {
    #[serde(default, alias = "status")]
    pub state: DeploymentState,
    #[serde(default)]
    pub is_running: bool,
    #[serde(default)]
    pub active_runs: u32,
    /// Scope that owns this record while a deployment is live.
    #[serde(default, alias = "workflow_id", skip_serializing_if = "Option::is_none")]
    pub scope_id: Option<ScopeId>,
    #[serde(default, alias = "total_time", skip_serializing_if = "Option::is_none")]
    pub total_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Edit lock on a scope, held while a deployment runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopeLock {
    #[serde(default)]
    pub locked: bool,
    #[serde(default, alias = "workflow_id", skip_serializing_if = "Option::is_none")]
    pub scope_id: Option<ScopeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Observable state of the transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Open { generation: u64 },
    /// Closed on purpose; no reconnect is scheduled.
    Closed,
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }
}

/// Events published by the engine to its consumers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A new transport was opened. Trigger waits must be re-registered.
    Connected { generation: u64 },
    /// The transport closed; all pending requests were rejected.
    Disconnected {
        generation: u64,
        intentional: bool,
        rejected_requests: usize,
    },
    NodeStatusChanged {
        scope_id: ScopeId,
        node_id: String,
        status: NodeStatus,
    },
    NodeStatusesCleared { scope_id: ScopeId, cleared: usize },
    VariablesChanged {
        scope_id: ScopeId,
        names: Vec<String>,
    },
    DeploymentChanged {
        scope_id: ScopeId,
        status: DeploymentStatus,
    },
    LockChanged { scope_id: ScopeId, lock: ScopeLock },
    ScopeActivated {
        scope_id: ScopeId,
        previous: Option<ScopeId>,
    },
    ScopeResynced { scope_id: ScopeId },
    ProtocolViolation { reason: String },
}

impl EngineEvent {
    /// Scope the event belongs to, if any.
    pub fn scope_id(&self) -> Option<&ScopeId> {
        match self {
            Self::NodeStatusChanged { scope_id, .. }
            | Self::NodeStatusesCleared { scope_id, .. }
            | Self::VariablesChanged { scope_id, .. }
            | Self::DeploymentChanged { scope_id, .. }
            | Self::LockChanged { scope_id, .. }
            | Self::ScopeActivated { scope_id, .. }
            | Self::ScopeResynced { scope_id } => Some(scope_id),
            Self::Connected { .. } | Self::Disconnected { .. } | Self::ProtocolViolation { .. } => {
                None
            }
        }
    }
}
