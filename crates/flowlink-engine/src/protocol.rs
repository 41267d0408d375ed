use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};

use flowlink_core::error::{FlowlinkError, Result};
use flowlink_core::types::{DeploymentStatus, NodeStatus, ScopeId, ScopeLock};

use crate::deployment::DeploymentEvent;

/// Keepalive frame sent on every keepalive tick.
pub(crate) const PING_FRAME: &str = r#"{"type":"ping"}"#;

/// Operations understood by the execution backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Full status snapshot of one workflow (resync).
    GetStatus,
    ExecuteNode,
    ExecuteWorkflow,
    StopExecution,
    DeployWorkflow,
    CancelDeployment,
    GetDeploymentStatus,
    /// Arm a trigger node and wait for its next activation.
    WaitForTrigger,
    CancelEventWait,
}

impl Operation {
    pub const ALL: [Operation; 9] = [
        Operation::GetStatus,
        Operation::ExecuteNode,
        Operation::ExecuteWorkflow,
        Operation::StopExecution,
        Operation::DeployWorkflow,
        Operation::CancelDeployment,
        Operation::GetDeploymentStatus,
        Operation::WaitForTrigger,
        Operation::CancelEventWait,
    ];

    /// Wire name used in the `type` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GetStatus => "get_status",
            Self::ExecuteNode => "execute_node",
            Self::ExecuteWorkflow => "execute_workflow",
            Self::StopExecution => "stop_execution",
            Self::DeployWorkflow => "deploy_workflow",
            Self::CancelDeployment => "cancel_deployment",
            Self::GetDeploymentStatus => "get_deployment_status",
            Self::WaitForTrigger => "wait_for_trigger",
            Self::CancelEventWait => "cancel_event_wait",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.as_str() == name)
    }

    /// Trigger-class operations await an external event rather than a
    /// synchronous reply, and are the only ones allowed to run without a
    /// deadline.
    pub fn is_trigger_class(&self) -> bool {
        matches!(self, Self::WaitForTrigger)
    }

    /// Fields that must be present in the request payload.
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            Self::ExecuteNode | Self::WaitForTrigger => &["workflow_id", "node_id"],
            Self::CancelEventWait => &["node_id"],
            _ => &["workflow_id"],
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deadline policy of a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Timeout {
    /// Use the dispatcher's configured default (30s unless configured).
    #[default]
    Default,
    After(Duration),
    /// No deadline. Only valid for trigger-class operations.
    Never,
}

impl Timeout {
    /// Resolve to a concrete deadline (`None` = wait forever).
    pub fn resolve(self, operation: Operation, default: Duration) -> Result<Option<Duration>> {
        match self {
            Self::Default => Ok(Some(default)),
            Self::After(d) if d.is_zero() => Err(FlowlinkError::InvalidRequest(format!(
                "{operation}: timeout must be a positive duration"
            ))),
            Self::After(d) => Ok(Some(d)),
            Self::Never if operation.is_trigger_class() => Ok(None),
            Self::Never => Err(FlowlinkError::InvalidRequest(format!(
                "{operation}: only trigger operations may wait without a deadline"
            ))),
        }
    }
}

/// Serialize an outbound request frame.
pub(crate) fn encode_request(operation: Operation, request_id: &str, fields: Map<String, Value>) -> String {
    let mut frame = Map::with_capacity(fields.len() + 2);
    frame.insert("type".into(), Value::String(operation.as_str().into()));
    frame.insert("request_id".into(), Value::String(request_id.into()));
    for (key, value) in fields {
        if key == "type" || key == "request_id" {
            continue;
        }
        frame.insert(key, value);
    }
    Value::Object(frame).to_string()
}

/// A decoded inbound frame. Transient: dropped after dispatch.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub frame_type: Option<String>,
    pub request_id: Option<String>,
    pub workflow_id: Option<ScopeId>,
    pub node_id: Option<String>,
    pub body: Map<String, Value>,
}

impl InboundFrame {
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| FlowlinkError::ProtocolViolation(format!("malformed frame: {e}")))?;
        let Value::Object(body) = value else {
            return Err(FlowlinkError::ProtocolViolation(
                "frame is not a JSON object".into(),
            ));
        };

        Ok(Self {
            frame_type: string_field(&body, "type")?,
            request_id: string_field(&body, "request_id")?,
            workflow_id: string_field(&body, "workflow_id")?.map(ScopeId),
            node_id: string_field(&body, "node_id")?,
            body,
        })
    }

    /// The frame body as a JSON value.
    pub fn payload(&self) -> Value {
        Value::Object(self.body.clone())
    }
}

/// Read an optional string field; empty strings count as absent.
fn string_field(body: &Map<String, Value>, key: &str) -> Result<Option<String>> {
    match body.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(FlowlinkError::ProtocolViolation(format!(
            "field `{key}` must be a string, got {other}"
        ))),
    }
}

/// Whether a broadcast type must carry a `workflow_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeRequirement {
    Required,
    /// Accepted with or without a scope (backward compatibility).
    Optional,
    Unscoped,
}

/// Declared broadcast types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastKind {
    ExecutionStatus,
    NodeOutput,
    DeploymentStatus,
    VariableUpdate,
    WorkflowLock,
    Pong,
}

impl BroadcastKind {
    pub fn from_type(frame_type: &str) -> Option<Self> {
        match frame_type {
            "execution_status" => Some(Self::ExecutionStatus),
            "node_output" => Some(Self::NodeOutput),
            "deployment_status" => Some(Self::DeploymentStatus),
            "variable_update" => Some(Self::VariableUpdate),
            "workflow_lock" => Some(Self::WorkflowLock),
            "pong" => Some(Self::Pong),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExecutionStatus => "execution_status",
            Self::NodeOutput => "node_output",
            Self::DeploymentStatus => "deployment_status",
            Self::VariableUpdate => "variable_update",
            Self::WorkflowLock => "workflow_lock",
            Self::Pong => "pong",
        }
    }

    pub fn scope_requirement(&self) -> ScopeRequirement {
        match self {
            Self::ExecutionStatus | Self::VariableUpdate | Self::WorkflowLock => {
                ScopeRequirement::Required
            }
            Self::NodeOutput | Self::DeploymentStatus => ScopeRequirement::Optional,
            Self::Pong => ScopeRequirement::Unscoped,
        }
    }
}

/// Variable changes carried by a `variable_update` broadcast.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VariableUpdate {
    pub set: Map<String, Value>,
    pub removed: Vec<String>,
}

impl VariableUpdate {
    fn from_body(body: &Map<String, Value>) -> Result<Self> {
        let mut update = Self::default();
        if let Some(vars) = body.get("variables") {
            let Value::Object(vars) = vars else {
                return Err(FlowlinkError::ProtocolViolation(
                    "variable_update `variables` must be an object".into(),
                ));
            };
            for (name, value) in vars {
                if value.is_null() {
                    update.removed.push(name.clone());
                } else {
                    update.set.insert(name.clone(), value.clone());
                }
            }
        } else if let Some(name) = string_field(body, "name")? {
            match body.get("value") {
                None | Some(Value::Null) => update.removed.push(name),
                Some(value) => {
                    update.set.insert(name, value.clone());
                }
            }
        } else {
            return Err(FlowlinkError::ProtocolViolation(
                "variable_update carries neither `variables` nor `name`".into(),
            ));
        }
        Ok(update)
    }

    /// Names touched by this update.
    pub fn names(&self) -> Vec<String> {
        self.set
            .keys()
            .cloned()
            .chain(self.removed.iter().cloned())
            .collect()
    }
}

/// A typed broadcast. Each variant has exactly one handler in the router.
#[derive(Debug, Clone)]
pub enum Broadcast {
    ExecutionStatus {
        scope_id: ScopeId,
        node_id: String,
        status: NodeStatus,
        payload: Value,
    },
    NodeOutput {
        scope_id: Option<ScopeId>,
        node_id: String,
        payload: Value,
    },
    DeploymentStatus {
        scope_id: Option<ScopeId>,
        event: DeploymentEvent,
    },
    VariableUpdate {
        scope_id: ScopeId,
        update: VariableUpdate,
    },
    WorkflowLock {
        scope_id: ScopeId,
        lock: ScopeLock,
    },
    Pong,
    Unknown {
        frame_type: String,
    },
}

impl Broadcast {
    pub fn from_frame(frame: InboundFrame) -> Result<Self> {
        let Some(frame_type) = frame.frame_type else {
            return Err(FlowlinkError::ProtocolViolation(
                "frame has neither a live request_id nor a type".into(),
            ));
        };
        let Some(kind) = BroadcastKind::from_type(&frame_type) else {
            return Ok(Self::Unknown { frame_type });
        };

        let scope_id = frame.workflow_id;
        let required_scope = |scope: Option<ScopeId>| {
            scope.ok_or_else(|| {
                FlowlinkError::ProtocolViolation(format!(
                    "{frame_type} broadcast is missing workflow_id"
                ))
            })
        };
        let required_node = |node: Option<String>| {
            node.ok_or_else(|| {
                FlowlinkError::ProtocolViolation(format!("{frame_type} broadcast is missing node_id"))
            })
        };

        let body = frame.body;
        match kind {
            BroadcastKind::ExecutionStatus => {
                let scope_id = required_scope(scope_id)?;
                let node_id = required_node(frame.node_id)?;
                let payload = Value::Object(body);
                let status = NodeStatus::deserialize(&payload).map_err(|e| {
                    FlowlinkError::ProtocolViolation(format!("invalid execution_status: {e}"))
                })?;
                Ok(Self::ExecutionStatus {
                    scope_id,
                    node_id,
                    status,
                    payload,
                })
            }
            BroadcastKind::NodeOutput => Ok(Self::NodeOutput {
                scope_id,
                node_id: required_node(frame.node_id)?,
                payload: Value::Object(body),
            }),
            BroadcastKind::DeploymentStatus => Ok(Self::DeploymentStatus {
                scope_id,
                event: DeploymentEvent::from_body(&body)?,
            }),
            BroadcastKind::VariableUpdate => Ok(Self::VariableUpdate {
                scope_id: required_scope(scope_id)?,
                update: VariableUpdate::from_body(&body)?,
            }),
            BroadcastKind::WorkflowLock => {
                let scope_id = required_scope(scope_id)?;
                let mut lock = ScopeLock::deserialize(&Value::Object(body)).map_err(|e| {
                    FlowlinkError::ProtocolViolation(format!("invalid workflow_lock: {e}"))
                })?;
                if lock.locked && lock.locked_at.is_none() {
                    lock.locked_at = Some(chrono::Utc::now());
                }
                if !lock.locked {
                    lock.locked_at = None;
                }
                lock.scope_id = Some(scope_id.clone());
                Ok(Self::WorkflowLock { scope_id, lock })
            }
            BroadcastKind::Pong => Ok(Self::Pong),
        }
    }
}

/// Response body of `get_status`: the authoritative state of one scope.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusSnapshot {
    #[serde(default)]
    pub workflow_id: Option<ScopeId>,
    #[serde(default, alias = "nodes")]
    pub node_statuses: HashMap<String, NodeStatus>,
    #[serde(default)]
    pub variables: Map<String, Value>,
    #[serde(default)]
    pub deployment: Option<DeploymentStatus>,
    #[serde(default)]
    pub lock: Option<ScopeLock>,
}

impl StatusSnapshot {
    pub fn from_response(response: Value) -> Result<Self> {
        serde_json::from_value(response)
            .map_err(|e| FlowlinkError::ProtocolViolation(format!("invalid status snapshot: {e}")))
    }
}
