use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowlinkError {
    // Transport errors
    #[error("Connection lost while the request was pending")]
    ConnectionLost,

    #[error("Not connected to the execution backend")]
    NotConnected,

    #[error("Transport error: {0}")]
    Transport(String),

    // Request errors
    #[error("Request timed out after {timeout_ms}ms: {operation}")]
    RequestTimeout { operation: String, timeout_ms: u64 },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Server reported error: {message}")]
    ServerReported {
        message: String,
        payload: serde_json::Value,
    },

    // Trigger waits
    #[error("Trigger wait cancelled for node {node_id}")]
    WaitCancelled { node_id: String },

    // Protocol errors
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FlowlinkError {
    /// Whether a caller may reasonably retry the operation after this error.
    /// The engine itself never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLost | Self::NotConnected | Self::RequestTimeout { .. }
        )
    }

    /// Build a `ServerReported` error from a response body carrying an `error` field.
    pub fn server_reported(payload: serde_json::Value) -> Self {
        let message = match &payload["error"] {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Object(obj) => obj
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| payload["error"].to_string()),
            other => other.to_string(),
        };
        Self::ServerReported { message, payload }
    }
}

pub type Result<T> = std::result::Result<T, FlowlinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_reported_message_from_string() {
        let err = FlowlinkError::server_reported(serde_json::json!({"error": "node not found"}));
        assert_eq!(err.to_string(), "Server reported error: node not found");
    }

    #[test]
    fn server_reported_message_from_object() {
        let err = FlowlinkError::server_reported(serde_json::json!({
            "error": {"code": 404, "message": "workflow missing"}
        }));
        match err {
            FlowlinkError::ServerReported { message, payload } => {
                assert_eq!(message, "workflow missing");
                assert_eq!(payload["error"]["code"], 404);
            }
            other => panic!("expected ServerReported, got {other:?}"),
        }
    }

    #[test]
    fn retryable_classes() {
        assert!(FlowlinkError::ConnectionLost.is_retryable());
        assert!(FlowlinkError::RequestTimeout {
            operation: "get_status".into(),
            timeout_ms: 10
        }
        .is_retryable());
        assert!(!FlowlinkError::WaitCancelled { node_id: "n1".into() }.is_retryable());
        assert!(!FlowlinkError::ProtocolViolation("bad".into()).is_retryable());
    }
}
