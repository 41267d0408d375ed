use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use flowlink_core::error::{FlowlinkError, Result};
use flowlink_core::types::ConnectionState;

use crate::lock;
use crate::protocol::{encode_request, Operation, Timeout};

/// Runs on the connection task when a successful response arrives, before
/// any later frame is routed. Its result replaces the response.
pub type ResponseHook = Box<dyn FnOnce(Value) -> Result<Value> + Send>;

struct PendingRequest {
    operation: Operation,
    sender: oneshot::Sender<Result<Value>>,
    sent_at: DateTime<Utc>,
    on_response: Option<ResponseHook>,
}

/// Multiplexes requests over the single transport.
///
/// Every request gets a fresh correlation id and an entry in the pending
/// map. An entry is settled exactly once: whoever removes it from the map
/// (response, timeout, connection loss, cancellation) delivers the outcome.
pub struct RequestDispatcher {
    pending: Mutex<HashMap<String, PendingRequest>>,
    outbound: mpsc::UnboundedSender<String>,
    connection: watch::Receiver<ConnectionState>,
    default_timeout: Duration,
    counter: AtomicU64,
}

impl RequestDispatcher {
    pub fn new(
        outbound: mpsc::UnboundedSender<String>,
        connection: watch::Receiver<ConnectionState>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            outbound,
            connection,
            default_timeout,
            counter: AtomicU64::new(0),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Register a request and queue its frame. The returned handle resolves
    /// with the response, a timeout, or a connection-loss rejection.
    pub fn start(
        self: &Arc<Self>,
        operation: Operation,
        fields: Map<String, Value>,
        timeout: Timeout,
    ) -> Result<PendingResponse> {
        self.start_inner(operation, fields, timeout, None)
    }

    /// Like `start`, but `on_response` is applied to a successful response
    /// in frame order, so state it writes cannot overtake later broadcasts.
    pub fn start_with(
        self: &Arc<Self>,
        operation: Operation,
        fields: Map<String, Value>,
        timeout: Timeout,
        on_response: ResponseHook,
    ) -> Result<PendingResponse> {
        self.start_inner(operation, fields, timeout, Some(on_response))
    }

    fn start_inner(
        self: &Arc<Self>,
        operation: Operation,
        fields: Map<String, Value>,
        timeout: Timeout,
        on_response: Option<ResponseHook>,
    ) -> Result<PendingResponse> {
        validate_fields(operation, &fields)?;
        let deadline = timeout.resolve(operation, self.default_timeout)?;

        let id = self.next_id();
        let frame = encode_request(operation, &id, fields);
        let (sender, rx) = oneshot::channel();

        {
            // The open check and the insert happen under the pending lock so
            // a concurrent disconnect either sees this entry or we see it.
            let mut pending = lock(&self.pending);
            let open = self.connection.borrow().is_open();
            if !open {
                return Err(FlowlinkError::NotConnected);
            }
            self.outbound
                .send(frame)
                .map_err(|_| FlowlinkError::NotConnected)?;
            pending.insert(
                id.clone(),
                PendingRequest {
                    operation,
                    sender,
                    sent_at: Utc::now(),
                    on_response,
                },
            );
        }

        debug!(request_id = %id, operation = %operation, "Request sent");
        Ok(PendingResponse {
            id,
            operation,
            rx,
            timeout: deadline,
            deadline: deadline.map(|d| Instant::now() + d),
            dispatcher: Arc::clone(self),
        })
    }

    /// Send a request and wait for its outcome.
    pub async fn send(
        self: &Arc<Self>,
        operation: Operation,
        fields: Map<String, Value>,
        timeout: Timeout,
    ) -> Result<Value> {
        self.start(operation, fields, timeout)?.recv().await
    }

    /// Settle a pending request with `outcome`. Returns false if it was
    /// already settled.
    pub(crate) fn settle(&self, id: &str, outcome: Result<Value>) -> bool {
        let Some(entry) = lock(&self.pending).remove(id) else {
            return false;
        };
        let _ = entry.sender.send(outcome);
        true
    }

    /// Drop a pending entry without delivering anything.
    pub(crate) fn forget(&self, id: &str) -> bool {
        lock(&self.pending).remove(id).is_some()
    }

    /// Deliver a response frame. A non-null `error` field rejects the
    /// request with `ServerReported`. Returns false for late or unknown ids.
    pub fn resolve_response(&self, id: &str, mut body: Map<String, Value>) -> bool {
        let Some(entry) = lock(&self.pending).remove(id) else {
            return false;
        };
        body.remove("request_id");
        let payload = Value::Object(body);

        let elapsed_ms = (Utc::now() - entry.sent_at).num_milliseconds();
        let outcome = match payload.get("error") {
            Some(error) if !error.is_null() => {
                debug!(request_id = %id, operation = %entry.operation, elapsed_ms, "Request failed on server");
                Err(FlowlinkError::server_reported(payload))
            }
            _ => {
                debug!(request_id = %id, operation = %entry.operation, elapsed_ms, "Request resolved");
                match entry.on_response {
                    Some(hook) => hook(payload),
                    None => Ok(payload),
                }
            }
        };
        let _ = entry.sender.send(outcome);
        true
    }

    /// Reject every pending request with `ConnectionLost`.
    pub fn reject_all(&self) -> usize {
        let drained: Vec<(String, PendingRequest)> = lock(&self.pending).drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            debug!(request_id = %id, operation = %entry.operation, "Rejecting request on connection loss");
            let _ = entry.sender.send(Err(FlowlinkError::ConnectionLost));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn is_pending(&self, id: &str) -> bool {
        lock(&self.pending).contains_key(id)
    }

    fn next_id(&self) -> String {
        format!(
            "req-{}-{}-{:08x}",
            Utc::now().timestamp_millis(),
            self.counter.fetch_add(1, Ordering::Relaxed),
            rand::random::<u32>()
        )
    }
}

fn validate_fields(operation: Operation, fields: &Map<String, Value>) -> Result<()> {
    for field in operation.required_fields() {
        let present = fields
            .get(*field)
            .and_then(Value::as_str)
            .is_some_and(|s| !s.is_empty());
        if !present {
            return Err(FlowlinkError::InvalidRequest(format!(
                "{operation}: missing required field `{field}`"
            )));
        }
    }
    Ok(())
}

/// Handle to one in-flight request. Dropping it abandons the request.
pub struct PendingResponse {
    id: String,
    operation: Operation,
    rx: oneshot::Receiver<Result<Value>>,
    timeout: Option<Duration>,
    /// Armed when the frame was queued, not when `recv` is first polled.
    deadline: Option<Instant>,
    dispatcher: Arc<RequestDispatcher>,
}

impl PendingResponse {
    /// Correlation id of the request.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// Wait for the outcome.
    pub async fn recv(mut self) -> Result<Value> {
        let outcome = match self.deadline {
            None => (&mut self.rx).await,
            Some(deadline) => match tokio::time::timeout_at(deadline, &mut self.rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    let timed_out = self.dispatcher.settle(
                        &self.id,
                        Err(FlowlinkError::RequestTimeout {
                            operation: self.operation.to_string(),
                            timeout_ms: self.timeout.unwrap_or_default().as_millis() as u64,
                        }),
                    );
                    if timed_out {
                        warn!(request_id = %self.id, operation = %self.operation, "Request timed out");
                    }
                    // Whichever outcome won the race is now in the channel.
                    (&mut self.rx).await
                }
            },
        };
        outcome.unwrap_or_else(|_| Err(FlowlinkError::ConnectionLost))
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.dispatcher.forget(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn dispatcher(
        state: ConnectionState,
    ) -> (
        Arc<RequestDispatcher>,
        mpsc::UnboundedReceiver<String>,
        watch::Sender<ConnectionState>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(state);
        let dispatcher = Arc::new(RequestDispatcher::new(tx, state_rx, Duration::from_secs(30)));
        (dispatcher, rx, state_tx)
    }

    fn sent_id(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
        let frame: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        frame["request_id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn response_resolves_request() {
        let (dispatcher, mut rx, _state) = dispatcher(ConnectionState::Open { generation: 1 });
        let pending = dispatcher
            .start(Operation::GetStatus, fields(json!({"workflow_id": "w1"})), Timeout::Default)
            .unwrap();
        let id = sent_id(&mut rx);
        assert_eq!(pending.id(), id);

        assert!(dispatcher.resolve_response(&id, fields(json!({"request_id": id, "ok": true}))));
        let value = pending.recv().await.unwrap();
        assert_eq!(value["ok"], true);
        assert!(value.get("request_id").is_none());
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn error_field_becomes_server_reported() {
        let (dispatcher, mut rx, _state) = dispatcher(ConnectionState::Open { generation: 1 });
        let pending = dispatcher
            .start(Operation::StopExecution, fields(json!({"workflow_id": "w1"})), Timeout::Default)
            .unwrap();
        let id = sent_id(&mut rx);
        dispatcher.resolve_response(&id, fields(json!({"error": "nothing running"})));
        match pending.recv().await {
            Err(FlowlinkError::ServerReported { message, .. }) => assert_eq!(message, "nothing running"),
            other => panic!("expected ServerReported, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn disconnected_send_fails_fast() {
        let (dispatcher, mut rx, _state) = dispatcher(ConnectionState::Disconnected);
        let err = dispatcher
            .send(Operation::GetStatus, fields(json!({"workflow_id": "w1"})), Timeout::Default)
            .await
            .unwrap_err();
        assert!(matches!(err, FlowlinkError::NotConnected));
        assert!(rx.try_recv().is_err());
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn missing_required_field_is_invalid() {
        let (dispatcher, _rx, _state) = dispatcher(ConnectionState::Open { generation: 1 });
        let err = dispatcher
            .start(Operation::ExecuteNode, fields(json!({"workflow_id": "w1"})), Timeout::Default)
            .err()
            .unwrap();
        assert!(matches!(err, FlowlinkError::InvalidRequest(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_rejects_and_late_response_is_dropped() {
        let (dispatcher, mut rx, _state) = dispatcher(ConnectionState::Open { generation: 1 });
        let pending = dispatcher
            .start(
                Operation::GetStatus,
                fields(json!({"workflow_id": "w1"})),
                Timeout::After(Duration::from_millis(500)),
            )
            .unwrap();
        let id = sent_id(&mut rx);

        match pending.recv().await {
            Err(FlowlinkError::RequestTimeout { operation, timeout_ms }) => {
                assert_eq!(operation, "get_status");
                assert_eq!(timeout_ms, 500);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(!dispatcher.resolve_response(&id, Map::new()));
    }

    #[tokio::test]
    async fn reject_all_settles_every_request_once() {
        let (dispatcher, _rx, _state) = dispatcher(ConnectionState::Open { generation: 1 });
        let handles: Vec<_> = (0..5)
            .map(|_| {
                dispatcher
                    .start(Operation::GetStatus, fields(json!({"workflow_id": "w1"})), Timeout::Default)
                    .unwrap()
            })
            .collect();
        assert_eq!(dispatcher.reject_all(), 5);
        assert_eq!(dispatcher.reject_all(), 0);
        for handle in handles {
            assert!(matches!(handle.recv().await, Err(FlowlinkError::ConnectionLost)));
        }
    }

    #[tokio::test]
    async fn dropping_handle_forgets_entry() {
        let (dispatcher, _rx, _state) = dispatcher(ConnectionState::Open { generation: 1 });
        let pending = dispatcher
            .start(Operation::GetStatus, fields(json!({"workflow_id": "w1"})), Timeout::Default)
            .unwrap();
        let id = pending.id().to_string();
        assert!(dispatcher.is_pending(&id));
        drop(pending);
        assert!(!dispatcher.is_pending(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_counts_from_send() {
        let (dispatcher, _rx, _state) = dispatcher(ConnectionState::Open { generation: 1 });
        let pending = dispatcher
            .start(
                Operation::GetStatus,
                fields(json!({"workflow_id": "w1"})),
                Timeout::After(Duration::from_millis(500)),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        let polled_at = Instant::now();
        assert!(matches!(
            pending.recv().await,
            Err(FlowlinkError::RequestTimeout { timeout_ms: 500, .. })
        ));
        assert!(polled_at.elapsed() <= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn response_hook_runs_before_delivery() {
        let (dispatcher, mut rx, _state) = dispatcher(ConnectionState::Open { generation: 1 });
        let seen = Arc::new(Mutex::new(None));
        let hook_seen = seen.clone();
        let pending = dispatcher
            .start_with(
                Operation::GetStatus,
                fields(json!({"workflow_id": "w1"})),
                Timeout::Default,
                Box::new(move |response: Value| {
                    *hook_seen.lock().unwrap() = Some(response["n"].clone());
                    Ok(json!({"applied": true}))
                }),
            )
            .unwrap();
        let id = sent_id(&mut rx);

        dispatcher.resolve_response(&id, fields(json!({"n": 4})));
        assert_eq!(*seen.lock().unwrap(), Some(json!(4)));
        assert_eq!(pending.recv().await.unwrap()["applied"], true);
    }

    #[tokio::test]
    async fn response_hook_error_rejects_request() {
        let (dispatcher, mut rx, _state) = dispatcher(ConnectionState::Open { generation: 1 });
        let pending = dispatcher
            .start_with(
                Operation::GetStatus,
                fields(json!({"workflow_id": "w1"})),
                Timeout::Default,
                Box::new(|_: Value| Err(FlowlinkError::ProtocolViolation("bad snapshot".into()))),
            )
            .unwrap();
        let id = sent_id(&mut rx);
        dispatcher.resolve_response(&id, Map::new());
        assert!(matches!(
            pending.recv().await,
            Err(FlowlinkError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn correlation_ids_are_unique() {
        let (dispatcher, _rx, _state) = dispatcher(ConnectionState::Open { generation: 1 });
        let ids: std::collections::HashSet<String> = (0..1000).map(|_| dispatcher.next_id()).collect();
        assert_eq!(ids.len(), 1000);
    }
}
