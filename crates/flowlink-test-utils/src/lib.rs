//! In-memory execution backend for exercising the engine without a network.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::channel::mpsc as fmpsc;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;

use flowlink_core::error::{FlowlinkError, Result};
use flowlink_core::traits::{Connector, Transport};

/// How long backend-side helpers wait before giving up.
const WAIT: Duration = Duration::from_secs(5);

/// Create a connector and the backend that accepts its connections.
pub fn mock_backend() -> (Arc<MockConnector>, MockBackend) {
    let (tx, rx) = mpsc::unbounded_channel();
    let connector = Arc::new(MockConnector {
        endpoint: "mock://backend".to_string(),
        accepted: tx,
        fail_next: AtomicUsize::new(0),
        attempts: AtomicUsize::new(0),
    });
    let backend = MockBackend {
        accepted: rx,
        connector: connector.clone(),
    };
    (connector, backend)
}

pub struct MockConnector {
    endpoint: String,
    accepted: mpsc::UnboundedSender<MockConnection>,
    fail_next: AtomicUsize,
    attempts: AtomicUsize,
}

impl Connector for MockConnector {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn connect(&self) -> BoxFuture<'_, Result<Transport>> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let refuse = self
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if refuse {
                return Err(FlowlinkError::Transport("connection refused".into()));
            }

            let (client_tx, server_rx) = fmpsc::unbounded::<String>();
            let (server_tx, client_rx) = fmpsc::unbounded::<Result<String>>();
            self.accepted
                .send(MockConnection {
                    inbound: server_rx,
                    outbound: server_tx,
                })
                .map_err(|_| FlowlinkError::Transport("mock backend dropped".into()))?;

            let sink = client_tx.sink_map_err(|e| FlowlinkError::Transport(e.to_string()));
            Ok(Transport::new(Box::pin(sink), client_rx.boxed()))
        })
    }
}

/// Backend side: hands out one `MockConnection` per successful connect.
pub struct MockBackend {
    accepted: mpsc::UnboundedReceiver<MockConnection>,
    connector: Arc<MockConnector>,
}

impl MockBackend {
    /// Wait for the engine to open the next connection.
    pub async fn accept(&mut self) -> MockConnection {
        tokio::time::timeout(WAIT, self.accepted.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("connector dropped")
    }

    /// Refuse the next `n` connection attempts.
    pub fn fail_next(&self, n: usize) {
        self.connector.fail_next.store(n, Ordering::SeqCst);
    }

    /// Connection attempts so far, refused ones included.
    pub fn attempts(&self) -> usize {
        self.connector.attempts.load(Ordering::SeqCst)
    }
}

/// One accepted connection, seen from the backend.
pub struct MockConnection {
    inbound: fmpsc::UnboundedReceiver<String>,
    outbound: fmpsc::UnboundedSender<Result<String>>,
}

impl MockConnection {
    /// Next frame sent by the engine, keepalive pings included.
    /// `None` once the engine has closed its side.
    pub async fn next_frame(&mut self) -> Option<Value> {
        let text = tokio::time::timeout(WAIT, self.inbound.next())
            .await
            .expect("timed out waiting for a frame")?;
        Some(serde_json::from_str(&text).expect("engine sent invalid JSON"))
    }

    /// A frame already queued by the engine, without waiting.
    pub fn try_next_frame(&mut self) -> Option<Value> {
        self.inbound
            .try_recv()
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
    }

    /// Next non-ping frame.
    pub async fn next_request(&mut self) -> Value {
        loop {
            let frame = self
                .next_frame()
                .await
                .expect("connection closed while waiting for a request");
            if frame["type"] != "ping" {
                return frame;
            }
        }
    }

    /// Next request, asserting its operation.
    pub async fn expect_request(&mut self, operation: &str) -> Value {
        let request = self.next_request().await;
        assert_eq!(request["type"], operation, "unexpected request {request}");
        request
    }

    /// Push a frame to the engine.
    pub fn send(&self, frame: Value) {
        let _ = self.outbound.unbounded_send(Ok(frame.to_string()));
    }

    /// Push a raw text frame, which need not be valid JSON.
    pub fn send_raw(&self, text: &str) {
        let _ = self.outbound.unbounded_send(Ok(text.to_string()));
    }

    /// Reply to `request` with `fields`, copying its correlation id.
    pub fn respond(&self, request: &Value, fields: Value) {
        let mut body = match fields {
            Value::Object(map) => map,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("result".into(), other);
                map
            }
        };
        body.insert("request_id".into(), request["request_id"].clone());
        self.send(Value::Object(body));
    }

    /// Fail the transport with an error.
    pub fn fail(&self, message: &str) {
        let _ = self
            .outbound
            .unbounded_send(Err(FlowlinkError::Transport(message.to_string())));
    }

    /// Close the backend side; the engine sees end-of-stream.
    pub fn close(self) {
        self.outbound.close_channel();
    }
}

/// Write a config file into a fresh temp dir.
pub fn write_config(content: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let path = dir.path().join("flowlink.toml");
    std::fs::write(&path, content).expect("failed to write config");
    (dir, path)
}

/// Smallest valid config pointing at `url`.
pub fn minimal_config(url: &str) -> String {
    format!("[connection]\nurl = \"{url}\"\n")
}
