use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use flowlink_core::error::Result;
use flowlink_core::event::EventBus;
use flowlink_core::traits::{Connector, Transport};
use flowlink_core::types::{ConnectionState, EngineEvent};

use crate::dispatcher::RequestDispatcher;
use crate::lock;
use crate::protocol::PING_FRAME;
use crate::router::FrameRouter;

/// Timing for the connection loop.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub keepalive_interval: Duration,
    /// Fixed delay between reconnection attempts; there is no backoff.
    pub reconnect_delay: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(30),
            reconnect_delay: Duration::from_millis(3000),
        }
    }
}

enum CloseReason {
    Requested,
    PeerClosed,
    Failed(String),
}

/// Owns the transport lifecycle: connect, keepalive, inbound pump,
/// outbound writes, and reconnection.
///
/// All frames for one connection are read and written on a single task,
/// so inbound frames are routed in arrival order.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    router: Arc<FrameRouter>,
    dispatcher: Arc<RequestDispatcher>,
    events: Arc<EventBus>,
    settings: ConnectionSettings,
    state: watch::Sender<ConnectionState>,
    outbound: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    shutdown: Mutex<CancellationToken>,
    last_activity: Mutex<Option<DateTime<Utc>>>,
    generation: AtomicU64,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        router: Arc<FrameRouter>,
        dispatcher: Arc<RequestDispatcher>,
        events: Arc<EventBus>,
        settings: ConnectionSettings,
        state: watch::Sender<ConnectionState>,
        outbound: mpsc::UnboundedReceiver<String>,
    ) -> Self {
        Self {
            connector,
            router,
            dispatcher,
            events,
            settings,
            state,
            outbound: Arc::new(tokio::sync::Mutex::new(outbound)),
            task: Mutex::new(None),
            shutdown: Mutex::new(CancellationToken::new()),
            last_activity: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Start the connection loop. Idempotent while the loop is running.
    pub fn connect(self: &Arc<Self>) {
        let mut task = lock(&self.task);
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let token = CancellationToken::new();
        *lock(&self.shutdown) = token.clone();
        let this = Arc::clone(self);
        *task = Some(tokio::spawn(async move { this.run(token).await }));
    }

    /// Close the transport on purpose. Pending requests are rejected with
    /// `ConnectionLost` and no reconnect is scheduled.
    pub async fn close(&self) {
        lock(&self.shutdown).cancel();
        let handle = lock(&self.task).take();
        match handle {
            Some(handle) => {
                if let Err(e) = handle.await {
                    warn!(error = %e, "Connection task ended abnormally");
                }
            }
            None => {
                self.state.send_replace(ConnectionState::Closed);
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Time of the last successful connect or inbound frame.
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        *lock(&self.last_activity)
    }

    pub fn endpoint(&self) -> &str {
        self.connector.endpoint()
    }

    async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let outbound = Arc::clone(&self.outbound);
        let mut outbound = outbound.lock().await;
        let endpoint = self.connector.endpoint().to_string();

        loop {
            self.state.send_replace(ConnectionState::Connecting);
            debug!(endpoint = %endpoint, "Connecting");

            let attempt: Result<Transport> = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.connector.connect() => result,
            };

            match attempt {
                Ok(transport) => {
                    let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    self.touch();
                    self.state.send_replace(ConnectionState::Open { generation });
                    info!(endpoint = %endpoint, generation, "Connected to execution backend");
                    self.events.publish(EngineEvent::Connected { generation });

                    let reason = self.serve(transport, &mut outbound, &shutdown).await;
                    self.on_closed(generation, &mut outbound, reason);
                }
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, "Connection attempt failed");
                    self.state.send_replace(ConnectionState::Disconnected);
                }
            }

            if shutdown.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.settings.reconnect_delay) => {}
            }
        }

        self.state.send_replace(ConnectionState::Closed);
        info!(endpoint = %endpoint, "Connection closed");
    }

    async fn serve(
        &self,
        transport: Transport,
        outbound: &mut mpsc::UnboundedReceiver<String>,
        shutdown: &CancellationToken,
    ) -> CloseReason {
        let Transport {
            mut sink,
            mut stream,
        } = transport;
        let period = self.settings.keepalive_interval;
        let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break CloseReason::Requested,
                inbound = stream.next() => match inbound {
                    Some(Ok(text)) => {
                        self.touch();
                        self.router.dispatch(&text);
                    }
                    Some(Err(e)) => break CloseReason::Failed(e.to_string()),
                    None => break CloseReason::PeerClosed,
                },
                Some(frame) = outbound.recv() => {
                    if let Err(e) = sink.send(frame).await {
                        break CloseReason::Failed(e.to_string());
                    }
                }
                _ = keepalive.tick() => {
                    if let Err(e) = sink.send(PING_FRAME.to_string()).await {
                        break CloseReason::Failed(e.to_string());
                    }
                    trace!("Sent keepalive ping");
                }
            }
        };

        if matches!(reason, CloseReason::Requested) {
            let _ = tokio::time::timeout(Duration::from_secs(1), sink.close()).await;
        }
        reason
    }

    /// Tear down per-connection state. Order matters: the state flips first
    /// so no new request can register, then every pending request is
    /// rejected, then frames queued for the dead transport are discarded.
    fn on_closed(
        &self,
        generation: u64,
        outbound: &mut mpsc::UnboundedReceiver<String>,
        reason: CloseReason,
    ) {
        self.state.send_replace(ConnectionState::Disconnected);
        let rejected = self.dispatcher.reject_all();

        let mut discarded = 0usize;
        while outbound.try_recv().is_ok() {
            discarded += 1;
        }
        self.router.connection_lost();

        let intentional = matches!(reason, CloseReason::Requested);
        match &reason {
            CloseReason::Requested => {
                info!(generation, rejected, "Connection closed by client");
            }
            CloseReason::PeerClosed => {
                warn!(generation, rejected, discarded, "Connection closed by peer");
            }
            CloseReason::Failed(error) => {
                warn!(generation, rejected, discarded, error = %error, "Connection failed");
            }
        }

        self.events.publish(EngineEvent::Disconnected {
            generation,
            intentional,
            rejected_requests: rejected,
        });
    }

    fn touch(&self) {
        *lock(&self.last_activity) = Some(Utc::now());
    }
}
