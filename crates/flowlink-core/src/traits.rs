use std::pin::Pin;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::Sink;

use crate::error::{FlowlinkError, Result};

/// Outbound half of a transport: accepts serialized JSON frames.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = FlowlinkError> + Send>>;

/// Inbound half of a transport: yields serialized JSON frames until the
/// peer closes the connection.
pub type FrameStream = BoxStream<'static, Result<String>>;

/// An open, bidirectional frame transport.
pub struct Transport {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl Transport {
    pub fn new(sink: FrameSink, stream: FrameStream) -> Self {
        Self { sink, stream }
    }
}

/// Opens a fresh transport to the execution backend.
///
/// Every call must produce a new, independent transport. Correlation ids are
/// not durable across transports.
pub trait Connector: Send + Sync + 'static {
    /// Human-readable endpoint (used in logs).
    fn endpoint(&self) -> &str;

    /// Open a new transport.
    fn connect(&self) -> BoxFuture<'_, Result<Transport>>;
}
