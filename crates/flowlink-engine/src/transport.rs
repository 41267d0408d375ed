use futures::future::{self, BoxFuture};
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::debug;

use flowlink_core::error::{FlowlinkError, Result};
use flowlink_core::traits::{Connector, Transport};

/// WebSocket connector for the execution backend.
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl Connector for WsConnector {
    fn endpoint(&self) -> &str {
        &self.url
    }

    fn connect(&self) -> BoxFuture<'_, Result<Transport>> {
        Box::pin(async move {
            let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
                .await
                .map_err(|e| FlowlinkError::Transport(e.to_string()))?;
            let (ws_tx, ws_rx) = ws_stream.split();

            let sink = ws_tx
                .sink_map_err(|e| FlowlinkError::Transport(e.to_string()))
                .with(|text: String| future::ready(Ok::<_, FlowlinkError>(WsMessage::Text(text.into()))));

            // Control frames are handled by tungstenite; only data frames
            // carry protocol messages.
            let stream = ws_rx.filter_map(|msg| {
                future::ready(match msg {
                    Ok(WsMessage::Text(text)) => Some(Ok(text.as_str().to_string())),
                    Ok(WsMessage::Binary(data)) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => Some(Ok(text)),
                        Err(_) => {
                            debug!("Dropping non-UTF-8 binary frame");
                            None
                        }
                    },
                    Ok(_) => None,
                    Err(e) => Some(Err(FlowlinkError::Transport(e.to_string()))),
                })
            });

            Ok(Transport::new(Box::pin(sink), stream.boxed()))
        })
    }
}
