//! Transport seam between the connector and the network.
//!
//! The connector only sees text frames: a [`FrameSink`] to write and a
//! [`FrameStream`] to read. [`WsDialer`] provides them over tokio-tungstenite;
//! tests substitute in-memory channels.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt, future};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::trace;

use super::FeedError;

pub type FrameSink = Pin<Box<dyn Sink<String, Error = FeedError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, FeedError>> + Send>>;

/// An open upstream connection.
pub struct Transport {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Opens transports. The connector applies the handshake timeout around `dial`.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, url: &str) -> Result<Transport, FeedError>;
}

/// Websocket dialer.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsDialer;

#[async_trait]
impl Dialer for WsDialer {
    async fn dial(&self, url: &str) -> Result<Transport, FeedError> {
        let (ws, response) = connect_async(url).await.map_err(|e| FeedError::Dial {
            endpoint: url.to_string(),
            reason: e.to_string(),
        })?;
        trace!(url, status = %response.status(), "websocket handshake complete");

        let (write, read) = ws.split();
        let sink = write
            .sink_map_err(|e| FeedError::Transport(e.to_string()))
            .with(|text: String| future::ready(Ok::<_, FeedError>(Message::Text(text))));
        let stream = read.filter_map(|message| {
            future::ready(match message {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Binary(bytes)) => String::from_utf8(bytes).ok().map(Ok),
                Ok(Message::Close(_)) => Some(Err(FeedError::Closed)),
                Ok(_) => None,
                Err(e) => Some(Err(FeedError::Transport(e.to_string()))),
            })
        });

        Ok(Transport {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}
