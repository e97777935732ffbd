//! Socket transport.
//!
//! [`Connector`] is the seam between the connection driver and the network.
//! [`WsConnector`] speaks WebSocket through tokio-tungstenite; tests plug in an
//! in-process connector instead.

use async_trait::async_trait;
use futures::stream::{BoxStream, SplitSink};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;
use url::Url;

use crate::error::{ChatError, Result};

/// What the driver reads off a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketFrame {
    Text(String),
    /// The peer closed the socket, with its close code if it sent one.
    Close(Option<u16>),
}

/// Write half of an open socket.
#[async_trait]
pub trait SocketSink: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// Start a graceful close. Errors are ignored.
    async fn close(&mut self);
}

/// An open socket, split into its two halves.
pub struct Socket {
    pub sink: Box<dyn SocketSink>,
    pub stream: BoxStream<'static, Result<SocketFrame>>,
}

/// Opens sockets.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a socket to `url`. Timeouts are applied by the caller.
    async fn connect(&self, url: &Url) -> Result<Socket>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket connector over tokio-tungstenite.
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &Url) -> Result<Socket> {
        let (ws, _response) = connect_async(url.as_str())
            .await
            .map_err(|err| ChatError::Connection(err.to_string()))?;
        let (sink, stream) = ws.split();

        let stream = stream
            .filter_map(|item| async move {
                match item {
                    Ok(WsMessage::Text(text)) => Some(Ok(SocketFrame::Text(text.as_str().to_owned()))),
                    Ok(WsMessage::Close(frame)) => {
                        Some(Ok(SocketFrame::Close(frame.map(|f| u16::from(f.code)))))
                    }
                    // tungstenite answers pings on its own.
                    Ok(_) => None,
                    Err(err) => Some(Err(ChatError::Connection(err.to_string()))),
                }
            })
            .boxed();

        Ok(Socket {
            sink: Box::new(WsSink(sink)),
            stream,
        })
    }
}

struct WsSink(SplitSink<WsStream, WsMessage>);

#[async_trait]
impl SocketSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.0
            .send(WsMessage::text(text))
            .await
            .map_err(|err| ChatError::Connection(err.to_string()))
    }

    async fn close(&mut self) {
        if let Err(err) = self.0.close().await {
            debug!("socket close failed: {}", err);
        }
    }
}
