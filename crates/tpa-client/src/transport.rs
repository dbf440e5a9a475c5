use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::error::{TpaError, TpaResult};

/// What the reader side of a link observes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Closed { reason: Option<String> },
}

/// An open, message-oriented, full-duplex connection.
///
/// Frames pushed into `outbound` are written in order by a single writer.
/// Dropping every clone of `outbound` closes the connection.
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<Inbound>,
}

impl Link {
    pub fn new(
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<Inbound>,
    ) -> Self {
        Self { outbound, inbound }
    }
}

/// Opens links to the cloud. The session never touches sockets directly so
/// tests can substitute an in-memory cloud.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> TpaResult<Link>;
}

/// Connector backed by `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> TpaResult<Link> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|err| TpaError::Connection(err.to_string()))?;

        let (tx_out, rx_out) = mpsc::unbounded_channel::<String>();
        let (tx_in, rx_in) = mpsc::unbounded_channel::<Inbound>();

        tokio::spawn(handle_websocket(ws_stream, rx_out, tx_in));

        Ok(Link::new(tx_out, rx_in))
    }
}

async fn handle_websocket(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut rx_out: mpsc::UnboundedReceiver<String>,
    tx_in: mpsc::UnboundedSender<Inbound>,
) {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let send_task = tokio::spawn(async move {
        while let Some(text) = rx_out.recv().await {
            if ws_sender.send(Message::Text(text)).await.is_err() {
                return;
            }
        }
        // Every sender dropped: the session let go of this link.
        let _ = ws_sender.send(Message::Close(None)).await;
        let _ = ws_sender.close().await;
    });

    let mut reason = None;
    while let Some(message) = ws_receiver.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if tx_in.send(Inbound::Text(text)).is_err() {
                    break;
                }
            }
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => {
                    if tx_in.send(Inbound::Text(text)).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    debug!(error = %err, "ignoring non-utf8 binary frame");
                }
            },
            Ok(Message::Close(frame)) => {
                reason = frame.map(|f| f.reason.to_string());
                break;
            }
            Ok(_) => continue,
            Err(err) => {
                warn!(error = %err, "websocket receive failed");
                reason = Some(err.to_string());
                break;
            }
        }
    }

    let _ = tx_in.send(Inbound::Closed { reason });
    send_task.abort();
}
