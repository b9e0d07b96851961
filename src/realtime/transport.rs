//! Transport seam for the realtime session.
//!
//! A [`Connector`] opens one full-duplex text link per connection epoch and
//! hands back a [`TransportLink`]: an outbound sender for serialized frames
//! and an inbound receiver of [`TransportEvent`]s. Dropping the outbound
//! sender closes the underlying socket.

use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use crate::retry::with_timeout;

/// Event produced by an open transport.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TransportEvent {
    /// Inbound text frame.
    Text(String),
    /// Transport-level error. The link stays up until [`TransportEvent::Closed`].
    Error(String),
    /// The link is gone; nothing follows.
    Closed,
}

/// Channels bound to one open transport.
#[derive(Debug)]
pub struct TransportLink {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens transports for the realtime session.
pub trait Connector: Send + Sync + 'static {
    /// Opens a link to `url`. The URL carries the bearer token and must not be
    /// logged.
    fn open(&self, url: String) -> BoxFuture<'static, Result<TransportLink, RealtimeError>>;
}

/// Errors produced while opening a transport.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// Websocket handshake or I/O error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// The handshake did not finish in time.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// Any other transport failure.
    #[error("transport error: {0}")]
    Transport(String),
}

/// [`Connector`] backed by tokio-tungstenite.
#[derive(Clone, Debug)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    /// Creates a connector that bounds each handshake by `connect_timeout`.
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Connector for WsConnector {
    fn open(&self, url: String) -> BoxFuture<'static, Result<TransportLink, RealtimeError>> {
        let connect_timeout = self.connect_timeout;
        Box::pin(async move {
            let request = url.into_client_request()?;
            let (socket, _) = with_timeout(connect_timeout, connect_async(request))
                .await
                .map_err(|_| RealtimeError::ConnectTimeout(connect_timeout))??;

            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            tokio::spawn(pump_socket(socket, outbound_rx, inbound_tx));

            Ok(TransportLink {
                outbound: outbound_tx,
                inbound: inbound_rx,
            })
        })
    }
}

async fn pump_socket<S>(
    mut socket: WebSocketStream<S>,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    inbound_tx: mpsc::UnboundedSender<TransportEvent>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        tokio::select! {
            maybe_outbound = outbound_rx.recv() => {
                match maybe_outbound {
                    Some(text) => {
                        if let Err(err) = socket.send(Message::Text(text)).await {
                            let _ = inbound_tx.send(TransportEvent::Error(err.to_string()));
                            break;
                        }
                    }
                    None => {
                        let _ = socket.close(None).await;
                        return;
                    }
                }
            }
            maybe_inbound = socket.next() => {
                match maybe_inbound {
                    Some(Ok(Message::Text(text))) => {
                        if inbound_tx.send(TransportEvent::Text(text)).is_err() {
                            let _ = socket.close(None).await;
                            return;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(payload))) => {
                        debug!(event = "binary_frame_ignored", len = payload.len());
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        let _ = inbound_tx.send(TransportEvent::Error(err.to_string()));
                        break;
                    }
                }
            }
        }
    }

    let _ = inbound_tx.send(TransportEvent::Closed);
}
