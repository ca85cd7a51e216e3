//! WebSocket listener using tokio-tungstenite.
//!
//! Both the client-facing endpoint and the backend ingress endpoint use
//! this listener. Frames carry JSON text; binary frames are accepted as long
//! as they are valid UTF-8.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};
use wsrelay_core::{RelayError, RelayResult};

/// Maximum accepted frame size (1 MiB).
pub const MAX_WS_FRAME_SIZE: usize = 1_048_576;

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
}

/// Bind `bind_addr` and return the actual local address plus a receiver
/// that yields accepted connections.
pub async fn start_listener(
    bind_addr: SocketAddr,
    name: &'static str,
) -> RelayResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| RelayError::Transport(format!("{name} bind failed: {e}")))?;
    let local_addr = tcp_listener
        .local_addr()
        .map_err(|e| RelayError::Transport(format!("{name} local address: {e}")))?;

    info!(addr = %local_addr, listener = name, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        match tokio_tungstenite::accept_async(stream).await {
                            Ok(ws_stream) => {
                                debug!(remote = %addr, listener = name, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!(listener = name, "WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, listener = name, "TCP accept failed");
                }
            }
        }
    });

    Ok((local_addr, rx))
}

/// Send a text frame.
pub async fn ws_send_text(ws: &mut WebSocketStream<TcpStream>, text: String) -> RelayResult<()> {
    ws.send(Message::Text(text))
        .await
        .map_err(|e| RelayError::Transport(format!("WS send failed: {e}")))
}

/// Receive the next text payload.
///
/// Returns `None` once the peer closes. Pings are answered; pongs are
/// skipped. Frames over [`MAX_WS_FRAME_SIZE`] or binary frames that are not
/// UTF-8 are rejected.
pub async fn ws_recv_text(ws: &mut WebSocketStream<TcpStream>) -> RelayResult<Option<String>> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                check_size(text.len())?;
                return Ok(Some(text));
            }
            Some(Ok(Message::Binary(data))) => {
                check_size(data.len())?;
                return String::from_utf8(data)
                    .map(Some)
                    .map_err(|_| RelayError::InvalidMessage("binary frame is not UTF-8".into()));
            }
            Some(Ok(Message::Close(_))) => return Ok(None),
            Some(Ok(Message::Ping(payload))) => {
                let _ = ws.send(Message::Pong(payload)).await;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(RelayError::Transport(format!("WS recv failed: {e}")));
            }
            None => return Ok(None),
        }
    }
}

fn check_size(len: usize) -> RelayResult<()> {
    if len > MAX_WS_FRAME_SIZE {
        return Err(RelayError::InvalidMessage(format!(
            "WS frame too large: {len} bytes (max {MAX_WS_FRAME_SIZE})"
        )));
    }
    Ok(())
}
