//! WebSocket listener using tokio-tungstenite.
//!
//! Every frame is a single JSON text message; binary frames are refused.

use futures_util::{SinkExt, StreamExt};
use herald_core::{encode_event, CloseReason, HeraldError, HeraldResult, ServerEvent, MAX_FRAME_SIZE};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// An accepted, upgraded client connection.
pub struct WebSocketConnection {
    pub ws_stream: WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
}

/// Bind `bind_addr` and start accepting WebSocket upgrades.
///
/// Returns the bound address (useful with port 0) and a receiver that yields
/// connections whose handshake completed.
pub async fn start_listener(
    bind_addr: SocketAddr,
) -> HeraldResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| HeraldError::Transport(format!("WS bind failed: {e}")))?;
    let local_addr = tcp_listener.local_addr()?;

    info!(addr = %local_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        match tokio_tungstenite::accept_async(stream).await {
                            Ok(ws_stream) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
            if tx.is_closed() {
                debug!("connection receiver dropped, listener stopping");
                break;
            }
        }
    });

    Ok((local_addr, rx))
}

/// Encode and send one server event as a text frame.
pub async fn ws_send_event(
    ws: &mut WebSocketStream<TcpStream>,
    event: &ServerEvent,
) -> HeraldResult<()> {
    let text = encode_event(event)?;
    ws.send(Message::Text(text.into()))
        .await
        .map_err(|e| HeraldError::Transport(format!("WS send failed: {e}")))
}

/// Send a close frame carrying `reason`. Errors are reported but harmless
/// when the peer is already gone.
pub async fn ws_send_close(
    ws: &mut WebSocketStream<TcpStream>,
    reason: CloseReason,
) -> HeraldResult<()> {
    let frame = CloseFrame {
        code: CloseCode::from(reason.close_code()),
        reason: reason.as_str().into(),
    };
    ws.close(Some(frame))
        .await
        .map_err(|e| HeraldError::Transport(format!("WS close failed: {e}")))
}

/// Receive the next text frame.
///
/// Returns `None` when the peer closed. Pings are answered; binary frames
/// and oversized text are rejected with `InvalidMessage`.
pub async fn ws_recv_text(ws: &mut WebSocketStream<TcpStream>) -> HeraldResult<Option<String>> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                if text.len() > MAX_FRAME_SIZE {
                    return Err(HeraldError::InvalidMessage(format!(
                        "WS frame too large: {} bytes (max {MAX_FRAME_SIZE})",
                        text.len()
                    )));
                }
                return Ok(Some(text.to_string()));
            }
            Some(Ok(Message::Binary(_))) => {
                return Err(HeraldError::InvalidMessage(
                    "binary frames are not supported".into(),
                ));
            }
            Some(Ok(Message::Close(_))) => return Ok(None),
            Some(Ok(Message::Ping(payload))) => {
                let _ = ws.send(Message::Pong(payload)).await;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(HeraldError::Transport(format!("WS recv failed: {e}")));
            }
            None => return Ok(None),
        }
    }
}
