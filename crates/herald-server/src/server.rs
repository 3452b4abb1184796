//! Core server: accepts WebSocket connections and drives each one through
//! the relay.
//!
//! A connection is one session. Its task forwards outbox items to the socket
//! and dispatches inbound requests; whatever ends the loop, the session is
//! disconnected from the relay exactly once on the way out.

use crate::auth::AuthRateLimiter;
use crate::config::ServerConfig;
use crate::service::Relay;
use crate::session::{Outbox, Outgoing};
use crate::transport::websocket::{self, WebSocketConnection};
use herald_core::{
    decode_request, ClientRequest, CloseReason, HeraldError, HeraldResult, ServerEvent, SessionId,
    UserId,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// The herald server instance.
pub struct HeraldServer {
    config: ServerConfig,
    relay: Relay,
    /// Per-IP limiter for `authenticate` requests.
    rate_limits: Arc<Mutex<AuthRateLimiter>>,
}

impl HeraldServer {
    pub fn new(config: ServerConfig, relay: Relay) -> Self {
        let rate_limits = Arc::new(Mutex::new(AuthRateLimiter::per_minute(
            config.max_auth_attempts_per_minute,
        )));
        Self {
            config,
            relay,
            rate_limits,
        }
    }

    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    /// Bind the configured address and serve until `shutdown` completes.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> HeraldResult<()> {
        let (addr, incoming) = self.listen().await?;
        info!(addr = %addr, "herald-server ready");
        Arc::new(self).serve(incoming, shutdown).await
    }

    pub async fn listen(&self) -> HeraldResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
        websocket::start_listener(self.config.listen_addr()).await
    }

    /// Accept loop. On shutdown every session is closed with `server_shutdown`.
    pub async fn serve(
        self: Arc<Self>,
        mut incoming: mpsc::Receiver<WebSocketConnection>,
        shutdown: impl Future<Output = ()>,
    ) -> HeraldResult<()> {
        let stats_task = tokio::spawn(stats_loop(self.relay.clone(), self.rate_limits.clone()));
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                conn = incoming.recv() => {
                    let Some(conn) = conn else {
                        info!("listener closed, shutting down");
                        break;
                    };
                    let srv = self.clone();
                    tokio::spawn(async move {
                        let remote = conn.remote_addr;
                        if let Err(e) = srv.handle_connection(conn).await {
                            warn!(remote = %remote, error = %e, "connection error");
                        }
                    });
                }
            }
        }

        stats_task.abort();
        let closed = self.relay.shutdown().await;
        info!(closed, "herald-server stopped accepting");
        Ok(())
    }

    async fn handle_connection(&self, mut conn: WebSocketConnection) -> HeraldResult<()> {
        let remote = conn.remote_addr;
        let (session_id, mut outbox) = match self.relay.connect(Some(remote)).await {
            Ok(accepted) => accepted,
            Err(e) => {
                let _ = websocket::ws_send_event(&mut conn.ws_stream, &ServerEvent::error(&e)).await;
                let _ = websocket::ws_send_close(&mut conn.ws_stream, CloseReason::Overloaded).await;
                return Err(e);
            }
        };

        let reason = self.session_loop(&mut conn, &session_id, &mut outbox).await;
        self.relay.disconnect(&session_id, reason).await;
        debug!(session_id = %session_id.short(), reason = %reason, "connection finished");
        Ok(())
    }

    /// Pump one session until it ends; returns why it ended.
    async fn session_loop(
        &self,
        conn: &mut WebSocketConnection,
        session_id: &SessionId,
        outbox: &mut Outbox,
    ) -> CloseReason {
        loop {
            tokio::select! {
                item = outbox.recv() => match item {
                    Some(Outgoing::Event(event)) => {
                        if let Err(e) = websocket::ws_send_event(&mut conn.ws_stream, &event).await {
                            debug!(session_id = %session_id.short(), error = %e, "write failed");
                            return CloseReason::TransportFailure;
                        }
                    }
                    Some(Outgoing::Close(reason)) => {
                        let _ = websocket::ws_send_close(&mut conn.ws_stream, reason).await;
                        return reason;
                    }
                    None => return CloseReason::TransportFailure,
                },

                frame = websocket::ws_recv_text(&mut conn.ws_stream) => match frame {
                    Ok(Some(text)) => self.dispatch(session_id, conn.remote_addr, &text).await,
                    Ok(None) => {
                        debug!(session_id = %session_id.short(), "peer closed");
                        return CloseReason::ClientClosed;
                    }
                    Err(e @ HeraldError::InvalidMessage(_)) => {
                        self.respond(session_id, ServerEvent::error(&e)).await;
                    }
                    Err(e) => {
                        debug!(session_id = %session_id.short(), error = %e, "read failed");
                        return CloseReason::TransportFailure;
                    }
                },
            }
        }
    }

    /// Decode and handle one inbound frame. Failures are reported to the
    /// client; none of them end the session.
    async fn dispatch(&self, session_id: &SessionId, remote: SocketAddr, text: &str) {
        let request = match decode_request(text) {
            Ok(request) => request,
            Err(e) => {
                debug!(session_id = %session_id.short(), error = %e, "undecodable frame");
                self.respond(session_id, ServerEvent::error(&e)).await;
                return;
            }
        };

        if let ClientRequest::Authenticate { user_id } = request {
            if !self.rate_limits.lock().await.check(&remote.ip()) {
                warn!(remote = %remote, "authentication rate limited");
                self.respond(session_id, ServerEvent::error(&HeraldError::RateLimited)).await;
                return;
            }
            if let Err(e) = self.relay.authenticate(session_id, user_id).await {
                self.respond(session_id, ServerEvent::error(&e)).await;
            }
            return;
        }

        let Some(user_id) = self.relay.supervisor().user_of(session_id).await else {
            debug!(session_id = %session_id.short(), request = request.name(), "request before authentication");
            self.respond(session_id, ServerEvent::error(&HeraldError::NotAuthenticated))
                .await;
            return;
        };

        let reply = self.handle_request(user_id, request).await;
        self.respond(session_id, reply).await;
    }

    async fn handle_request(&self, user_id: UserId, request: ClientRequest) -> ServerEvent {
        let name = request.name();
        match request {
            ClientRequest::Authenticate { .. } => {
                ServerEvent::error(&HeraldError::AlreadyAuthenticated(user_id))
            }
            ClientRequest::Message {
                receiver_id,
                content,
            } => match self.relay.send_message(user_id, receiver_id, &content).await {
                Ok(receipt) => ServerEvent::MessageSent {
                    message_id: receipt.message_id,
                    receiver_id,
                    delivered: receipt.delivered,
                    created_at: receipt.created_at,
                },
                Err(e) => ServerEvent::error(&e),
            },
            ClientRequest::MarkRead { message_id } => {
                match self.relay.mark_read(message_id, user_id).await {
                    Ok(outcome) => ServerEvent::ack_ok(name, Some(outcome.message())),
                    Err(e) => ServerEvent::ack_err(name, &e),
                }
            }
            ClientRequest::Typing { receiver_id } => {
                match self.relay.send_typing(user_id, receiver_id).await {
                    Ok(()) => ServerEvent::ack_ok(name, None),
                    Err(e) => ServerEvent::ack_err(name, &e),
                }
            }
        }
    }

    async fn respond(&self, session_id: &SessionId, event: ServerEvent) {
        if let Err(e) = self.relay.supervisor().reply(session_id, event).await {
            debug!(session_id = %session_id.short(), error = %e, "reply not delivered");
        }
    }
}

/// Periodic stats log and limiter cleanup.
async fn stats_loop(relay: Relay, rate_limits: Arc<Mutex<AuthRateLimiter>>) {
    let mut interval = tokio::time::interval(STATS_INTERVAL);
    interval.tick().await;
    loop {
        interval.tick().await;
        let stats = relay.stats().await;
        info!(
            sessions = stats.sessions,
            online = stats.online,
            queued = stats.queued,
            "relay stats"
        );
        rate_limits.lock().await.gc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::RelaySettings;
    use crate::store::{MemoryStore, UserRecord};
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    fn config() -> ServerConfig {
        let mut config = ServerConfig::default();
        config.bind = [127, 0, 0, 1].into();
        config.port = 0;
        config.max_auth_attempts_per_minute = 3;
        config.users = [(1, "alice"), (2, "bob")]
            .map(|(id, name)| UserRecord {
                id: UserId(id),
                username: name.to_string(),
                email: String::new(),
            })
            .to_vec();
        config
    }

    async fn start() -> (SocketAddr, Relay, oneshot::Sender<()>) {
        start_with(config()).await
    }

    async fn start_with(config: ServerConfig) -> (SocketAddr, Relay, oneshot::Sender<()>) {
        let store = Arc::new(MemoryStore::with_users(config.users.clone()));
        let relay = Relay::new(RelaySettings::from(&config), store.clone(), store);
        let server = HeraldServer::new(config, relay.clone());
        let (addr, incoming) = server.listen().await.unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        tokio::spawn(Arc::new(server).serve(incoming, async {
            let _ = stop_rx.await;
        }));
        (addr, relay, stop_tx)
    }

    async fn client(addr: SocketAddr) -> Client {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();
        ws
    }

    async fn send(ws: &mut Client, json: serde_json::Value) {
        ws.send(Message::Text(json.to_string().into())).await.unwrap();
    }

    async fn next_json(ws: &mut Client) -> serde_json::Value {
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                Message::Ping(_) | Message::Pong(_) => continue,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    async fn login(addr: SocketAddr, user_id: u64) -> Client {
        let mut ws = client(addr).await;
        send(&mut ws, serde_json::json!({"type": "authenticate", "user_id": user_id})).await;
        let greeting = next_json(&mut ws).await;
        assert_eq!(greeting["type"], "authenticated");
        assert_eq!(greeting["user_id"], user_id);
        ws
    }

    #[tokio::test]
    async fn relays_messages_between_clients() {
        let (addr, _relay, _stop) = start().await;
        let mut alice = login(addr, 1).await;
        let mut bob = login(addr, 2).await;

        send(&mut alice, serde_json::json!({"type": "message", "receiver_id": 2, "content": "hi bob"})).await;
        let sent = next_json(&mut alice).await;
        assert_eq!(sent["type"], "message_sent");
        assert_eq!(sent["delivered"], true);

        let received = next_json(&mut bob).await;
        assert_eq!(received["type"], "new_message");
        assert_eq!(received["content"], "hi bob");
        assert_eq!(received["sender_id"], 1);

        send(&mut bob, serde_json::json!({"type": "mark_read", "message_id": received["message_id"]})).await;
        let ack = next_json(&mut bob).await;
        assert_eq!(ack["type"], "ack");
        assert_eq!(ack["status"], "success");
        let receipt = next_json(&mut alice).await;
        assert_eq!(receipt["type"], "message_read");
        assert_eq!(receipt["reader_id"], 2);
    }

    #[tokio::test]
    async fn requests_before_authentication_are_refused() {
        let (addr, _relay, _stop) = start().await;
        let mut ws = client(addr).await;
        send(&mut ws, serde_json::json!({"type": "typing", "receiver_id": 2})).await;
        let err = next_json(&mut ws).await;
        assert_eq!(err["type"], "error");
        assert_eq!(err["code"], "not_authenticated");

        ws.send(Message::Text("{not json".to_string().into())).await.unwrap();
        let err = next_json(&mut ws).await;
        assert_eq!(err["code"], "invalid_message");
    }

    #[tokio::test]
    async fn queued_messages_arrive_after_greeting() {
        let (addr, relay, _stop) = start().await;
        relay.send_message(UserId(1), UserId(2), "while you were out").await.unwrap();

        let mut bob = login(addr, 2).await;
        let queued = next_json(&mut bob).await;
        assert_eq!(queued["type"], "new_message");
        assert_eq!(queued["content"], "while you were out");
    }

    #[tokio::test]
    async fn disconnect_is_announced() {
        let (addr, relay, _stop) = start().await;
        let alice = login(addr, 1).await;
        let mut bob = login(addr, 2).await;
        drop(alice);

        let notice = next_json(&mut bob).await;
        assert_eq!(notice["type"], "user_disconnected");
        assert_eq!(notice["user_id"], 1);
        assert!(!relay.is_online(UserId(1)).await);
    }

    #[tokio::test]
    async fn authentication_is_rate_limited() {
        let (addr, _relay, _stop) = start().await;
        let mut ws = client(addr).await;
        for _ in 0..3 {
            send(&mut ws, serde_json::json!({"type": "authenticate", "user_id": 42})).await;
            assert_eq!(next_json(&mut ws).await["code"], "identity_not_found");
        }
        send(&mut ws, serde_json::json!({"type": "authenticate", "user_id": 1})).await;
        assert_eq!(next_json(&mut ws).await["code"], "rate_limited");
    }

    async fn close_code(ws: &mut Client) -> u16 {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(Some(frame)))) => return u16::from(frame.code),
                Some(Ok(_)) => continue,
                other => panic!("expected close frame, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn connection_over_capacity_is_refused_with_try_again_later() {
        let mut config = config();
        config.max_connections = 1;
        let (addr, relay, _stop) = start_with(config).await;
        let _alice = login(addr, 1).await;

        let mut refused = client(addr).await;
        let err = next_json(&mut refused).await;
        assert_eq!(err["type"], "error");
        assert_eq!(err["code"], "capacity_exceeded");
        assert_eq!(close_code(&mut refused).await, 1013);
        assert_eq!(relay.active_count().await, 1);
    }

    #[tokio::test]
    async fn shutdown_closes_clients() {
        let (addr, relay, stop) = start().await;
        let mut alice = login(addr, 1).await;
        stop.send(()).unwrap();

        assert_eq!(close_code(&mut alice).await, 1001);
        assert_eq!(relay.active_count().await, 0);
    }
}
