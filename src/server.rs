//! WebSocket endpoint.
//!
//! One upgrade endpoint carrying a bearer token. Each accepted socket gets
//! its own service thread that owns the tungstenite socket outright: reads
//! are blocking with the poll interval as a read timeout, and the same
//! thread sends heartbeat pings, drains the client's outbox and watches the
//! pong deadline. On death it submits a disconnect command and exits; the
//! hub decides what that means.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use tungstenite::accept_hdr;
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::http::StatusCode;
use tungstenite::protocol::WebSocket;
use tungstenite::Message;

use crate::client::Client;
use crate::error::{HubError, Result};
use crate::hub::{Command, Hub, SessionHandle};
use crate::protocol::Frame;
use crate::store::GameStore;

/// Environment contract. Values are tunable at build time; tests shrink
/// the timers.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub bind_addr: String,
    /// Low-level ping cadence.
    pub heartbeat_interval: Duration,
    /// No pong for this long means the reader is dead.
    pub heartbeat_timeout: Duration,
    /// Window after a socket drop in which a reconnect reattaches.
    pub reconnect_grace: Duration,
    pub write_deadline: Duration,
    /// Read-timeout tick of the service loop.
    pub poll_interval: Duration,
    pub outbox_capacity: usize,
    pub workers: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9090".to_string(),
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(30),
            reconnect_grace: Duration::from_secs(8),
            write_deadline: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
            outbox_capacity: 256,
            workers: 4,
        }
    }
}

/// Credential verification happens out-of-band; the hub only consumes a
/// validated user id.
pub trait TokenAuth: Send + Sync {
    fn authenticate(&self, token: &str) -> Option<i64>;
}

impl<F> TokenAuth for F
where
    F: Fn(&str) -> Option<i64> + Send + Sync,
{
    fn authenticate(&self, token: &str) -> Option<i64> {
        self(token)
    }
}

/// The accept loop around a [`Hub`].
pub struct HubServer {
    hub: Arc<Hub>,
    listener: TcpListener,
    auth: Arc<dyn TokenAuth>,
}

impl HubServer {
    pub fn bind(
        cfg: HubConfig,
        store: Arc<dyn GameStore>,
        auth: Arc<dyn TokenAuth>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(&cfg.bind_addr)?;
        let hub = Hub::new(cfg, store);
        Ok(Self { hub, listener, auth })
    }

    pub fn hub(&self) -> Arc<Hub> {
        Arc::clone(&self.hub)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections forever, one service thread per socket.
    pub fn run(&self) -> Result<()> {
        let addr = self.listener.local_addr()?;
        info!(%addr, "hub listening");
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let hub = Arc::clone(&self.hub);
                    let auth = Arc::clone(&self.auth);
                    thread::Builder::new()
                        .name("hub-conn".to_string())
                        .spawn(move || {
                            if let Err(e) = serve_socket(&hub, &auth, stream) {
                                debug!(%peer, error = %e, "connection ended");
                            }
                        })?;
                }
                Err(e) => warn!(error = %e, "accept failed"),
            }
        }
    }

    /// Run the accept loop on a background thread. Handy for embedding and
    /// for tests.
    pub fn spawn(self) -> Result<(Arc<Hub>, SocketAddr, thread::JoinHandle<()>)> {
        let hub = Arc::clone(&self.hub);
        let addr = self.listener.local_addr()?;
        let handle = thread::Builder::new()
            .name("hub-accept".to_string())
            .spawn(move || {
                if let Err(e) = self.run() {
                    warn!(error = %e, "hub server terminated");
                }
            })?;
        Ok((hub, addr, handle))
    }
}

fn serve_socket(hub: &Arc<Hub>, auth: &Arc<dyn TokenAuth>, stream: TcpStream) -> Result<()> {
    stream.set_nodelay(true).ok();

    let mut user_id = None;
    let ws = accept_hdr(stream, |req: &Request, resp: Response| {
        match bearer_token(req).and_then(|token| auth.authenticate(&token)) {
            Some(id) => {
                user_id = Some(id);
                Ok(resp)
            }
            None => Err(unauthorized()),
        }
    })
    .map_err(|e| match e {
        tungstenite::HandshakeError::Interrupted(_) => HubError::protocol("handshake interrupted"),
        tungstenite::HandshakeError::Failure(err) => HubError::WebSocket(err),
    })?;
    let user_id = user_id.ok_or_else(|| HubError::protocol("handshake rejected"))?;

    let session = hub.open_session(user_id);
    service_loop(hub, session, ws)
}

fn service_loop(hub: &Arc<Hub>, session: SessionHandle, mut ws: WebSocket<TcpStream>) -> Result<()> {
    let cfg = hub.config().clone();
    let SessionHandle { client, generation } = session;
    let user = client.id();

    ws.get_ref().set_read_timeout(Some(cfg.poll_interval))?;
    ws.get_ref().set_write_timeout(Some(cfg.write_deadline))?;

    let mut last_ping = Instant::now();
    'conn: loop {
        if client.socket_gen() != generation {
            // A reconnect took over; the new socket owns the outbox now.
            debug!(user, "socket replaced, standing down");
            return Ok(());
        }
        if client.killed() {
            break 'conn;
        }

        match ws.read() {
            Ok(Message::Text(text)) => match Frame::decode(text.as_str()) {
                Ok(frame) => {
                    if let Some(cmd) = command_for(&client, frame) {
                        hub.submit(cmd);
                    }
                }
                Err(HubError::UnknownMessageType(kind)) => {
                    warn!(user, message_type = kind, "unknown message type, dropping frame");
                }
                Err(e) => {
                    warn!(user, error = %e, "malformed frame, closing connection");
                    break 'conn;
                }
            },
            Ok(Message::Ping(payload)) => {
                let _ = ws.send(Message::Pong(payload));
            }
            Ok(Message::Pong(_)) => hub.submit(Command::Pong { user }),
            Ok(Message::Close(_)) => break 'conn,
            Ok(_) => {}
            Err(tungstenite::Error::Io(ref e)) if would_block(e) => {}
            Err(e) => {
                debug!(user, error = %e, "socket read failed");
                break 'conn;
            }
        }

        if last_ping.elapsed() >= cfg.heartbeat_interval {
            last_ping = Instant::now();
            if ws.send(Message::Ping(Vec::new().into())).is_err() {
                break 'conn;
            }
        }
        if client.last_pong().elapsed() > cfg.heartbeat_timeout {
            warn!(user, "heartbeat timeout, dropping connection");
            break 'conn;
        }

        for frame in client.outbox().drain() {
            if let Err(e) = ws.send(Message::Text(frame.encode().into())) {
                debug!(user, error = %e, "socket write failed");
                break 'conn;
            }
        }
    }

    let _ = ws.close(None);
    if client.socket_gen() == generation {
        hub.submit(Command::Disconnect { user, generation });
    }
    Ok(())
}

/// Map an inbound frame to a hub command. Resign is folded into `end` with
/// the already-computed winner. Server-to-client frames echoed back by a
/// confused client are dropped.
fn command_for(client: &Arc<Client>, frame: Frame) -> Option<Command> {
    let user = client.id();
    match frame {
        Frame::MatchRequest => Some(Command::Match { user }),
        Frame::Move { from, to } => Some(Command::Move { user, from, to }),
        Frame::GameEnd { winner } => Some(Command::End { user, winner }),
        Frame::Resign => Some(Command::End {
            user,
            winner: client.role().opposite(),
        }),
        Frame::JoinRoom { room_id } => Some(Command::Join { user, room: room_id }),
        Frame::CreateRoom => Some(Command::Create { user }),
        Frame::UndoRequest => Some(Command::UndoRequest { user }),
        Frame::UndoResponse { accepted } => Some(Command::UndoResponse { user, accepted }),
        Frame::DrawRequest => Some(Command::DrawRequest { user }),
        Frame::DrawResponse { accepted } => Some(Command::DrawResponse { user, accepted }),
        Frame::Chat { content, .. } => Some(Command::Chat { user, content }),
        _ => None,
    }
}

fn bearer_token(req: &Request) -> Option<String> {
    if let Some(query) = req.uri().query() {
        for pair in query.split('&') {
            if let Some(token) = pair.strip_prefix("token=") {
                if !token.is_empty() {
                    return Some(token.to_string());
                }
            }
        }
    }
    req.headers()
        .get("Authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|token| token.to_string())
}

fn unauthorized() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("unauthorized".to_string()));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
}

fn would_block(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}
