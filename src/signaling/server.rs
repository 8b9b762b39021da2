use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{Bytes, Message};
use tracing::{debug, error, info, warn};

use super::actor::CoordinatorHandle;
use super::messages::{ClientMessage, ServerMessage};
use super::registry::JoinOutcome;
use super::types::{ConnectionId, OutboundMessage};

pub const DEFAULT_SIGNALING_PORT: u16 = 3001;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// WebSocket ping/pong liveness settings
#[derive(Debug, Clone, Copy)]
pub struct Keepalive {
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
}

impl Default for Keepalive {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
        }
    }
}

pub struct SignalingServer {
    listener: TcpListener,
    handle: CoordinatorHandle,
    keepalive: Keepalive,
}

impl SignalingServer {
    pub async fn bind(addr: &str, handle: CoordinatorHandle) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Signaling server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            handle,
            keepalive: Keepalive::default(),
        })
    }

    pub fn with_keepalive(mut self, keepalive: Keepalive) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> std::io::Result<()> {
        loop {
            let (stream, addr) = self.listener.accept().await?;
            let handle = self.handle.clone();
            let keepalive = self.keepalive;

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, handle, keepalive).await {
                    error!("Connection error from {}: {}", addr, e);
                }
            });
        }
    }
}

/// Outstanding-ping bookkeeping for one connection.
#[derive(Debug, Default)]
struct PongWatch {
    deadline: Option<Instant>,
}

impl PongWatch {
    fn awaiting(&self) -> bool {
        self.deadline.is_some()
    }

    fn ping_sent(&mut self, timeout: Duration) {
        self.deadline = Some(Instant::now() + timeout);
    }

    fn pong_received(&mut self) {
        self.deadline = None;
    }

    /// Resolves once the pending ping has gone unanswered too long; never
    /// resolves while no ping is outstanding.
    async fn expired(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    handle: CoordinatorHandle,
    keepalive: Keepalive,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (ws_tx, mut ws_rx) = ws_stream.split();

    let conn = ConnectionId::generate();
    info!("WebSocket connection {} from {}", conn, addr);

    let (tx, rx) = mpsc::unbounded_channel::<OutboundMessage>();
    let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel::<Message>();
    let writer = spawn_writer(ws_tx, rx, ctrl_rx);

    let mut ping_interval = tokio::time::interval(keepalive.ping_interval);
    let mut pong = PongWatch::default();

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if pong.awaiting() {
                    warn!("No Pong received, disconnecting {}", conn);
                    break;
                }
                if ctrl_tx.send(Message::Ping(Bytes::new())).is_err() {
                    break;
                }
                pong.ping_sent(keepalive.pong_timeout);
                debug!("Ping sent to {}", conn);
            }

            _ = pong.expired() => {
                warn!("Pong timeout, disconnecting {}", conn);
                break;
            }

            frame = ws_rx.next() => {
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        warn!("WebSocket error on {}: {}", conn, e);
                        break;
                    }
                    None => break,
                };
                if handle_frame(frame, conn, &tx, &handle, &mut pong).await.is_break() {
                    break;
                }
            }
        }
    }

    // Close, error and liveness failure all converge on the same cleanup.
    handle.disconnect(conn).await;

    writer.abort();
    info!("WebSocket disconnected: {} ({})", conn, addr);

    Ok(())
}

/// Drain room events and control frames into the socket.
fn spawn_writer(
    mut ws_tx: WsSink,
    mut rx: mpsc::UnboundedReceiver<OutboundMessage>,
    mut ctrl_rx: mpsc::UnboundedReceiver<Message>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                Some(msg) = rx.recv() => Message::Text(msg.into_inner()),
                Some(ctrl) = ctrl_rx.recv() => ctrl,
                else => break,
            };
            if ws_tx.send(frame).await.is_err() {
                break;
            }
        }
    })
}

async fn handle_frame(
    frame: Message,
    conn: ConnectionId,
    tx: &mpsc::UnboundedSender<OutboundMessage>,
    handle: &CoordinatorHandle,
    pong: &mut PongWatch,
) -> ControlFlow<()> {
    match frame {
        Message::Text(text) => {
            if let Err(e) = handle_text_message(&text, conn, tx, handle).await {
                warn!("Message handling error on {}: {}", conn, e);
            }
        }
        Message::Pong(_) => {
            pong.pong_received();
            debug!("Pong received from {}", conn);
        }
        Message::Close(_) => {
            info!("Close received from {}", conn);
            return ControlFlow::Break(());
        }
        Message::Binary(_) => debug!("Ignoring binary frame from {}", conn),
        _ => {}
    }
    ControlFlow::Continue(())
}

async fn handle_text_message(
    text: &str,
    conn: ConnectionId,
    tx: &mpsc::UnboundedSender<OutboundMessage>,
    handle: &CoordinatorHandle,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let client_msg = match ClientMessage::parse(text) {
        Ok(m) => m,
        Err(e) => {
            debug!("Rejecting frame from {}: {}", conn, e);
            let err = ServerMessage::Error {
                message: format!("Invalid message: {}", e),
            };
            let _ = tx.send(err.encode()?);
            return Ok(());
        }
    };

    match client_msg {
        ClientMessage::JoinRoom { room_id, user_id } => {
            let outcome = handle.join(conn, room_id.clone(), user_id, tx.clone()).await?;
            if outcome == JoinOutcome::RoomFull {
                debug!("{} could not join full room {}", conn, room_id);
            }
        }

        ClientMessage::Signal {
            kind,
            payload,
            room_id,
        } => {
            handle.relay(conn, kind, payload, room_id).await;
        }

        ClientMessage::LeaveRoom { room_id } => {
            handle.leave(conn, room_id).await;
        }
    }

    Ok(())
}
