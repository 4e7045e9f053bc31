//! Connection lifecycle.
//!
//! One task per WebSocket connection, walking
//! `Connecting → Active → Closing → Closed`:
//!
//! - **Connecting**: handshake, room id resolved from the request path.
//! - **Active**: registered with the hub; inbound binary frames are updates,
//!   outbound frames come from the session's bounded queue.
//! - **Closing**: client close, transport error, kick or shutdown. A close
//!   frame is sent best-effort.
//! - **Closed**: the hub's `leave` has run exactly once.

use futures_util::{SinkExt, StreamExt};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use uuid::Uuid;

use crate::hub::SyncHub;
use crate::protocol::{resolve_room_id, CloseReason};

/// Bytes queued for one session. Shared between all targets of a fan-out.
pub type Frame = Arc<Vec<u8>>;

/// Unique id of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle states of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (SessionState::Connecting, SessionState::Active)
                | (SessionState::Connecting, SessionState::Closing)
                | (SessionState::Active, SessionState::Closing)
                | (SessionState::Closing, SessionState::Closed)
        )
    }
}

/// Why a frame could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// Queue at capacity; the reader is too slow
    #[error("outbound queue full")]
    Full,
    /// The session task is gone
    #[error("session closed")]
    Closed,
}

/// Sending side of a session, held by the room registry.
///
/// The session task holds no clone of the outbound sender, so once every
/// handle is dropped (the session left or was removed from its room) the
/// task's queue reports closed.
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    outbound: mpsc::Sender<Frame>,
    kick: Arc<watch::Sender<Option<CloseReason>>>,
}

/// Receiving side of a session, owned by its connection task.
pub struct SessionInbox {
    pub frames: mpsc::Receiver<Frame>,
    pub kicked: watch::Receiver<Option<CloseReason>>,
}

impl SessionHandle {
    /// New session with an outbound queue of `capacity` frames.
    pub fn new(capacity: usize) -> (Self, SessionInbox) {
        let (outbound, frames) = mpsc::channel(capacity.max(1));
        let (kick, kicked) = watch::channel(None);
        let handle = Self {
            id: SessionId::new(),
            outbound,
            kick: Arc::new(kick),
        };
        (handle, SessionInbox { frames, kicked })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Queue a frame without waiting.
    pub fn try_deliver(&self, frame: Frame) -> Result<(), DeliveryError> {
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Ask the session task to close with `reason`.
    pub fn kick(&self, reason: CloseReason) {
        self.kick.send_replace(Some(reason));
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("queued", &(self.outbound.max_capacity() - self.outbound.capacity()))
            .finish()
    }
}

/// Lifecycle bookkeeping for one connection.
struct Lifecycle {
    peer: SocketAddr,
    state: SessionState,
}

impl Lifecycle {
    fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            state: SessionState::Connecting,
        }
    }

    fn advance(&mut self, next: SessionState) {
        if self.state.can_transition_to(next) {
            log::trace!("Connection {}: {:?} -> {:?}", self.peer, self.state, next);
            self.state = next;
        } else {
            log::warn!(
                "Connection {}: ignoring illegal transition {:?} -> {:?}",
                self.peer,
                self.state,
                next
            );
        }
    }
}

type WsSink = futures_util::stream::SplitSink<WebSocketStream<TcpStream>, Message>;

/// Send a close frame, ignoring transport errors.
async fn send_close(sink: &mut WsSink, reason: &CloseReason) {
    let message = match reason {
        // Peer already went away; just finish the close handshake
        CloseReason::ClientClosed | CloseReason::TransportError => None,
        other => Some(Message::Close(Some(other.frame()))),
    };
    if let Some(message) = message {
        if let Err(e) = sink.send(message).await {
            log::debug!("Close frame not delivered: {e}");
        }
    }
    let _ = sink.close().await;
}

/// Serve one accepted TCP connection until it closes.
pub async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    hub: Arc<SyncHub>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), tungstenite::Error> {
    let mut lifecycle = Lifecycle::new(peer);

    let mut request_path = None;
    let ws = accept_hdr_async(
        stream,
        |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            request_path = Some(req.uri().path().to_string());
            Ok(resp)
        },
    )
    .await?;
    let (mut sink, mut inbound) = ws.split();

    let path = request_path.unwrap_or_default();
    let room_id = match resolve_room_id(&path, &hub.config().path_prefix) {
        Ok(room_id) => room_id,
        Err(e) => {
            log::warn!("Rejecting connection from {peer} on {path:?}: {e}");
            lifecycle.advance(SessionState::Closing);
            send_close(&mut sink, &CloseReason::BadRequest).await;
            lifecycle.advance(SessionState::Closed);
            return Ok(());
        }
    };

    let (handle, mut inbox) = SessionHandle::new(hub.config().outbound_queue);
    let session_id = handle.id();
    if let Err(reason) = hub.join(&room_id, handle).await {
        log::warn!("Session {session_id} from {peer} refused for room {room_id}: {reason}");
        lifecycle.advance(SessionState::Closing);
        send_close(&mut sink, &reason).await;
        lifecycle.advance(SessionState::Closed);
        return Ok(());
    }
    lifecycle.advance(SessionState::Active);
    log::info!("Session {session_id} from {peer} active in room {room_id}");

    let reason = loop {
        tokio::select! {
            biased;

            Ok(()) = inbox.kicked.changed() => {
                let reason = inbox.kicked.borrow().clone();
                break reason.unwrap_or(CloseReason::Evicted);
            }

            _ = shutdown.changed() => break CloseReason::ServerShutdown,

            frame = inbox.frames.recv() => match frame {
                Some(frame) => {
                    let message = Message::Binary(frame.as_ref().clone().into());
                    if let Err(e) = sink.send(message).await {
                        log::debug!("Session {session_id}: send failed: {e}");
                        break CloseReason::TransportError;
                    }
                }
                // Every handle dropped: no longer in the room
                None => break CloseReason::Evicted,
            },

            message = inbound.next() => match message {
                Some(Ok(Message::Binary(payload))) => {
                    match hub.handle_update(&room_id, &session_id, &payload).await {
                        Ok(delivery) => log::trace!(
                            "Session {session_id}: update of {} bytes delivered to {}",
                            payload.len(),
                            delivery.delivered
                        ),
                        Err(e) => match e.close_reason() {
                            Some(reason) => {
                                log::warn!("Session {session_id}: {e}, closing");
                                break reason;
                            }
                            None => log::warn!("Session {session_id}: update rejected: {e}"),
                        },
                    }
                }
                Some(Ok(Message::Text(_))) => {
                    log::warn!("Session {session_id}: text frame rejected, updates must be binary");
                }
                Some(Ok(Message::Close(_))) | None => break CloseReason::ClientClosed,
                // Pongs to pings are queued by tungstenite itself
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::debug!("Session {session_id}: transport error: {e}");
                    break CloseReason::TransportError;
                }
            },
        }
    };

    lifecycle.advance(SessionState::Closing);
    send_close(&mut sink, &reason).await;
    hub.leave(&room_id, &session_id).await;
    lifecycle.advance(SessionState::Closed);
    log::info!("Session {session_id} left room {room_id}: {reason}");
    Ok(())
}
