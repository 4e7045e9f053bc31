//! Transport addressing and close semantics.
//!
//! Clients connect to `{prefix}/{room_id}`; with the default prefix that is
//! `/ws/yjs/{room_id}`. After the handshake every binary message is one
//! opaque update. There is no framing of our own on top of WebSocket.
//!
//! Close codes used by the server:
//! ```text
//! ┌──────┬──────────────────────┬──────────────────────────────────┐
//! │ code │ tungstenite          │ when                             │
//! ├──────┼──────────────────────┼──────────────────────────────────┤
//! │ 1000 │ CloseCode::Normal    │ client asked to close            │
//! │ 1001 │ CloseCode::Away      │ server shutting down             │
//! │ 1007 │ CloseCode::Invalid   │ path carries no room id          │
//! │ 1008 │ CloseCode::Policy    │ unknown room / not a member      │
//! │ 1011 │ CloseCode::Error     │ room state could not be loaded   │
//! │ 1013 │ CloseCode::Again     │ outbound queue overflowed        │
//! └──────┴──────────────────────┴──────────────────────────────────┘
//! ```

use std::fmt;

use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;

/// Default URL prefix in front of the room id.
pub const DEFAULT_PATH_PREFIX: &str = "/ws/yjs";

/// Why a request path could not be mapped to a room.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomIdError {
    /// Path is not under the configured prefix
    #[error("path {path:?} is not under {prefix:?}")]
    WrongPrefix { path: String, prefix: String },
    /// Nothing after the prefix
    #[error("room id required")]
    Missing,
    /// More than one segment, or characters not allowed in a room id
    #[error("malformed room id {0:?}")]
    Malformed(String),
}

/// Extract the room id from a request path such as `/ws/yjs/doc_42?v=1`.
///
/// The room id is the single segment directly under `prefix`. Query strings
/// and one trailing slash are ignored.
pub fn resolve_room_id(path: &str, prefix: &str) -> Result<String, RoomIdError> {
    let path_only = path.split(['?', '#']).next().unwrap_or_default();
    let prefix = prefix.trim_end_matches('/');

    let rest = path_only
        .strip_prefix(prefix)
        .ok_or_else(|| RoomIdError::WrongPrefix {
            path: path_only.to_string(),
            prefix: prefix.to_string(),
        })?;

    // "/ws/yjsfoo" must not match prefix "/ws/yjs"
    let rest = match rest.strip_prefix('/') {
        Some(rest) => rest,
        None if rest.is_empty() => return Err(RoomIdError::Missing),
        None => {
            return Err(RoomIdError::WrongPrefix {
                path: path_only.to_string(),
                prefix: prefix.to_string(),
            })
        }
    };

    let segment = rest.strip_suffix('/').unwrap_or(rest);
    if segment.is_empty() {
        return Err(RoomIdError::Missing);
    }
    if !is_valid_room_id(segment) {
        return Err(RoomIdError::Malformed(segment.to_string()));
    }
    Ok(segment.to_string())
}

/// Room ids are non-empty and limited to URL-safe characters.
pub fn is_valid_room_id(room_id: &str) -> bool {
    !room_id.is_empty()
        && room_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~' | ':'))
}

/// Reason the server ends a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Client sent a close frame or the stream ended
    ClientClosed,
    /// Request path did not name a room
    BadRequest,
    /// Room is not backed by a known document
    UnknownRoom,
    /// Session is no longer a member of its room
    NotMember,
    /// Outbound queue overflowed
    SlowConsumer,
    /// Removed from the room after a failed delivery
    Evicted,
    /// Initial state could not be produced
    InternalError,
    /// Server is shutting down
    ServerShutdown,
    /// The socket failed; no close frame can be sent
    TransportError,
}

impl CloseReason {
    pub fn code(&self) -> CloseCode {
        match self {
            CloseReason::ClientClosed => CloseCode::Normal,
            CloseReason::BadRequest => CloseCode::Invalid,
            CloseReason::UnknownRoom | CloseReason::NotMember => CloseCode::Policy,
            CloseReason::SlowConsumer | CloseReason::Evicted => CloseCode::Again,
            CloseReason::InternalError => CloseCode::Error,
            CloseReason::ServerShutdown => CloseCode::Away,
            CloseReason::TransportError => CloseCode::Abnormal,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            CloseReason::ClientClosed => "bye",
            CloseReason::BadRequest => "room id required",
            CloseReason::UnknownRoom => "unknown room",
            CloseReason::NotMember => "not a room member",
            CloseReason::SlowConsumer => "outbound queue overflow",
            CloseReason::Evicted => "removed from room",
            CloseReason::InternalError => "room unavailable",
            CloseReason::ServerShutdown => "server shutting down",
            CloseReason::TransportError => "transport error",
        }
    }

    /// Close frame announcing this reason.
    pub fn frame(&self) -> CloseFrame {
        CloseFrame {
            code: self.code(),
            reason: self.reason().into(),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.reason(), u16::from(self.code()))
    }
}
