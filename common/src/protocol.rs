//! Message envelope and the type-specific payload structures carried inside it.
//!
//! Every frame on the wire holds one [`Message`]. Its `payload` is itself a
//! bincode-encoded structure whose type is implied by [`MessageType`]:
//!
//! | Type                | Client → helper        | Helper → client           |
//! |---------------------|------------------------|---------------------------|
//! | `Authenticate`      | [`AuthRequest`]        | [`AuthResponse`]          |
//! | `ConnectionStats`   | empty                  | [`ConnectionStatsResponse`] |
//! | `ProcessStats`      | [`ProcessStatsRequest`] | [`ProcessStatsResponse`] |
//! | `Heartbeat`         | empty                  | [`HeartbeatResponse`]     |
//! | `Shutdown`          | empty                  | [`ShutdownResponse`]      |
//! | `Error`             | never                  | [`ErrorResponse`]         |

use std::{fmt, net::IpAddr};

use serde::{Deserialize, Serialize};

/// Discriminant of an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Signed identity claim; the only request allowed before a session exists
    Authenticate,
    /// Aggregate per-process connection statistics
    ConnectionStats,
    /// Per-process detail, optionally filtered by PID
    ProcessStats,
    /// Liveness check that also reports session expiry
    Heartbeat,
    /// Ends the connection (and, if configured, the helper)
    Shutdown,
    /// Helper-originated error reply
    Error,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Authenticate => "authenticate",
            Self::ConnectionStats => "connection-stats",
            Self::ProcessStats => "process-stats",
            Self::Heartbeat => "heartbeat",
            Self::Shutdown => "shutdown",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Envelope exchanged over the helper socket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Kind of request or reply
    pub kind:       MessageType,
    /// Caller-chosen correlation id, echoed in the reply
    pub request_id: String,
    /// Type-specific payload bytes
    pub payload:    Vec<u8>,
}

impl Message {
    /// Creates an envelope around an already-encoded payload
    pub fn new(kind: MessageType, request_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            kind,
            request_id: request_id.into(),
            payload,
        }
    }

    /// Creates an envelope with no payload
    pub fn empty(kind: MessageType, request_id: impl Into<String>) -> Self {
        Self::new(kind, request_id, Vec::new())
    }
}

/// Signed identity claim sent by the unprivileged client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    /// PID the client claims to run as
    pub client_pid:      u32,
    /// Unix seconds at signing time
    pub timestamp:       u64,
    /// Base64 HMAC-SHA256 over `"{client_pid}:{timestamp}"`
    pub signature:       String,
    /// Executable the client claims to run; checked independently of the signature
    pub executable_path: String,
}

/// Outcome of an authentication attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResponse {
    pub success:       bool,
    pub session_id:    Option<String>,
    /// Unix seconds after which the session is no longer valid
    pub expires_at:    Option<u64>,
    pub error_message: Option<String>,
}

impl AuthResponse {
    pub fn granted(session_id: String, expires_at: u64) -> Self {
        Self {
            success:       true,
            session_id:    Some(session_id),
            expires_at:    Some(expires_at),
            error_message: None,
        }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            success:       false,
            session_id:    None,
            expires_at:    None,
            error_message: Some(reason.into()),
        }
    }
}

/// Traffic totals for one process.
///
/// Byte counts are estimated from kernel socket queue depths at the last
/// refresh, not cumulative transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessTraffic {
    pub pid:              u32,
    pub process_name:     String,
    pub bytes_sent:       u64,
    pub bytes_received:   u64,
    pub connection_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatsResponse {
    pub processes:         Vec<ProcessTraffic>,
    pub total_connections: u32,
    /// Unix seconds when the snapshot was taken
    pub captured_at:       u64,
}

/// Selects which processes a `ProcessStats` request reports on
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStatsRequest {
    /// `None` reports every process with at least one tracked connection
    pub pids: Option<Vec<u32>>,
}

/// One established TCP connection attributed to a process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub local_address:  IpAddr,
    pub local_port:     u16,
    pub remote_address: IpAddr,
    pub remote_port:    u16,
    pub tx_queue_bytes: u64,
    pub rx_queue_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessDetail {
    pub traffic:     ProcessTraffic,
    pub connections: Vec<ConnectionInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStatsResponse {
    pub processes:   Vec<ProcessDetail>,
    pub captured_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub server_time:        u64,
    pub session_expires_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownResponse {
    /// Whether the helper process itself is stopping, not just this connection
    pub helper_stopping: bool,
}

/// Category of a helper-originated error reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Per-second request ceiling exceeded; the connection stays open
    RateLimited,
    /// No session has been established on this connection
    Unauthenticated,
    /// The connection's session expired or was evicted; re-authenticate
    SessionExpired,
    /// Payload could not be decoded or the message type is not a request
    BadRequest,
    /// Unexpected helper-side failure
    Internal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RateLimited => "rate limited",
            Self::Unauthenticated => "unauthenticated",
            Self::SessionExpired => "session expired",
            Self::BadRequest => "bad request",
            Self::Internal => "internal error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code:    ErrorCode,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}
