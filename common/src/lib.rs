//! NetPulse helper common library
//!
//! Shared between the privileged helper and its unprivileged clients:
//!
//! - Message envelope and payload definitions
//! - Length-prefixed framing over a local byte stream
//! - Shared-secret provisioning and HMAC request signing
//! - Unix socket setup and peer credential lookup
//! - Well-known paths and protocol limits

/// HMAC-SHA256 signing and freshness-checked verification
pub mod auth;

/// Paths and protocol constants
pub mod config;

/// Unix socket listener, connector and peer credentials
pub mod platform_socket;

/// Message envelope and payload types
pub mod protocol;

/// Shared secret generation, persistence and erasure
pub mod secret;

/// Length-prefixed message framing
pub mod transport;

// Re-export commonly used types for convenience
pub use config::{HelperPaths, MAX_MESSAGE_SIZE, SECRET_FILE_NAME, SOCKET_NAME};
pub use platform_socket::{ClientCredentials, PlatformListener};
pub use protocol::{ErrorCode, Message, MessageType};
pub use secret::{SecretError, SecretStore, SharedSecret};
pub use transport::{MessageStream, TransportError};
