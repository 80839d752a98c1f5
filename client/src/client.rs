use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use netpulse_common::{
    auth,
    config::HelperPaths,
    platform_socket::connect_socket,
    protocol::{
        AuthRequest, AuthResponse, ConnectionStatsResponse, ErrorCode, ErrorResponse,
        HeartbeatResponse, Message, MessageType, ProcessStatsRequest, ProcessStatsResponse,
        ShutdownResponse,
    },
    secret::{SecretError, SecretStore, SharedSecret},
    transport::{deserialize_payload, serialize_payload, MessageStream, TransportError},
};
use serde::{de::DeserializeOwned, Serialize};
use tokio::net::UnixStream;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("{0}")]
    Connect(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("cannot load shared secret: {0}")]
    Secret(#[from] SecretError),

    #[error("no shared secret at {0:?}; is the helper running?")]
    SecretMissing(PathBuf),

    #[error("cannot determine own executable: {0}")]
    Executable(#[from] io::Error),

    #[error("authentication rejected: {0}")]
    AuthenticationFailed(String),

    #[error("helper replied {code}: {message}")]
    Server { code: ErrorCode, message: String },

    #[error("expected a {expected} reply, got {got}")]
    UnexpectedReply {
        expected: MessageType,
        got:      MessageType,
    },

    #[error("reply for request {got} while waiting for {expected}")]
    RequestIdMismatch { expected: String, got: String },

    #[error("helper closed the connection")]
    Disconnected,

    #[error("no reply within {0:?}")]
    Timeout(Duration),
}

impl ClientError {
    /// True for errors after which authenticating again may succeed
    pub fn needs_reauthentication(&self) -> bool {
        matches!(
            self,
            Self::Server {
                code: ErrorCode::SessionExpired | ErrorCode::Unauthenticated,
                ..
            }
        )
    }
}

pub type Result<T, E = ClientError> = std::result::Result<T, E>;

/// Configuration for the helper client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Path of the helper's Unix socket
    pub socket_path: PathBuf,
    /// Path of the shared secret written by the helper
    pub secret_path: PathBuf,
    /// Time to wait for each reply
    pub timeout:     Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from_paths(HelperPaths::for_user(current_uid()))
    }
}

impl ClientConfig {
    /// Creates a client configuration for the current user's runtime directory
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_paths(paths: HelperPaths) -> Self {
        Self {
            socket_path: paths.socket_path,
            secret_path: paths.secret_path,
            timeout:     Duration::from_secs(10),
        }
    }

    pub fn with_socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = path.into();
        self
    }

    pub fn with_secret_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.secret_path = path.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[cfg(unix)]
fn current_uid() -> u32 {
    nix::unistd::getuid().as_raw()
}

#[cfg(not(unix))]
fn current_uid() -> u32 {
    0
}

/// Session granted by the helper
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: String,
    /// Unix seconds
    pub expires_at: u64,
}

/// Async client for the privileged helper.
///
/// The helper binds a session to the connection it was granted on, so one
/// `HelperClient` corresponds to one session.
pub struct HelperClient {
    stream:  MessageStream<UnixStream>,
    timeout: Duration,
    session: Option<SessionInfo>,
}

impl HelperClient {
    /// Connects to the helper socket named in `config`
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        let stream = connect_socket(&config.socket_path)
            .await
            .map_err(|e| ClientError::Connect(format!("{e:#}")))?;
        tracing::debug!("Connected to helper at {}", config.socket_path.display());
        Ok(Self::from_stream(stream, config.timeout))
    }

    /// Wraps an already connected stream
    pub fn from_stream(stream: UnixStream, timeout: Duration) -> Self {
        Self {
            stream: MessageStream::new(stream),
            timeout,
            session: None,
        }
    }

    /// Connects, loads the secret and authenticates in one step
    pub async fn connect_authenticated(config: &ClientConfig) -> Result<Self> {
        let secret = load_secret(&config.secret_path)?;
        let mut client = Self::connect(config).await?;
        client.authenticate(&secret).await?;
        Ok(client)
    }

    pub fn session(&self) -> Option<&SessionInfo> {
        self.session.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.is_some()
    }

    /// Proves possession of the shared secret on behalf of this process
    pub async fn authenticate(&mut self, secret: &SharedSecret) -> Result<SessionInfo> {
        let client_pid = std::process::id();
        let timestamp = auth::unix_now();
        let executable_path = std::env::current_exe()?.to_string_lossy().into_owned();

        let request = AuthRequest {
            client_pid,
            timestamp,
            signature: auth::sign(client_pid, timestamp, secret),
            executable_path,
        };

        let response: AuthResponse = self.request(MessageType::Authenticate, &request).await?;
        if !response.success {
            self.session = None;
            return Err(ClientError::AuthenticationFailed(
                response
                    .error_message
                    .unwrap_or_else(|| "no reason given".to_string()),
            ));
        }

        let (Some(session_id), Some(expires_at)) = (response.session_id, response.expires_at)
        else {
            return Err(ClientError::AuthenticationFailed(
                "helper granted a session without an id".to_string(),
            ));
        };

        tracing::info!(expires_at, "Authenticated with helper");
        let session = SessionInfo {
            session_id,
            expires_at,
        };
        self.session = Some(session.clone());
        Ok(session)
    }

    pub async fn connection_stats(&mut self) -> Result<ConnectionStatsResponse> {
        self.request_empty(MessageType::ConnectionStats).await
    }

    /// Per-process detail; `None` reports every process with connections
    pub async fn process_stats(&mut self, pids: Option<Vec<u32>>) -> Result<ProcessStatsResponse> {
        self.request(MessageType::ProcessStats, &ProcessStatsRequest { pids })
            .await
    }

    pub async fn heartbeat(&mut self) -> Result<HeartbeatResponse> {
        self.request_empty(MessageType::Heartbeat).await
    }

    /// Ends the session; the helper closes the connection afterwards
    pub async fn shutdown(mut self) -> Result<ShutdownResponse> {
        let response = self.request_empty(MessageType::Shutdown).await?;
        self.session = None;
        Ok(response)
    }

    async fn request<Req: Serialize, Resp: DeserializeOwned>(
        &mut self,
        kind: MessageType,
        body: &Req,
    ) -> Result<Resp> {
        let payload = serialize_payload(body)?;
        self.exchange(Message::new(kind, new_request_id(), payload))
            .await
    }

    async fn request_empty<Resp: DeserializeOwned>(&mut self, kind: MessageType) -> Result<Resp> {
        self.exchange(Message::empty(kind, new_request_id())).await
    }

    async fn exchange<Resp: DeserializeOwned>(&mut self, message: Message) -> Result<Resp> {
        tracing::debug!(kind = %message.kind, request = %message.request_id, "Sending request");
        self.stream.send_message(&message).await?;

        let reply = tokio::time::timeout(self.timeout, self.stream.recv_message())
            .await
            .map_err(|_| ClientError::Timeout(self.timeout))??
            .ok_or(ClientError::Disconnected)?;

        if reply.request_id != message.request_id {
            return Err(ClientError::RequestIdMismatch {
                expected: message.request_id,
                got:      reply.request_id,
            });
        }

        if reply.kind == MessageType::Error {
            let error: ErrorResponse = deserialize_payload(&reply.payload)?;
            if error.code == ErrorCode::SessionExpired {
                self.session = None;
            }
            return Err(ClientError::Server {
                code:    error.code,
                message: error.message,
            });
        }

        if reply.kind != message.kind {
            return Err(ClientError::UnexpectedReply {
                expected: message.kind,
                got:      reply.kind,
            });
        }

        Ok(deserialize_payload(&reply.payload)?)
    }
}

fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Reads the helper's shared secret
pub fn load_secret(path: &Path) -> Result<SharedSecret> {
    SecretStore::new(path)
        .load()?
        .ok_or_else(|| ClientError::SecretMissing(path.to_path_buf()))
}
