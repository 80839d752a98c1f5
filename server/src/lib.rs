//! NetPulse privileged helper
//!
//! Serves per-process connection statistics to a single unprivileged user
//! over a Unix socket. Every connection goes through the same gate:
//!
//! 1. The kernel-reported peer UID must equal the expected UID, or the
//!    connection is dropped before anything is read.
//! 2. The first useful request must be a signed `Authenticate`. Its PID must
//!    match the peer PID and its executable path must match `/proc/<pid>/exe`.
//! 3. Every later request must carry a live session and stay under the
//!    per-session rate limit.

pub mod identity;
pub mod rate_limit;
pub mod session;
pub mod settings;
pub mod tracker;

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Result;
use netpulse_common::{
    auth,
    platform_socket::{ClientCredentials, PlatformListener},
    protocol::{
        AuthRequest, AuthResponse, ErrorCode, ErrorResponse, HeartbeatResponse, Message,
        MessageType, ProcessStatsRequest, ShutdownResponse,
    },
    secret::SharedSecret,
    transport::{deserialize_payload, serialize_payload, MessageStream, TransportError},
};
use serde::Serialize;
use tokio::{net::UnixStream, sync::watch, task::JoinSet};
use tracing::Instrument;

use crate::{
    identity::{executable_matches, PeerInspector},
    rate_limit::{PreAuthRateLimiter, RateLimiter},
    session::{short_id, Session, SessionManager},
    settings::{HelperSettings, SettingsError},
    tracker::ConnectionTracker,
};

const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Cloneable trigger for stopping a running [`HelperServer`]
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Asks the server and all of its tasks to stop
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// State shared by the accept loop and every connection task
struct ServerState {
    secret:       SharedSecret,
    settings:     HelperSettings,
    expected_uid: u32,
    sessions:     SessionManager,
    rate_limiter: RateLimiter,
    pre_auth:     PreAuthRateLimiter,
    tracker:      Arc<ConnectionTracker>,
    inspector:    Arc<dyn PeerInspector>,
    shutdown:     ShutdownHandle,
    next_conn_id: AtomicU64,
}

/// The privileged helper server
pub struct HelperServer {
    state: Arc<ServerState>,
}

impl HelperServer {
    /// Creates a server that accepts only `expected_uid`.
    ///
    /// The server takes ownership of the secret; it is zeroed when the last
    /// connection task lets go of the server state. Fails if `settings` do
    /// not validate.
    pub fn new(
        secret: SharedSecret,
        settings: HelperSettings,
        expected_uid: u32,
        inspector: Arc<dyn PeerInspector>,
        tracker: Arc<ConnectionTracker>,
    ) -> Result<Self, SettingsError> {
        settings.validate()?;
        let state = ServerState {
            sessions: SessionManager::new(settings.max_sessions, settings.session_ttl()),
            rate_limiter: RateLimiter::new(settings.max_requests_per_second),
            pre_auth: PreAuthRateLimiter::new(
                settings.pre_auth_requests_per_second,
                settings.max_auth_failures,
            ),
            secret,
            settings,
            expected_uid,
            tracker,
            inspector,
            shutdown: ShutdownHandle::new(),
            next_conn_id: AtomicU64::new(1),
        };
        Ok(Self {
            state: Arc::new(state),
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.state.shutdown.clone()
    }

    pub fn active_sessions(&self) -> usize {
        self.state.sessions.active_count()
    }

    /// Accepts connections until shutdown is triggered.
    ///
    /// Starts the tracker refresh and session sweep tasks, and on exit waits
    /// briefly for connection tasks to finish. The socket file is removed
    /// when `listener` is dropped at the end of this call.
    pub async fn run(&self, listener: PlatformListener) -> Result<()> {
        let state = &self.state;
        let mut shutdown = state.shutdown.subscribe();

        tracing::info!(
            socket = %listener.path().display(),
            expected_uid = state.expected_uid,
            max_sessions = state.settings.max_sessions,
            "Helper server listening"
        );

        let tracker_task = state
            .tracker
            .start(state.settings.tracker_refresh(), state.shutdown.subscribe());
        let sweep_task = spawn_session_sweeper(Arc::clone(state));
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        tracing::error!("Connection task failed: {}", e);
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok(stream) => self.admit(stream, &mut connections),
                        Err(e) => tracing::error!("Connection error: {}", e),
                    }
                }
            }
        }

        tracing::info!("Server shutdown signal received, stopping gracefully");
        sweep_task.abort();
        let drain = async {
            while let Some(finished) = connections.join_next().await {
                if let Err(e) = finished {
                    tracing::error!("Connection task failed: {}", e);
                }
            }
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            tracing::warn!("Connection tasks did not stop in time, aborting them");
            connections.abort_all();
        }
        if let Err(e) = tracker_task.await {
            tracing::warn!("Tracker task ended abnormally: {}", e);
        }

        drop(listener);
        tracing::info!("Helper server stopped");
        Ok(())
    }

    /// Checks the peer's kernel credentials and spawns its connection task
    fn admit(&self, stream: UnixStream, connections: &mut JoinSet<()>) {
        let conn_id = format!(
            "conn-{}",
            self.state.next_conn_id.fetch_add(1, Ordering::Relaxed)
        );

        let credentials = match self.state.inspector.peer_credentials(&stream) {
            Ok(credentials) => credentials,
            Err(e) => {
                tracing::warn!(conn = %conn_id, "Rejecting connection without peer credentials: {}", e);
                return;
            }
        };

        if credentials.uid != self.state.expected_uid {
            tracing::warn!(
                conn = %conn_id,
                pid = credentials.pid,
                uid = credentials.uid,
                expected_uid = self.state.expected_uid,
                "Rejecting connection from unexpected user"
            );
            return;
        }

        tracing::info!(
            conn = %conn_id,
            pid = credentials.pid,
            uid = credentials.uid,
            "New connection accepted"
        );

        let state = Arc::clone(&self.state);
        let span = tracing::info_span!("connection", conn = %conn_id, pid = credentials.pid);
        connections.spawn(
            async move {
                serve_connection(state, stream, credentials, conn_id).await;
            }
            .instrument(span),
        );
    }
}

fn spawn_session_sweeper(state: Arc<ServerState>) -> tokio::task::JoinHandle<()> {
    let interval = SESSION_SWEEP_INTERVAL.min(state.settings.session_ttl());
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            state.sessions.sweep_expired();
        }
    })
}

/// Why a connection loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionEnd {
    ClientClosed,
    ShutdownRequested,
    TooManyAuthFailures,
    ServerStopping,
}

/// Per-connection state. Dropping it removes the connection's session and
/// rate-limiter entries, even if the task unwinds.
struct Connection {
    state:       Arc<ServerState>,
    id:          String,
    credentials: ClientCredentials,
    session_id:  Option<String>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(session_id) = self.session_id.take() {
            self.state.sessions.remove_session(&session_id);
            self.state.rate_limiter.remove_client(&session_id);
        }
        self.state.pre_auth.remove_client(&self.id);
        tracing::debug!(conn = %self.id, "Connection state cleaned up");
    }
}

/// What a handled request asks of the loop after its reply is sent
enum Next {
    Continue,
    Close(ConnectionEnd),
}

async fn serve_connection(
    state: Arc<ServerState>,
    stream: UnixStream,
    credentials: ClientCredentials,
    conn_id: String,
) {
    let mut shutdown = state.shutdown.subscribe();
    let mut conn = Connection {
        state,
        id: conn_id,
        credentials,
        session_id: None,
    };
    let mut stream = MessageStream::new(stream);

    match conn.run(&mut stream, &mut shutdown).await {
        Ok(end) => tracing::info!(reason = ?end, "Connection closed"),
        Err(e) => tracing::warn!("Connection terminated: {}", e),
    }
}

impl Connection {
    async fn run(
        &mut self,
        stream: &mut MessageStream<UnixStream>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<ConnectionEnd, TransportError> {
        loop {
            let received = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => return Ok(ConnectionEnd::ServerStopping),
                received = stream.recv_message() => received?,
            };
            let Some(message) = received else {
                return Ok(ConnectionEnd::ClientClosed);
            };

            tracing::debug!(kind = %message.kind, request = %message.request_id, "Request received");
            if let Next::Close(end) = self.dispatch(stream, message).await? {
                return Ok(end);
            }
        }
    }

    async fn dispatch(
        &mut self,
        stream: &mut MessageStream<UnixStream>,
        message: Message,
    ) -> Result<Next, TransportError> {
        let request_id = message.request_id.as_str();

        match message.kind {
            MessageType::Authenticate => {
                let (response, disconnect) = self.authenticate(&message.payload);
                reply(stream, MessageType::Authenticate, request_id, &response).await?;
                if disconnect {
                    tracing::warn!(
                        uid = self.credentials.uid,
                        "Too many failed authentication attempts, disconnecting"
                    );
                    return Ok(Next::Close(ConnectionEnd::TooManyAuthFailures));
                }
                Ok(Next::Continue)
            }
            MessageType::Error => {
                reply_error(
                    stream,
                    request_id,
                    ErrorCode::BadRequest,
                    "error messages are only sent by the helper",
                )
                .await?;
                Ok(Next::Continue)
            }
            kind => {
                let session = match self.authorize() {
                    Ok(session) => session,
                    Err((code, reason)) => {
                        reply_error(stream, request_id, code, reason).await?;
                        return Ok(Next::Continue);
                    }
                };
                self.handle_request(stream, kind, request_id, &message.payload, &session)
                    .await
            }
        }
    }

    /// Runs every identity check in order, returning the reply and whether
    /// the connection should be dropped after sending it
    fn authenticate(&mut self, payload: &[u8]) -> (AuthResponse, bool) {
        let state = Arc::clone(&self.state);

        if !state.pre_auth.try_acquire(&self.id) {
            return self.auth_failed("Too many authentication attempts");
        }

        let request: AuthRequest = match deserialize_payload(payload) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!("Undecodable authentication request: {}", e);
                return self.auth_failed("Malformed authentication request");
            }
        };

        if !auth::validate(
            request.client_pid,
            request.timestamp,
            &request.signature,
            &state.secret,
            state.settings.auth_max_age_secs,
        ) {
            return self.auth_failed("Invalid or expired signature");
        }

        if request.client_pid != self.credentials.pid {
            tracing::warn!(
                claimed_pid = request.client_pid,
                peer_pid = self.credentials.pid,
                "Claimed PID does not match peer credentials"
            );
            return self.auth_failed("PID mismatch");
        }

        match state.inspector.executable_path(self.credentials.pid) {
            Ok(actual) if executable_matches(&request.executable_path, &actual) => {}
            Ok(actual) => {
                tracing::warn!(
                    claimed = %request.executable_path,
                    actual = %actual.display(),
                    "Executable path mismatch"
                );
                return self.auth_failed("Executable path mismatch");
            }
            Err(e) => {
                tracing::warn!("Cannot verify client executable: {:#}", e);
                return self.auth_failed("Executable path could not be verified");
            }
        }

        // Re-authentication replaces the previous session instead of holding two.
        if let Some(previous) = self.session_id.take() {
            state.sessions.remove_session(&previous);
            state.rate_limiter.remove_client(&previous);
        }

        let Some(session) = state
            .sessions
            .create_session(request.client_pid, &request.executable_path)
        else {
            return (AuthResponse::denied("Session limit reached"), false);
        };

        state.pre_auth.record_success(&self.id);
        tracing::info!(session = session.log_id(), "Client authenticated");

        let response = AuthResponse::granted(session.id.clone(), session.expires_at_unix);
        self.session_id = Some(session.id);
        (response, false)
    }

    fn auth_failed(&self, reason: &str) -> (AuthResponse, bool) {
        let disconnect = self.state.pre_auth.record_failure(&self.id);
        tracing::warn!(
            uid = self.credentials.uid,
            failures = self.state.pre_auth.consecutive_failures(&self.id),
            "Authentication failed: {}",
            reason
        );
        (AuthResponse::denied(reason), disconnect)
    }

    /// Resolves the connection's session and charges the request to its
    /// rate limit. Without a session the request is charged to the
    /// pre-authentication limit instead.
    fn authorize(&mut self) -> Result<Session, (ErrorCode, &'static str)> {
        let Some(session_id) = self.session_id.clone() else {
            if !self.state.pre_auth.try_acquire(&self.id) {
                tracing::debug!("Pre-authentication rate limit exceeded");
                return Err((ErrorCode::RateLimited, "too many requests"));
            }
            return Err((ErrorCode::Unauthenticated, "authenticate first"));
        };

        let Some(session) = self.state.sessions.validate_session(&session_id) else {
            tracing::info!(session = short_id(&session_id), "Session expired");
            self.state.rate_limiter.remove_client(&session_id);
            self.session_id = None;
            return Err((ErrorCode::SessionExpired, "session expired, authenticate again"));
        };

        if !self.state.rate_limiter.try_acquire(&session_id) {
            tracing::debug!(session = session.log_id(), "Rate limit exceeded");
            return Err((ErrorCode::RateLimited, "too many requests"));
        }

        Ok(session)
    }

    async fn handle_request(
        &mut self,
        stream: &mut MessageStream<UnixStream>,
        kind: MessageType,
        request_id: &str,
        payload: &[u8],
        session: &Session,
    ) -> Result<Next, TransportError> {
        match kind {
            MessageType::ConnectionStats => {
                let stats = self.state.tracker.connection_stats();
                reply(stream, kind, request_id, &stats).await?;
            }
            MessageType::ProcessStats => {
                let request = if payload.is_empty() {
                    ProcessStatsRequest::default()
                } else {
                    match deserialize_payload::<ProcessStatsRequest>(payload) {
                        Ok(request) => request,
                        Err(e) => {
                            tracing::debug!("Undecodable process stats request: {}", e);
                            reply_error(stream, request_id, ErrorCode::BadRequest, "malformed request")
                                .await?;
                            return Ok(Next::Continue);
                        }
                    }
                };
                let stats = self.state.tracker.process_stats(request.pids.as_deref());
                reply(stream, kind, request_id, &stats).await?;
            }
            MessageType::Heartbeat => {
                let response = HeartbeatResponse {
                    server_time:        auth::unix_now(),
                    session_expires_at: session.expires_at_unix,
                };
                reply(stream, kind, request_id, &response).await?;
            }
            MessageType::Shutdown => {
                let helper_stopping = self.state.settings.stop_on_shutdown_request;
                reply(stream, kind, request_id, &ShutdownResponse { helper_stopping }).await?;

                if let Some(session_id) = self.session_id.take() {
                    self.state.sessions.remove_session(&session_id);
                    self.state.rate_limiter.remove_client(&session_id);
                }
                if helper_stopping {
                    tracing::info!("Shutdown requested by authenticated client");
                    self.state.shutdown.trigger();
                }
                return Ok(Next::Close(ConnectionEnd::ShutdownRequested));
            }
            MessageType::Authenticate | MessageType::Error => {
                reply_error(stream, request_id, ErrorCode::Internal, "unexpected dispatch").await?;
            }
        }
        Ok(Next::Continue)
    }
}

async fn reply<T: Serialize>(
    stream: &mut MessageStream<UnixStream>,
    kind: MessageType,
    request_id: &str,
    body: &T,
) -> Result<(), TransportError> {
    let payload = serialize_payload(body)?;
    stream
        .send_message(&Message::new(kind, request_id, payload))
        .await
}

async fn reply_error(
    stream: &mut MessageStream<UnixStream>,
    request_id: &str,
    code: ErrorCode,
    message: &str,
) -> Result<(), TransportError> {
    tracing::debug!(%code, request = request_id, "Replying with error");
    reply(
        stream,
        MessageType::Error,
        request_id,
        &ErrorResponse::new(code, message),
    )
    .await
}
