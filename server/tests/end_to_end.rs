//! Full helper/client exchanges over a real Unix socket.

use std::{sync::Arc, time::Duration};

use netpulse_client::{ClientConfig, ClientError, ErrorCode, HelperClient, SharedSecret};
use netpulse_common::{config::HelperPaths, platform_socket::PlatformListener, secret::SecretStore};
use netpulse_helper::{
    identity::SystemInspector, settings::HelperSettings, tracker::ConnectionTracker, HelperServer,
    ShutdownHandle,
};
use tempfile::TempDir;
use tokio::task::JoinHandle;

struct RunningHelper {
    _dir:     TempDir,
    paths:    HelperPaths,
    shutdown: ShutdownHandle,
    task:     JoinHandle<anyhow::Result<()>>,
}

impl RunningHelper {
    async fn start(settings: HelperSettings) -> Self {
        let dir = TempDir::new().unwrap();
        let paths = HelperPaths::in_dir(dir.path());
        let secret = SecretStore::new(&paths.secret_path)
            .generate_and_store(None)
            .unwrap();

        let tracker = Arc::new(ConnectionTracker::new(settings.connection_stale_after()));
        let server = HelperServer::new(
            secret,
            settings,
            nix::unistd::getuid().as_raw(),
            Arc::new(SystemInspector::new()),
            tracker,
        )
        .unwrap();
        let shutdown = server.shutdown_handle();
        let listener = PlatformListener::bind(&paths.socket_path, None).unwrap();
        let task = tokio::spawn(async move { server.run(listener).await });

        Self {
            _dir: dir,
            paths,
            shutdown,
            task,
        }
    }

    fn config(&self) -> ClientConfig {
        ClientConfig::from_paths(self.paths.clone()).with_timeout(Duration::from_secs(5))
    }

    async fn stop(self) {
        self.shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(10), self.task)
            .await
            .expect("helper did not stop")
            .unwrap()
            .unwrap();
    }
}

#[tokio::test]
async fn test_authenticated_client_reads_stats() {
    let helper = RunningHelper::start(HelperSettings::default()).await;

    let mut client = HelperClient::connect_authenticated(&helper.config())
        .await
        .unwrap();
    let session = client.session().cloned().unwrap();
    assert_eq!(session.session_id.len(), 43);

    let stats = client.connection_stats().await.unwrap();
    let listed: u32 = stats.processes.iter().map(|p| p.connection_count).sum();
    assert_eq!(listed, stats.total_connections);

    let detail = client.process_stats(Some(vec![std::process::id()])).await.unwrap();
    assert!(detail
        .processes
        .iter()
        .all(|p| p.traffic.pid == std::process::id()));

    let beat = client.heartbeat().await.unwrap();
    assert_eq!(beat.session_expires_at, session.expires_at);

    drop(client);
    helper.stop().await;
}

#[tokio::test]
async fn test_requests_before_authentication_are_refused() {
    let helper = RunningHelper::start(HelperSettings::default()).await;

    let mut client = HelperClient::connect(&helper.config()).await.unwrap();
    match client.connection_stats().await {
        Err(ClientError::Server { code, .. }) => assert_eq!(code, ErrorCode::Unauthenticated),
        other => panic!("expected Unauthenticated, got {other:?}"),
    }

    // The connection stays usable for authenticating afterwards.
    let secret = netpulse_client::load_secret(&helper.paths.secret_path).unwrap();
    client.authenticate(&secret).await.unwrap();
    client.heartbeat().await.unwrap();

    drop(client);
    helper.stop().await;
}

#[tokio::test]
async fn test_rate_limit_rejects_without_ending_session() {
    let helper = RunningHelper::start(HelperSettings::default()).await;
    let mut client = HelperClient::connect_authenticated(&helper.config())
        .await
        .unwrap();

    for _ in 0..10 {
        client.heartbeat().await.unwrap();
    }
    match client.heartbeat().await {
        Err(ClientError::Server { code, .. }) => assert_eq!(code, ErrorCode::RateLimited),
        other => panic!("expected RateLimited, got {other:?}"),
    }

    tokio::time::sleep(Duration::from_millis(1100)).await;
    client.heartbeat().await.unwrap();
    assert!(client.is_authenticated());

    drop(client);
    helper.stop().await;
}

#[tokio::test]
async fn test_wrong_secret_disconnects_after_repeated_failures() {
    let helper = RunningHelper::start(HelperSettings::default()).await;
    let mut client = HelperClient::connect(&helper.config()).await.unwrap();
    let forged = SharedSecret::generate();

    for _ in 0..3 {
        assert!(matches!(
            client.authenticate(&forged).await,
            Err(ClientError::AuthenticationFailed(_))
        ));
    }

    let after = client.authenticate(&forged).await;
    assert!(
        matches!(
            after,
            Err(ClientError::Disconnected) | Err(ClientError::Transport(_))
        ),
        "expected the helper to hang up, got {after:?}"
    );

    drop(client);
    helper.stop().await;
}

#[tokio::test]
async fn test_shutdown_request_stops_helper_and_removes_socket() {
    let helper = RunningHelper::start(HelperSettings::default()).await;
    let client = HelperClient::connect_authenticated(&helper.config())
        .await
        .unwrap();

    let reply = client.shutdown().await.unwrap();
    assert!(reply.helper_stopping);

    let RunningHelper {
        _dir, paths, task, ..
    } = helper;
    tokio::time::timeout(Duration::from_secs(10), task)
        .await
        .expect("helper did not stop")
        .unwrap()
        .unwrap();
    assert!(!paths.socket_path.exists());
}

#[tokio::test]
async fn test_shutdown_request_can_leave_helper_running() {
    let settings = HelperSettings {
        stop_on_shutdown_request: false,
        ..HelperSettings::default()
    };
    let helper = RunningHelper::start(settings).await;

    let client = HelperClient::connect_authenticated(&helper.config())
        .await
        .unwrap();
    assert!(!client.shutdown().await.unwrap().helper_stopping);

    let mut again = HelperClient::connect_authenticated(&helper.config())
        .await
        .unwrap();
    again.heartbeat().await.unwrap();

    drop(again);
    helper.stop().await;
}
