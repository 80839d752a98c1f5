//! Linux connection tracker.
//!
//! A background task rebuilds the socket-inode map and re-reads the TCP
//! tables on a fixed interval. Stats requests only read the resulting
//! connection table, so request latency does not depend on how many
//! processes are running.
//!
//! Byte counts are the kernel's send/receive queue depths at the last
//! refresh. They approximate in-flight traffic and are not cumulative
//! transfer totals.

pub mod inodes;
pub mod proc_net;

use std::{
    collections::BTreeMap,
    fs, io,
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use netpulse_common::{
    auth::unix_now,
    protocol::{
        ConnectionInfo, ConnectionStatsResponse, ProcessDetail, ProcessStatsResponse,
        ProcessTraffic,
    },
};
use tokio::{sync::watch, task::JoinHandle};

use self::{inodes::InodeMap, proc_net::SocketEntry};

const UNKNOWN_PROCESS: &str = "unknown";

/// Identity of a connection: its local and remote endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub local:  SocketAddr,
    pub remote: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct ConnectionEntry {
    pub pid:       u32,
    pub tx_queue:  u64,
    pub rx_queue:  u64,
    pub last_seen: Instant,
}

/// Counts from a single refresh cycle
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RefreshSummary {
    pub sockets_seen: usize,
    pub attributed:   usize,
}

pub struct ConnectionTracker {
    proc_root:     PathBuf,
    stale_after:   Duration,
    connections:   DashMap<ConnectionKey, ConnectionEntry>,
    process_names: DashMap<u32, String>,
}

impl ConnectionTracker {
    /// Tracker over the real `/proc`
    pub fn new(stale_after: Duration) -> Self {
        Self::with_proc_root("/proc", stale_after)
    }

    /// Tracker over an alternative proc tree
    pub fn with_proc_root(proc_root: impl Into<PathBuf>, stale_after: Duration) -> Self {
        Self {
            proc_root: proc_root.into(),
            stale_after,
            connections: DashMap::new(),
            process_names: DashMap::new(),
        }
    }

    /// Runs one refresh cycle: rebuild the inode map, then upsert every
    /// established connection whose inode resolves to a process.
    pub fn refresh(&self) -> RefreshSummary {
        let map = inodes::scan(&self.proc_root);
        self.remember_process_names(&map);

        let now = Instant::now();
        let mut summary = RefreshSummary::default();

        for table in ["tcp", "tcp6"] {
            for entry in self.read_table(table) {
                summary.sockets_seen += 1;
                let Some(pid) = map.owner(entry.inode) else {
                    continue;
                };
                summary.attributed += 1;
                self.upsert(&entry, pid, now);
            }
        }

        tracing::trace!(
            sockets = summary.sockets_seen,
            attributed = summary.attributed,
            tracked = self.connections.len(),
            "Connection table refreshed"
        );
        summary
    }

    fn upsert(&self, entry: &SocketEntry, pid: u32, now: Instant) {
        let key = ConnectionKey {
            local:  entry.local,
            remote: entry.remote,
        };
        self.connections.insert(key, ConnectionEntry {
            pid,
            tx_queue: entry.tx_queue,
            rx_queue: entry.rx_queue,
            last_seen: now,
        });
    }

    fn read_table(&self, name: &str) -> Vec<SocketEntry> {
        let path = self.proc_root.join("net").join(name);
        match fs::read_to_string(&path) {
            Ok(contents) => proc_net::parse_table(&contents),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!("{} not present, skipping", path.display());
                Vec::new()
            }
            Err(e) => {
                tracing::warn!("Failed to read {}: {}", path.display(), e);
                Vec::new()
            }
        }
    }

    /// Caches names of newly seen socket owners and forgets exited processes
    fn remember_process_names(&self, map: &InodeMap) {
        self.process_names.retain(|pid, _| map.pids.contains(pid));
        for pid in map.owners.values() {
            if self.process_names.contains_key(pid) {
                continue;
            }
            if let Some(name) = inodes::process_name(&self.proc_root, *pid) {
                self.process_names.insert(*pid, name);
            }
        }
    }

    /// Drops connections not seen within the staleness window
    pub fn purge_stale(&self) -> usize {
        let before = self.connections.len();
        let stale_after = self.stale_after;
        self.connections
            .retain(|_, entry| entry.last_seen.elapsed() <= stale_after);
        let removed = before.saturating_sub(self.connections.len());
        if removed > 0 {
            tracing::debug!(removed, "Purged stale connections");
        }
        removed
    }

    pub fn tracked_connections(&self) -> usize {
        self.connections.len()
    }

    fn process_name_of(&self, pid: u32) -> String {
        self.process_names
            .get(&pid)
            .map(|name| name.value().clone())
            .unwrap_or_else(|| UNKNOWN_PROCESS.to_string())
    }

    /// Groups live connections by PID, optionally keeping only `filter`
    fn grouped(&self, filter: Option<&[u32]>) -> BTreeMap<u32, Vec<(ConnectionKey, ConnectionEntry)>> {
        self.purge_stale();

        let mut groups: BTreeMap<u32, Vec<(ConnectionKey, ConnectionEntry)>> = BTreeMap::new();
        for item in self.connections.iter() {
            let entry = item.value();
            if filter.is_some_and(|pids| !pids.contains(&entry.pid)) {
                continue;
            }
            groups
                .entry(entry.pid)
                .or_default()
                .push((*item.key(), entry.clone()));
        }
        groups
    }

    fn traffic(&self, pid: u32, connections: &[(ConnectionKey, ConnectionEntry)]) -> ProcessTraffic {
        ProcessTraffic {
            pid,
            process_name: self.process_name_of(pid),
            bytes_sent: connections.iter().map(|(_, c)| c.tx_queue).sum(),
            bytes_received: connections.iter().map(|(_, c)| c.rx_queue).sum(),
            connection_count: connections.len() as u32,
        }
    }

    /// Per-process totals across all tracked connections
    pub fn connection_stats(&self) -> ConnectionStatsResponse {
        let groups = self.grouped(None);
        let total_connections = groups.values().map(Vec::len).sum::<usize>() as u32;

        ConnectionStatsResponse {
            processes: groups
                .iter()
                .map(|(pid, conns)| self.traffic(*pid, conns))
                .collect(),
            total_connections,
            captured_at: unix_now(),
        }
    }

    /// Per-process detail including each connection.
    ///
    /// With a filter, only the listed PIDs that own at least one tracked
    /// connection are reported.
    pub fn process_stats(&self, filter: Option<&[u32]>) -> ProcessStatsResponse {
        let groups = self.grouped(filter);

        ProcessStatsResponse {
            processes: groups
                .iter()
                .map(|(pid, conns)| {
                    let mut connections: Vec<ConnectionInfo> = conns
                        .iter()
                        .map(|(key, entry)| ConnectionInfo {
                            local_address:  key.local.ip(),
                            local_port:     key.local.port(),
                            remote_address: key.remote.ip(),
                            remote_port:    key.remote.port(),
                            tx_queue_bytes: entry.tx_queue,
                            rx_queue_bytes: entry.rx_queue,
                        })
                        .collect();
                    connections.sort_by_key(|c| (c.local_port, c.remote_port));
                    ProcessDetail {
                        traffic: self.traffic(*pid, conns),
                        connections,
                    }
                })
                .collect(),
            captured_at: unix_now(),
        }
    }

    /// Spawns the periodic refresh task. It stops once `shutdown` reads true
    /// or its sender is dropped.
    pub fn start(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            tracing::info!(
                interval_ms = interval.as_millis() as u64,
                proc_root = %tracker.proc_root.display(),
                "Connection tracker started"
            );
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let worker = Arc::clone(&tracker);
                        if let Err(e) = tokio::task::spawn_blocking(move || worker.refresh()).await {
                            tracing::error!("Connection refresh task failed: {}", e);
                        }
                    }
                    _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
                }
            }
            tracing::info!("Connection tracker stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{os::unix::fs::symlink, path::Path, thread};

    use tempfile::TempDir;

    use super::*;

    const HEADER: &str = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode\n";

    fn row(local: &str, remote: &str, state: &str, tx: u64, rx: u64, inode: u64) -> String {
        format!(
            "   0: {local} {remote} {state} {tx:08X}:{rx:08X} 00:00000000 00000000  1000        0 {inode} 1 0000000000000000 20 4 30 10 -1\n"
        )
    }

    struct FakeProc {
        dir: TempDir,
    }

    impl FakeProc {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            fs::create_dir_all(dir.path().join("net")).unwrap();
            Self { dir }
        }

        fn root(&self) -> &Path {
            self.dir.path()
        }

        fn process(&self, pid: u32, comm: &str, inodes: &[u64]) {
            let base = self.root().join(pid.to_string());
            fs::create_dir_all(base.join("fd")).unwrap();
            fs::write(base.join("comm"), format!("{comm}\n")).unwrap();
            for (n, inode) in inodes.iter().enumerate() {
                symlink(format!("socket:[{inode}]"), base.join("fd").join(n.to_string())).unwrap();
            }
        }

        fn kill(&self, pid: u32) {
            fs::remove_dir_all(self.root().join(pid.to_string())).unwrap();
        }

        fn tcp(&self, rows: &[String]) {
            fs::write(self.root().join("net/tcp"), format!("{HEADER}{}", rows.concat())).unwrap();
        }

        fn tcp6(&self, rows: &[String]) {
            fs::write(self.root().join("net/tcp6"), format!("{HEADER}{}", rows.concat())).unwrap();
        }
    }

    #[test]
    fn test_refresh_attributes_connections_to_processes() {
        let proc = FakeProc::new();
        proc.process(100, "curl", &[1001]);
        proc.process(200, "firefox", &[2001, 2002]);
        proc.tcp(&[
            row("0100007F:C000", "0100007F:0050", "01", 10, 20, 1001),
            row("0100007F:C001", "22D8B85D:01BB", "01", 1, 2, 2001),
            row("0100007F:0016", "00000000:0000", "0A", 0, 0, 2002),
            row("0100007F:C002", "0100007F:0050", "01", 5, 5, 9999),
        ]);
        proc.tcp6(&[row(
            "00000000000000000000000001000000:1F90",
            "00000000000000000000000001000000:C350",
            "01",
            3,
            4,
            2002,
        )]);

        let tracker = ConnectionTracker::with_proc_root(proc.root(), Duration::from_secs(5));
        let summary = tracker.refresh();
        assert_eq!(summary, RefreshSummary {
            sockets_seen: 4,
            attributed:   3,
        });

        let stats = tracker.connection_stats();
        assert_eq!(stats.total_connections, 3);
        assert_eq!(stats.processes.len(), 2);

        let curl = &stats.processes[0];
        assert_eq!(curl.pid, 100);
        assert_eq!(curl.process_name, "curl");
        assert_eq!(curl.bytes_sent, 10);
        assert_eq!(curl.bytes_received, 20);

        let firefox = &stats.processes[1];
        assert_eq!(firefox.process_name, "firefox");
        assert_eq!(firefox.connection_count, 2);
        assert_eq!(firefox.bytes_sent, 4);
        assert_eq!(firefox.bytes_received, 6);
    }

    #[test]
    fn test_missing_tcp6_table_is_not_an_error() {
        let proc = FakeProc::new();
        proc.process(1, "init", &[42]);
        proc.tcp(&[row("0100007F:C000", "0100007F:0050", "01", 0, 0, 42)]);

        let tracker = ConnectionTracker::with_proc_root(proc.root(), Duration::from_secs(5));
        assert_eq!(tracker.refresh().attributed, 1);
    }

    #[test]
    fn test_process_stats_filter_and_detail() {
        let proc = FakeProc::new();
        proc.process(100, "curl", &[1001]);
        proc.process(200, "wget", &[2001]);
        proc.tcp(&[
            row("0100007F:C000", "0100007F:0050", "01", 7, 8, 1001),
            row("0100007F:C001", "0100007F:0050", "01", 0, 0, 2001),
        ]);

        let tracker = ConnectionTracker::with_proc_root(proc.root(), Duration::from_secs(5));
        tracker.refresh();

        let only_curl = tracker.process_stats(Some(&[100, 555]));
        assert_eq!(only_curl.processes.len(), 1);
        let detail = &only_curl.processes[0];
        assert_eq!(detail.traffic.pid, 100);
        assert_eq!(detail.connections.len(), 1);
        assert_eq!(detail.connections[0].local_port, 0xC000);
        assert_eq!(detail.connections[0].remote_port, 80);
        assert_eq!(detail.connections[0].tx_queue_bytes, 7);

        assert_eq!(tracker.process_stats(None).processes.len(), 2);
    }

    #[test]
    fn test_unseen_connections_are_purged_after_staleness_window() {
        let proc = FakeProc::new();
        proc.process(100, "curl", &[1001, 1002]);
        proc.tcp(&[
            row("0100007F:C000", "0100007F:0050", "01", 0, 0, 1001),
            row("0100007F:C001", "0100007F:0050", "01", 0, 0, 1002),
        ]);

        let tracker = ConnectionTracker::with_proc_root(proc.root(), Duration::from_millis(50));
        tracker.refresh();
        assert_eq!(tracker.connection_stats().total_connections, 2);

        thread::sleep(Duration::from_millis(80));
        proc.tcp(&[row("0100007F:C001", "0100007F:0050", "01", 0, 0, 1002)]);
        tracker.refresh();

        let stats = tracker.connection_stats();
        assert_eq!(stats.total_connections, 1);
        assert_eq!(tracker.tracked_connections(), 1);
    }

    #[test]
    fn test_names_of_exited_processes_are_forgotten() {
        let proc = FakeProc::new();
        proc.process(100, "curl", &[1001]);
        proc.tcp(&[row("0100007F:C000", "0100007F:0050", "01", 0, 0, 1001)]);

        let tracker = ConnectionTracker::with_proc_root(proc.root(), Duration::from_secs(5));
        tracker.refresh();
        assert!(tracker.process_names.contains_key(&100));

        proc.kill(100);
        tracker.refresh();
        assert!(!tracker.process_names.contains_key(&100));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_background_task_refreshes_and_stops() {
        let proc = FakeProc::new();
        proc.process(100, "curl", &[1001]);
        proc.tcp(&[row("0100007F:C000", "0100007F:0050", "01", 0, 0, 1001)]);

        let tracker = Arc::new(ConnectionTracker::with_proc_root(
            proc.root(),
            Duration::from_secs(5),
        ));
        let (tx, rx) = watch::channel(false);
        let handle = tracker.start(Duration::from_millis(10), rx);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(tracker.tracked_connections(), 1);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("tracker task stops")
            .unwrap();
    }
}
