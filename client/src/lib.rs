//! Client library for the netpulse privileged helper.
//!
//! The helper writes a shared secret into the user's runtime directory and
//! listens on a Unix socket next to it. A client proves it can read the
//! secret by signing its PID and the current time, receives a session, and
//! then queries per-process connection statistics on the same connection.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use netpulse_client::{ClientConfig, HelperClient};
//!
//! # async fn run() -> Result<(), netpulse_client::ClientError> {
//! let config = ClientConfig::new().with_timeout(Duration::from_secs(5));
//! let mut client = HelperClient::connect_authenticated(&config).await?;
//!
//! let stats = client.connection_stats().await?;
//! for process in stats.processes {
//!     println!("{} ({}): {} connections", process.process_name, process.pid, process.connection_count);
//! }
//! # Ok(())
//! # }
//! ```

mod client;

pub use client::*;
pub use netpulse_common::{
    protocol::{
        ConnectionInfo, ConnectionStatsResponse, ErrorCode, HeartbeatResponse, ProcessDetail,
        ProcessStatsResponse, ProcessTraffic, ShutdownResponse,
    },
    HelperPaths, SharedSecret,
};
