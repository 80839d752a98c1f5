//! Who is allowed to connect, and what the kernel says about who did.
//!
//! OS-specific lookups sit behind [`PeerInspector`] so the request handling
//! in the server can run against a stub in tests.

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};
use netpulse_common::platform_socket::{self, ClientCredentials};
use tokio::net::UnixStream;

/// Set by pkexec to the UID of the user who requested elevation
const PKEXEC_UID_ENV: &str = "PKEXEC_UID";
/// Set by sudo to the UID of the invoking user
const SUDO_UID_ENV: &str = "SUDO_UID";
const LOGINUID_PATH: &str = "/proc/self/loginuid";
/// Kernel value for "no login UID recorded"
const LOGINUID_UNSET: u32 = u32::MAX;

/// Platform capabilities the server needs to verify a peer's identity claim
pub trait PeerInspector: Send + Sync {
    /// PID and UID of the process at the other end of `stream`
    fn peer_credentials(&self, stream: &UnixStream) -> Result<ClientCredentials>;

    /// Path of the executable image running as `pid`
    fn executable_path(&self, pid: u32) -> Result<PathBuf>;
}

/// Inspector backed by the running kernel
#[derive(Debug, Clone)]
pub struct SystemInspector {
    proc_root: PathBuf,
}

impl Default for SystemInspector {
    fn default() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
        }
    }
}

impl SystemInspector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PeerInspector for SystemInspector {
    fn peer_credentials(&self, stream: &UnixStream) -> Result<ClientCredentials> {
        platform_socket::peer_credentials(stream)
    }

    #[cfg(target_os = "linux")]
    fn executable_path(&self, pid: u32) -> Result<PathBuf> {
        fs::read_link(self.proc_root.join(pid.to_string()).join("exe"))
            .with_context(|| format!("Failed to read executable path of PID {pid}"))
    }

    #[cfg(target_os = "macos")]
    fn executable_path(&self, pid: u32) -> Result<PathBuf> {
        use std::ffi::CStr;

        // PROC_PIDPATHINFO_MAXSIZE
        let mut path_buf = [0 as libc::c_char; 4096];

        // SAFETY: path_buf is a valid stack buffer and its length is passed
        // as the size argument.
        let ret = unsafe {
            libc::proc_pidpath(
                pid as i32,
                path_buf.as_mut_ptr() as *mut libc::c_void,
                path_buf.len() as u32,
            )
        };
        if ret <= 0 {
            return Err(anyhow!(
                "Failed to get process path for PID {}: proc_pidpath returned {}",
                pid,
                ret
            ));
        }

        // SAFETY: proc_pidpath NUL-terminates on success (ret > 0).
        let path = unsafe { CStr::from_ptr(path_buf.as_ptr()) };
        Ok(PathBuf::from(
            path.to_str().context("Process path contains invalid UTF-8")?,
        ))
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    fn executable_path(&self, pid: u32) -> Result<PathBuf> {
        Err(anyhow!(
            "Unable to determine the executable of PID {} on this platform",
            pid
        ))
    }
}

/// True only when the claimed path names exactly the executable the kernel
/// reports for the peer
pub fn executable_matches(claimed: &str, actual: &Path) -> bool {
    !claimed.is_empty() && Path::new(claimed) == actual
}

/// Resolves the single UID allowed to connect.
///
/// Checked in order: `PKEXEC_UID`, `SUDO_UID`, then the login UID of this
/// process. The last is weaker, since it reflects whoever owns the login
/// session rather than whoever requested elevation.
pub fn resolve_expected_uid() -> Result<u32> {
    let loginuid = fs::read_to_string(LOGINUID_PATH).ok();
    expected_uid_from(
        env::var(PKEXEC_UID_ENV).ok().as_deref(),
        env::var(SUDO_UID_ENV).ok().as_deref(),
        loginuid.as_deref(),
    )
}

fn expected_uid_from(pkexec: Option<&str>, sudo: Option<&str>, loginuid: Option<&str>) -> Result<u32> {
    for (source, value) in [(PKEXEC_UID_ENV, pkexec), (SUDO_UID_ENV, sudo)] {
        if let Some(raw) = value {
            let uid = raw
                .trim()
                .parse::<u32>()
                .with_context(|| format!("{source} is not a valid UID: {raw:?}"))?;
            tracing::info!(uid, source, "Expected client UID resolved");
            return Ok(uid);
        }
    }

    if let Some(raw) = loginuid {
        match raw.trim().parse::<u32>() {
            Ok(LOGINUID_UNSET) => {}
            Ok(uid) => {
                tracing::warn!(
                    uid,
                    "Neither {} nor {} is set; falling back to login UID",
                    PKEXEC_UID_ENV,
                    SUDO_UID_ENV
                );
                return Ok(uid);
            }
            Err(_) => tracing::warn!("Unparseable login UID {:?}", raw.trim()),
        }
    }

    Err(anyhow!(
        "Cannot determine which user may connect: {} and {} are unset and no login UID is \
         recorded",
        PKEXEC_UID_ENV,
        SUDO_UID_ENV
    ))
}
