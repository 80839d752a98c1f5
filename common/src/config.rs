use std::{env, path::PathBuf};

/// File name of the helper's listening socket inside the runtime directory
pub const SOCKET_NAME: &str = "helper.sock";

/// File name of the shared secret inside the runtime directory
pub const SECRET_FILE_NAME: &str = "helper.secret";

/// Length in bytes of the shared authentication secret
pub const SECRET_LEN: usize = 32;

/// Largest envelope accepted on the wire, excluding the 4-byte length prefix
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Default freshness window for signed authentication requests
pub const AUTH_MAX_AGE_SECS: u64 = 30;

const RUNTIME_DIR_ENV: &str = "NETPULSE_RUNTIME_DIR";
const RUNTIME_SUBDIR: &str = "netpulse";

/// Resolves the per-user runtime directory holding the socket and secret.
///
/// Priority:
/// 1. `NETPULSE_RUNTIME_DIR` if set
/// 2. `/run/user/<uid>/netpulse` if `/run/user/<uid>` exists
/// 3. `/tmp/netpulse-<uid>` as fallback
pub fn runtime_dir(uid: u32) -> PathBuf {
    if let Ok(dir) = env::var(RUNTIME_DIR_ENV) {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }

    let user_run = PathBuf::from(format!("/run/user/{uid}"));
    if user_run.is_dir() {
        return user_run.join(RUNTIME_SUBDIR);
    }

    PathBuf::from(format!("/tmp/{RUNTIME_SUBDIR}-{uid}"))
}

/// Filesystem locations shared by the helper and its client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperPaths {
    /// Directory containing both artifacts (mode 0700)
    pub runtime_dir: PathBuf,
    /// Path of the listening Unix socket
    pub socket_path: PathBuf,
    /// Path of the shared secret file
    pub secret_path: PathBuf,
}

impl HelperPaths {
    /// Paths for the given user, resolved from the environment
    pub fn for_user(uid: u32) -> Self {
        Self::in_dir(runtime_dir(uid))
    }

    /// Paths rooted at an explicit directory
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let runtime_dir = dir.into();
        Self {
            socket_path: runtime_dir.join(SOCKET_NAME),
            secret_path: runtime_dir.join(SECRET_FILE_NAME),
            runtime_dir,
        }
    }
}
