use std::{
    ffi::CString,
    io,
    mem,
    os::unix::{
        ffi::OsStrExt,
        io::{AsFd, AsRawFd, FromRawFd, OwnedFd},
    },
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};
#[cfg(target_os = "linux")]
use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};
use tokio::net::{UnixListener, UnixStream};

use crate::secret::ensure_private_dir;

/// Socket file permissions (owner read/write only)
const SOCKET_MODE: libc::mode_t = 0o600;

const LISTEN_BACKLOG: libc::c_int = 128;

/// Client credentials reported by the kernel for a connected socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientCredentials {
    /// Process ID of the client
    pub pid: u32,
    /// User ID of the client
    pub uid: u32,
}

/// Reads the peer's PID and UID from a connected Unix socket.
///
/// This is the only identity information the peer cannot forge.
#[cfg(target_os = "linux")]
pub fn peer_credentials<F: AsFd>(socket: &F) -> Result<ClientCredentials> {
    let creds = getsockopt(socket, PeerCredentials).context("Failed to get peer credentials")?;

    Ok(ClientCredentials {
        pid: creds.pid() as u32,
        uid: creds.uid(),
    })
}

#[cfg(target_os = "macos")]
pub fn peer_credentials<F: AsFd>(socket: &F) -> Result<ClientCredentials> {
    let fd = socket.as_fd().as_raw_fd();
    let mut uid: libc::uid_t = 0;
    let mut gid: libc::gid_t = 0;

    // SAFETY: getpeereid only writes into the two stack variables passed by
    // reference; fd is a live descriptor borrowed from `socket`.
    let result = unsafe { libc::getpeereid(fd, &mut uid, &mut gid) };
    if result != 0 {
        return Err(anyhow!(
            "Failed to get peer UID on macOS: {}",
            io::Error::last_os_error()
        ));
    }

    let mut pid: libc::pid_t = 0;
    let mut pid_len = mem::size_of::<libc::pid_t>() as libc::socklen_t;

    // SAFETY: pid and pid_len are valid stack variables whose sizes match
    // what LOCAL_PEERPID writes.
    let result = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_LOCAL,
            libc::LOCAL_PEERPID,
            &mut pid as *mut _ as *mut libc::c_void,
            &mut pid_len,
        )
    };
    if result != 0 {
        return Err(anyhow!(
            "Failed to get peer PID on macOS: {}",
            io::Error::last_os_error()
        ));
    }

    Ok(ClientCredentials {
        pid: pid as u32,
        uid,
    })
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn peer_credentials<F: AsFd>(_socket: &F) -> Result<ClientCredentials> {
    Err(anyhow!("Peer credentials are not supported on this platform"))
}

/// Listening Unix socket that removes its filesystem path when dropped
pub struct PlatformListener {
    listener: UnixListener,
    path:     PathBuf,
}

impl PlatformListener {
    /// Binds a Unix socket at `path` with owner-only permissions.
    ///
    /// The mode (and, when `owner` is given, the ownership) is applied after
    /// `bind` but before `listen`, so no client can connect while the socket
    /// file is still world-accessible. A stale socket file at the path is
    /// removed first. Must be called from within a tokio runtime.
    pub fn bind(path: &Path, owner: Option<u32>) -> Result<Self> {
        tracing::info!("Setting up Unix socket server at {}", path.display());

        if let Some(parent) = path.parent() {
            ensure_private_dir(parent, owner)
                .with_context(|| format!("Cannot prepare socket directory {}", parent.display()))?;
        }

        match std::fs::remove_file(path) {
            Ok(()) => tracing::warn!("Removed existing socket file at {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!("No existing socket file found");
            }
            Err(e) => {
                return Err(anyhow!(
                    "Could not remove existing socket file '{}': {}. Another helper instance \
                     may be running.",
                    path.display(),
                    e
                ));
            }
        }

        let fd = bind_restricted(path, owner).map_err(|e| {
            let detail = match e.kind() {
                io::ErrorKind::PermissionDenied => "permission denied; check directory ownership",
                io::ErrorKind::AddrInUse => "address already in use",
                io::ErrorKind::InvalidInput => "path is invalid or too long",
                _ => "unexpected error",
            };
            anyhow!(
                "Failed to bind socket '{}': {} ({}, OS error {})",
                path.display(),
                e,
                detail,
                e.raw_os_error().unwrap_or(-1)
            )
        })?;

        let std_listener = std::os::unix::net::UnixListener::from(fd);
        std_listener
            .set_nonblocking(true)
            .context("Failed to make listener non-blocking")?;
        let listener =
            UnixListener::from_std(std_listener).context("Failed to register listener")?;

        tracing::info!("Unix socket server setup complete");
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    /// Accepts the next connection
    pub async fn accept(&self) -> io::Result<UnixStream> {
        let (stream, _) = self.listener.accept().await?;
        Ok(stream)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PlatformListener {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!("Removed socket file {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove socket file {}: {}", self.path.display(), e),
        }
    }
}

/// socket(2) + bind(2) + chmod/chown + listen(2), in that order
fn bind_restricted(path: &Path, owner: Option<u32>) -> io::Result<OwnedFd> {
    let path_bytes = path.as_os_str().as_bytes();
    let path_cstring =
        CString::new(path_bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    // SAFETY: zeroed sockaddr_un is a valid (empty) address.
    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    if path_bytes.len() >= addr.sun_path.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "socket path is too long",
        ));
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(path_bytes) {
        *dst = *src as libc::c_char;
    }

    // SAFETY: plain socket creation; the result is checked before use.
    let raw = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: raw is a freshly created descriptor that nothing else owns.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    // SAFETY: addr is fully initialised and its size is passed alongside it.
    let result = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const libc::sockaddr_un as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
        )
    };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: path_cstring is a valid NUL-terminated path.
    if unsafe { libc::chmod(path_cstring.as_ptr(), SOCKET_MODE) } != 0 {
        return Err(io::Error::last_os_error());
    }
    if let Some(uid) = owner {
        // SAFETY: as above; gid -1 leaves the group unchanged.
        if unsafe { libc::chown(path_cstring.as_ptr(), uid, libc::gid_t::MAX) } != 0 {
            return Err(io::Error::last_os_error());
        }
        tracing::info!("Socket ownership handed to UID {}", uid);
    }

    // SAFETY: fd is a bound stream socket.
    if unsafe { libc::listen(fd.as_raw_fd(), LISTEN_BACKLOG) } < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(fd)
}

/// Connects to the helper socket, translating common failures into
/// actionable messages
pub async fn connect_socket(path: &Path) -> Result<UnixStream> {
    tracing::debug!("Connecting to helper socket {}", path.display());

    match UnixStream::connect(path).await {
        Ok(stream) => Ok(stream),
        Err(e) => {
            let detailed_error = match e.kind() {
                io::ErrorKind::NotFound => format!(
                    "Socket not found at '{}'. The helper may have stopped or never started.",
                    path.display()
                ),
                io::ErrorKind::PermissionDenied => format!(
                    "Permission denied accessing socket '{}'. It belongs to another user.",
                    path.display()
                ),
                io::ErrorKind::ConnectionRefused => format!(
                    "Connection refused to socket '{}'. The helper may be starting up or \
                     shutting down.",
                    path.display()
                ),
                _ => format!(
                    "Unexpected error connecting to socket '{}': {} (kind: {:?})",
                    path.display(),
                    e,
                    e.kind()
                ),
            };

            Err(anyhow!(
                "{}\n\nOS Error Code: {}",
                detailed_error,
                e.raw_os_error().unwrap_or(-1)
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn test_bound_socket_is_owner_only() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("run").join("helper.sock");

        let listener = PlatformListener::bind(&path, None).unwrap();
        let mode = std::fs::metadata(listener.path())
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[tokio::test]
    async fn test_bind_refuses_symlinked_socket_directory() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("elsewhere");
        std::fs::create_dir(&target).unwrap();
        let link = tmp.path().join("run");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        assert!(PlatformListener::bind(&link.join("helper.sock"), None).is_err());
        assert!(!target.join("helper.sock").exists());
    }

    #[tokio::test]
    async fn test_stale_socket_file_is_replaced_and_removed_on_drop() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("helper.sock");
        std::fs::write(&path, b"stale").unwrap();

        let listener = PlatformListener::bind(&path, None).unwrap();
        assert!(path.exists());
        drop(listener);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_peer_credentials_report_this_process() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("helper.sock");
        let listener = PlatformListener::bind(&path, None).unwrap();

        let client = connect_socket(&path).await.unwrap();
        let server_side = listener.accept().await.unwrap();

        let creds = peer_credentials(&server_side).unwrap();
        assert_eq!(creds.pid, std::process::id());
        assert_eq!(creds.uid, nix::unistd::getuid().as_raw());
        drop(client);
    }

    #[tokio::test]
    async fn test_connect_to_missing_socket_explains_failure() {
        let tmp = TempDir::new().unwrap();
        let err = connect_socket(&tmp.path().join("nope.sock"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Socket not found"));
    }
}
