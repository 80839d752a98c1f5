//! Shared-secret provisioning.
//!
//! The helper generates a fresh 32-byte secret at startup and writes it to the
//! per-user runtime directory, readable only by the user expected to connect.
//! The client loads it from the same path to sign its authentication request.
//! On shutdown the helper overwrites the file with zeros before unlinking it.

use std::{
    fmt,
    fs::{self, OpenOptions},
    io::{self, Read, Write},
    os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt, PermissionsExt},
    path::{Path, PathBuf},
};

use rand::{rngs::OsRng, RngCore};
use zeroize::Zeroizing;

use crate::config::SECRET_LEN;

const SECRET_FILE_MODE: u32 = 0o600;
const SECRET_DIR_MODE: u32 = 0o700;

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("{action} {path:?}: {source}")]
    Io {
        action: &'static str,
        path:   PathBuf,
        source: io::Error,
    },

    #[error("secret at {path:?} is {found} bytes, expected {expected}", expected = SECRET_LEN)]
    InvalidLength { path: PathBuf, found: usize },

    #[error("secret at {path:?} has mode {mode:o}; group/other access is not allowed")]
    InsecurePermissions { path: PathBuf, mode: u32 },

    #[error("refusing to use {path:?}: {reason}")]
    UntrustedDirectory { path: PathBuf, reason: String },
}

impl SecretError {
    fn io(action: &'static str, path: &Path, source: io::Error) -> Self {
        Self::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// In-memory copy of the shared key. Zeroed when dropped; never printed.
#[derive(Clone)]
pub struct SharedSecret {
    bytes: Zeroizing<[u8; SECRET_LEN]>,
}

impl SharedSecret {
    /// Fresh secret from the operating system CSPRNG
    pub fn generate() -> Self {
        let mut bytes = Zeroizing::new([0u8; SECRET_LEN]);
        OsRng.fill_bytes(&mut bytes[..]);
        Self { bytes }
    }

    pub fn from_bytes(raw: [u8; SECRET_LEN]) -> Self {
        Self {
            bytes: Zeroizing::new(raw),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..]
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret([REDACTED])")
    }
}

/// Persists the shared secret at a single well-known path
#[derive(Debug, Clone)]
pub struct SecretStore {
    path: PathBuf,
}

impl SecretStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Generates a new secret and writes it with mode 0600.
    ///
    /// When `owner` is given, the file and its directory are handed to that
    /// UID so the unprivileged client can read the secret. Any existing file
    /// at the path is replaced.
    pub fn generate_and_store(&self, owner: Option<u32>) -> Result<SharedSecret, SecretError> {
        if let Some(dir) = self.path.parent() {
            ensure_private_dir(dir, owner)?;
        }

        match fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!("Replaced stale secret at {:?}", self.path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(SecretError::io("remove stale secret", &self.path, e)),
        }

        let secret = SharedSecret::generate();

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(SECRET_FILE_MODE)
            .custom_flags(libc::O_NOFOLLOW)
            .open(&self.path)
            .map_err(|e| SecretError::io("create secret", &self.path, e))?;

        // The mode passed to open() is filtered through the umask.
        file.set_permissions(fs::Permissions::from_mode(SECRET_FILE_MODE))
            .map_err(|e| SecretError::io("restrict secret", &self.path, e))?;

        if let Some(uid) = owner {
            std::os::unix::fs::fchown(&file, Some(uid), None)
                .map_err(|e| SecretError::io("chown secret", &self.path, e))?;
        }

        file.write_all(secret.as_bytes())
            .and_then(|()| file.sync_all())
            .map_err(|e| SecretError::io("write secret", &self.path, e))?;

        tracing::info!("Shared secret written to {:?}", self.path);
        Ok(secret)
    }

    /// Reads the secret back. Returns `Ok(None)` if no secret file exists.
    pub fn load(&self) -> Result<Option<SharedSecret>, SecretError> {
        let mut file = match OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NOFOLLOW)
            .open(&self.path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SecretError::io("open secret", &self.path, e)),
        };

        let mode = file
            .metadata()
            .map_err(|e| SecretError::io("stat secret", &self.path, e))?
            .permissions()
            .mode()
            & 0o777;
        if mode & 0o077 != 0 {
            return Err(SecretError::InsecurePermissions {
                path: self.path.clone(),
                mode,
            });
        }

        let mut contents = Zeroizing::new(Vec::with_capacity(SECRET_LEN));
        file.read_to_end(&mut contents)
            .map_err(|e| SecretError::io("read secret", &self.path, e))?;

        let raw: [u8; SECRET_LEN] =
            contents
                .as_slice()
                .try_into()
                .map_err(|_| SecretError::InvalidLength {
                    path:  self.path.clone(),
                    found: contents.len(),
                })?;
        Ok(Some(SharedSecret::from_bytes(raw)))
    }

    /// Overwrites the file with zeros, flushes, then unlinks it.
    /// A missing file is not an error.
    pub fn delete(&self) -> Result<(), SecretError> {
        let mut file = match OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NOFOLLOW)
            .open(&self.path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(SecretError::io("open secret for erase", &self.path, e)),
        };

        let len = file
            .metadata()
            .map_err(|e| SecretError::io("stat secret", &self.path, e))?
            .len() as usize;
        file.write_all(&vec![0u8; len.max(SECRET_LEN)])
            .and_then(|()| file.sync_all())
            .map_err(|e| SecretError::io("erase secret", &self.path, e))?;
        drop(file);

        fs::remove_file(&self.path).map_err(|e| SecretError::io("remove secret", &self.path, e))?;
        tracing::info!("Shared secret erased from {:?}", self.path);
        Ok(())
    }
}

/// Creates `dir` (mode 0700) if missing and tightens it if it already exists.
///
/// An existing path must be a real directory owned by the current user or by
/// `owner`. The mode and ownership are changed through a descriptor opened
/// with `O_NOFOLLOW`, so a symlink planted at `dir` is never followed.
pub(crate) fn ensure_private_dir(dir: &Path, owner: Option<u32>) -> Result<(), SecretError> {
    fs::DirBuilder::new()
        .recursive(true)
        .mode(SECRET_DIR_MODE)
        .create(dir)
        .map_err(|e| SecretError::io("create directory", dir, e))?;

    let untrusted = |reason: String| SecretError::UntrustedDirectory {
        path: dir.to_path_buf(),
        reason,
    };

    let link_meta =
        fs::symlink_metadata(dir).map_err(|e| SecretError::io("inspect directory", dir, e))?;
    if link_meta.file_type().is_symlink() {
        return Err(untrusted("path is a symbolic link".to_string()));
    }
    if !link_meta.is_dir() {
        return Err(untrusted("path is not a directory".to_string()));
    }

    let handle = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_DIRECTORY | libc::O_NOFOLLOW)
        .open(dir)
        .map_err(|e| SecretError::io("open directory", dir, e))?;
    let meta = handle
        .metadata()
        .map_err(|e| SecretError::io("inspect directory", dir, e))?;

    let current_uid = nix::unistd::geteuid().as_raw();
    if meta.uid() != current_uid && Some(meta.uid()) != owner {
        return Err(untrusted(format!("directory is owned by uid {}", meta.uid())));
    }

    handle
        .set_permissions(fs::Permissions::from_mode(SECRET_DIR_MODE))
        .map_err(|e| SecretError::io("restrict directory", dir, e))?;
    if let Some(uid) = owner {
        std::os::unix::fs::fchown(&handle, Some(uid), None)
            .map_err(|e| SecretError::io("chown directory", dir, e))?;
    }
    Ok(())
}
