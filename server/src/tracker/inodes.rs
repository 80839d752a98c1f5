//! Socket inode to PID resolution by walking `/proc/<pid>/fd`.
//!
//! Processes routinely exit mid-scan, so every per-process read failure is
//! skipped rather than reported.

use std::{
    collections::{HashMap, HashSet},
    fs,
    path::Path,
};

/// Result of one scan over the process table
#[derive(Debug, Default)]
pub struct InodeMap {
    /// Socket inode to owning PID
    pub owners: HashMap<u64, u32>,
    /// Every PID directory seen during the scan
    pub pids:   HashSet<u32>,
}

impl InodeMap {
    pub fn owner(&self, inode: u64) -> Option<u32> {
        self.owners.get(&inode).copied()
    }
}

/// Extracts the inode from a descriptor link target of the form `socket:[N]`
pub fn socket_inode(target: &str) -> Option<u64> {
    target
        .strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

/// Walks every numeric directory under `proc_root` and records which PID
/// holds each socket descriptor.
///
/// When two processes share a socket (after fork), the lower PID wins so the
/// result does not depend on directory iteration order.
pub fn scan(proc_root: &Path) -> InodeMap {
    let mut map = InodeMap::default();

    let entries = match fs::read_dir(proc_root) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("Cannot read process table at {}: {}", proc_root.display(), e);
            return map;
        }
    };

    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        map.pids.insert(pid);

        let Ok(fds) = fs::read_dir(entry.path().join("fd")) else {
            continue;
        };
        for fd in fds.flatten() {
            let Ok(target) = fs::read_link(fd.path()) else {
                continue;
            };
            let Some(inode) = target.to_str().and_then(socket_inode) else {
                continue;
            };
            map.owners
                .entry(inode)
                .and_modify(|owner| *owner = (*owner).min(pid))
                .or_insert(pid);
        }
    }

    tracing::trace!(
        processes = map.pids.len(),
        sockets = map.owners.len(),
        "Socket inode scan complete"
    );
    map
}

/// Short command name from `/proc/<pid>/comm`
pub fn process_name(proc_root: &Path, pid: u32) -> Option<String> {
    let raw = fs::read_to_string(proc_root.join(pid.to_string()).join("comm")).ok()?;
    let name = raw.trim_end_matches('\n').trim();
    (!name.is_empty()).then(|| name.to_string())
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::symlink;

    use tempfile::TempDir;

    use super::*;

    fn fake_process(root: &Path, pid: u32, comm: &str, links: &[&str]) {
        let fd_dir = root.join(pid.to_string()).join("fd");
        fs::create_dir_all(&fd_dir).unwrap();
        fs::write(root.join(pid.to_string()).join("comm"), format!("{comm}\n")).unwrap();
        for (n, target) in links.iter().enumerate() {
            symlink(target, fd_dir.join(n.to_string())).unwrap();
        }
    }

    #[test]
    fn test_socket_inode_parsing() {
        assert_eq!(socket_inode("socket:[48211]"), Some(48211));
        assert_eq!(socket_inode("pipe:[48211]"), None);
        assert_eq!(socket_inode("/dev/null"), None);
        assert_eq!(socket_inode("socket:[]"), None);
        assert_eq!(socket_inode("socket:[12"), None);
    }

    #[test]
    fn test_scan_maps_socket_descriptors_to_pids() {
        let tmp = TempDir::new().unwrap();
        fake_process(tmp.path(), 100, "curl", &["socket:[111]", "/dev/null", "pipe:[5]"]);
        fake_process(tmp.path(), 200, "firefox", &["socket:[222]", "socket:[333]"]);
        fs::create_dir_all(tmp.path().join("net")).unwrap();
        fs::create_dir_all(tmp.path().join("self")).unwrap();

        let map = scan(tmp.path());
        assert_eq!(map.owner(111), Some(100));
        assert_eq!(map.owner(222), Some(200));
        assert_eq!(map.owner(333), Some(200));
        assert_eq!(map.owner(5), None);
        assert_eq!(map.pids, HashSet::from([100, 200]));
    }

    #[test]
    fn test_shared_socket_is_attributed_to_lowest_pid() {
        let tmp = TempDir::new().unwrap();
        fake_process(tmp.path(), 300, "child", &["socket:[999]"]);
        fake_process(tmp.path(), 30, "parent", &["socket:[999]"]);

        assert_eq!(scan(tmp.path()).owner(999), Some(30));
    }

    #[test]
    fn test_process_without_fd_dir_is_still_seen() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("42")).unwrap();

        let map = scan(tmp.path());
        assert!(map.pids.contains(&42));
        assert!(map.owners.is_empty());
    }

    #[test]
    fn test_missing_proc_root_yields_empty_map() {
        let tmp = TempDir::new().unwrap();
        let map = scan(&tmp.path().join("absent"));
        assert!(map.owners.is_empty());
        assert!(map.pids.is_empty());
    }

    #[test]
    fn test_process_name_reads_comm() {
        let tmp = TempDir::new().unwrap();
        fake_process(tmp.path(), 77, "sshd", &[]);
        assert_eq!(process_name(tmp.path(), 77).as_deref(), Some("sshd"));
        assert_eq!(process_name(tmp.path(), 78), None);
    }
}
