//! Virtual filesystem
//!
//! The [`VirtualFs`] trait is the narrow surface the shell, SCP and SFTP
//! services need. [`MemoryFs`] is an in-memory tree seeded with a
//! Debian-like layout; files written into it can also be mirrored to a
//! capture directory on the real disk. The tree is shared by every session,
//! so the total size of file contents it holds is capped.

use crate::config::UserEntry;
use crate::helper::sanitize_file_name;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::io;
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock};
use tracing::{info, warn};

/// One directory listing entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// File name (no directory part)
    pub name: String,
    /// Whether the entry is a directory
    pub is_dir: bool,
    /// Size in bytes (0 for directories)
    pub size: u64,
}

/// Filesystem operations used by the fabricated system
///
/// All paths are absolute; callers resolve them with [`resolve_path`].
pub trait VirtualFs: Send + Sync + Debug {
    /// Whether anything exists at `path`
    fn exists(&self, path: &str) -> bool;

    /// Whether `path` is a directory
    fn is_dir(&self, path: &str) -> bool;

    /// Create `path` and any missing parents
    fn create_dir_all(&self, path: &str) -> io::Result<()>;

    /// List the entries of a directory, sorted by name
    fn read_dir(&self, path: &str) -> io::Result<Vec<DirEntry>>;

    /// Read a whole file
    fn read_file(&self, path: &str) -> io::Result<Vec<u8>>;

    /// Create or replace a file; the parent directory must exist
    fn write_file(&self, path: &str, data: &[u8]) -> io::Result<()>;

    /// Size of a regular file
    fn file_size(&self, path: &str) -> Option<u64> {
        self.read_file(path).ok().map(|d| d.len() as u64)
    }
}

/// Resolve `path` against `cwd`, expanding a leading `~` to `home`
///
/// The result is absolute and normalized (`.` and `..` removed, `..` at the
/// root stays at the root).
pub fn resolve_path(cwd: &str, home: &str, path: &str) -> String {
    let path = if path == "~" || path.starts_with("~/") {
        path.replacen('~', home, 1)
    } else {
        path.to_string()
    };

    let mut components: Vec<&str> = Vec::new();
    if !path.starts_with('/') {
        components.extend(cwd.split('/').filter(|c| !c.is_empty()));
    }

    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                components.pop();
            }
            c => components.push(c),
        }
    }

    if components.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", components.join("/"))
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

fn not_found(path: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("{}: No such file or directory", path),
    )
}

/// Default cap on file contents held by a [`MemoryFs`]
pub const DEFAULT_BYTE_BUDGET: usize = 256 * 1024 * 1024;

#[derive(Debug, Default)]
struct Tree {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    stored: usize,
}

/// In-memory filesystem
#[derive(Debug)]
pub struct MemoryFs {
    tree: RwLock<Tree>,
    capture_dir: Option<PathBuf>,
    byte_budget: usize,
}

impl Default for MemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFs {
    /// An empty filesystem containing only `/`
    pub fn new() -> Self {
        let mut tree = Tree::default();
        tree.dirs.insert("/".to_string());
        MemoryFs {
            tree: RwLock::new(tree),
            capture_dir: None,
            byte_budget: DEFAULT_BYTE_BUDGET,
        }
    }

    /// A filesystem with the usual top-level layout and a few identity files
    pub fn seeded(hostname: &str, users: &[UserEntry]) -> Self {
        let fs = Self::new();
        for dir in [
            "/bin", "/boot", "/dev", "/etc", "/home", "/lib", "/mnt", "/opt", "/proc", "/root",
            "/run", "/sbin", "/srv", "/sys", "/tmp", "/usr/bin", "/usr/lib", "/usr/local/bin",
            "/usr/sbin", "/usr/share", "/var/lib", "/var/log", "/var/tmp", "/var/www",
        ] {
            // paths are static and well formed
            let _ = fs.create_dir_all(dir);
        }

        let mut passwd = String::from(
            "root:x:0:0:root:/root:/bin/bash\n\
             daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin\n\
             bin:x:2:2:bin:/bin:/usr/sbin/nologin\n\
             sys:x:3:3:sys:/dev:/usr/sbin/nologin\n\
             www-data:x:33:33:www-data:/var/www:/usr/sbin/nologin\n\
             sshd:x:105:65534::/run/sshd:/usr/sbin/nologin\n",
        );
        for user in users.iter().filter(|u| u.name != "root") {
            passwd.push_str(&format!(
                "{}:x:{}:{}::{}:{}\n",
                user.name,
                user.uid,
                user.gid,
                user.home_dir(),
                user.shell
            ));
        }

        let files: [(&str, String); 6] = [
            ("/etc/hostname", format!("{}\n", hostname)),
            ("/etc/passwd", passwd),
            ("/etc/issue", "Debian GNU/Linux 9 \\n \\l\n\n".to_string()),
            (
                "/etc/os-release",
                "PRETTY_NAME=\"Debian GNU/Linux 9 (stretch)\"\n\
                 NAME=\"Debian GNU/Linux\"\n\
                 VERSION_ID=\"9\"\n\
                 VERSION=\"9 (stretch)\"\n\
                 ID=debian\n"
                    .to_string(),
            ),
            (
                "/etc/hosts",
                format!("127.0.0.1\tlocalhost\n127.0.1.1\t{}\n", hostname),
            ),
            ("/proc/version", format!("{}\n", super::command::KERNEL_VERSION)),
        ];
        for (path, content) in files {
            let _ = fs.write_file(path, content.as_bytes());
        }

        fs
    }

    /// Mirror every written file into `dir` on the real filesystem
    pub fn with_capture_dir(mut self, dir: PathBuf) -> Self {
        self.capture_dir = Some(dir);
        self
    }

    /// Cap the total size of file contents at `bytes`
    pub fn with_byte_budget(mut self, bytes: usize) -> Self {
        self.byte_budget = bytes;
        self
    }

    /// Total size of file contents currently held
    pub fn stored_bytes(&self) -> usize {
        self.tree
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .stored
    }

    fn capture(&self, path: &str, data: &[u8]) {
        let Some(dir) = &self.capture_dir else {
            return;
        };

        let stamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let target = dir.join(format!("{}-{}", stamp, sanitize_file_name(path)));

        let result = std::fs::create_dir_all(dir).and_then(|_| std::fs::write(&target, data));
        match result {
            Ok(()) => info!(path, saved = ?target, size = data.len(), "Captured uploaded file"),
            Err(e) => warn!(path, error = %e, "Failed to capture uploaded file"),
        }
    }
}

impl VirtualFs for MemoryFs {
    fn exists(&self, path: &str) -> bool {
        let path = resolve_path("/", "/", path);
        let tree = self.tree.read().unwrap_or_else(PoisonError::into_inner);
        tree.dirs.contains(&path) || tree.files.contains_key(&path)
    }

    fn is_dir(&self, path: &str) -> bool {
        let path = resolve_path("/", "/", path);
        let tree = self.tree.read().unwrap_or_else(PoisonError::into_inner);
        tree.dirs.contains(&path)
    }

    fn create_dir_all(&self, path: &str) -> io::Result<()> {
        let path = resolve_path("/", "/", path);
        let mut tree = self.tree.write().unwrap_or_else(PoisonError::into_inner);

        let mut current = String::new();
        for component in path.split('/').filter(|c| !c.is_empty()) {
            current.push('/');
            current.push_str(component);
            if tree.files.contains_key(&current) {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{}: Not a directory", current),
                ));
            }
            tree.dirs.insert(current.clone());
        }
        Ok(())
    }

    fn read_dir(&self, path: &str) -> io::Result<Vec<DirEntry>> {
        let path = resolve_path("/", "/", path);
        let tree = self.tree.read().unwrap_or_else(PoisonError::into_inner);
        if !tree.dirs.contains(&path) {
            return Err(not_found(&path));
        }

        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        let direct_child = |p: &str| {
            p.strip_prefix(&prefix)
                .filter(|rest| !rest.is_empty() && !rest.contains('/'))
                .map(str::to_string)
        };

        let mut entries: Vec<DirEntry> = tree
            .dirs
            .iter()
            .filter_map(|d| direct_child(d))
            .map(|name| DirEntry {
                name,
                is_dir: true,
                size: 0,
            })
            .collect();
        entries.extend(tree.files.iter().filter_map(|(p, data)| {
            direct_child(p).map(|name| DirEntry {
                name,
                is_dir: false,
                size: data.len() as u64,
            })
        }));
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn read_file(&self, path: &str) -> io::Result<Vec<u8>> {
        let path = resolve_path("/", "/", path);
        let tree = self.tree.read().unwrap_or_else(PoisonError::into_inner);
        if tree.dirs.contains(&path) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("{}: Is a directory", path),
            ));
        }
        tree.files.get(&path).cloned().ok_or_else(|| not_found(&path))
    }

    fn write_file(&self, path: &str, data: &[u8]) -> io::Result<()> {
        let path = resolve_path("/", "/", path);
        {
            let mut tree = self.tree.write().unwrap_or_else(PoisonError::into_inner);
            if tree.dirs.contains(&path) {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("{}: Is a directory", path),
                ));
            }
            if !tree.dirs.contains(parent_of(&path)) {
                return Err(not_found(parent_of(&path)));
            }

            let replaced = tree.files.get(&path).map_or(0, Vec::len);
            let stored = tree.stored - replaced + data.len();
            if stored > self.byte_budget {
                warn!(path = %path, size = data.len(), stored = tree.stored, "Filesystem budget exhausted");
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("{}: No space left on device", path),
                ));
            }
            tree.stored = stored;
            tree.files.insert(path.clone(), data.to_vec());
        }
        self.capture(&path, data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_path() {
        assert_eq!(resolve_path("/root", "/root", "tmp"), "/root/tmp");
        assert_eq!(resolve_path("/root", "/root", "/etc/../var"), "/var");
        assert_eq!(resolve_path("/", "/root", ".."), "/");
        assert_eq!(resolve_path("/tmp", "/home/bob", "~"), "/home/bob");
        assert_eq!(resolve_path("/tmp", "/home/bob", "~/x/./y"), "/home/bob/x/y");
        assert_eq!(resolve_path("/tmp", "/home/bob", "a//b/"), "/tmp/a/b");
    }

    #[test]
    fn test_parent_of() {
        assert_eq!(parent_of("/etc/passwd"), "/etc");
        assert_eq!(parent_of("/etc"), "/");
        assert_eq!(parent_of("/"), "/");
    }

    #[test]
    fn test_create_and_list() {
        let fs = MemoryFs::new();
        fs.create_dir_all("/a/b/c").unwrap();
        fs.write_file("/a/file.txt", b"data").unwrap();

        assert!(fs.is_dir("/a/b"));
        assert!(fs.exists("/a/file.txt"));
        assert!(!fs.is_dir("/a/file.txt"));

        let entries = fs.read_dir("/a").unwrap();
        assert_eq!(
            entries,
            vec![
                DirEntry {
                    name: "b".into(),
                    is_dir: true,
                    size: 0
                },
                DirEntry {
                    name: "file.txt".into(),
                    is_dir: false,
                    size: 4
                },
            ]
        );
    }

    #[test]
    fn test_write_requires_parent() {
        let fs = MemoryFs::new();
        let err = fs.write_file("/missing/file", b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_file_blocks_directory_creation() {
        let fs = MemoryFs::new();
        fs.write_file("/f", b"x").unwrap();
        assert!(fs.create_dir_all("/f/sub").is_err());
        assert!(fs.read_file("/").is_err());
    }

    #[test]
    fn test_byte_budget() {
        let fs = MemoryFs::new().with_byte_budget(10);
        fs.create_dir_all("/tmp").unwrap();
        fs.write_file("/tmp/a", b"123456").unwrap();
        assert_eq!(fs.stored_bytes(), 6);

        let err = fs.write_file("/tmp/b", b"12345").unwrap_err();
        assert!(err.to_string().contains("No space left on device"));
        assert!(!fs.exists("/tmp/b"));
        assert_eq!(fs.stored_bytes(), 6);

        // replacing a file only counts the difference
        fs.write_file("/tmp/a", b"1234567890").unwrap();
        assert_eq!(fs.stored_bytes(), 10);
        fs.write_file("/tmp/a", b"").unwrap();
        fs.write_file("/tmp/b", b"12345").unwrap();
        assert_eq!(fs.stored_bytes(), 5);
    }

    #[test]
    fn test_budget_rejection_skips_capture() {
        let dir = tempfile::tempdir().unwrap();
        let fs = MemoryFs::new()
            .with_capture_dir(dir.path().to_path_buf())
            .with_byte_budget(4);
        fs.create_dir_all("/tmp").unwrap();
        assert!(fs.write_file("/tmp/big", b"too large").is_err());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_seeded_layout() {
        let users = vec![UserEntry::new("admin", "admin")];
        let fs = MemoryFs::seeded("web01", &users);

        assert!(fs.is_dir("/tmp"));
        assert!(fs.is_dir("/usr/bin"));
        assert_eq!(fs.read_file("/etc/hostname").unwrap(), b"web01\n");
        let passwd = String::from_utf8(fs.read_file("/etc/passwd").unwrap()).unwrap();
        assert!(passwd.contains("admin:x:1000:1000::/home/admin:/bin/bash"));
        assert_eq!(fs.file_size("/etc/hostname"), Some(6));
    }

    #[test]
    fn test_capture_dir_mirrors_writes() {
        let dir = tempfile::tempdir().unwrap();
        let fs = MemoryFs::new().with_capture_dir(dir.path().to_path_buf());
        fs.create_dir_all("/tmp").unwrap();
        fs.write_file("/tmp/payload.sh", b"#!/bin/sh\n").unwrap();

        let saved: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(saved.len(), 1);
        assert!(saved[0].to_string_lossy().ends_with("_tmp_payload.sh"));
        assert_eq!(std::fs::read(&saved[0]).unwrap(), b"#!/bin/sh\n");
    }
}
