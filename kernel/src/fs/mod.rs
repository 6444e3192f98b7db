//! Virtual filesystem layer
//!
//! A tree of nodes exposing read/write/readdir/finddir plus the mutating
//! operations, backed here by FAT32. Nodes are identified by inode (for
//! FAT32, the first-cluster number) and come out of a fixed cache so two
//! nodes for the same inode never coexist.

use alloc::{string::String, sync::Arc, vec::Vec};

use spin::RwLock;

use crate::error::FsError;

pub mod blockdev;
pub mod fat32;
pub mod file;
pub mod pipe;

pub use file::{FdEntry, FdKind, FdTable, OpenFlags, SeekFrom, MAX_FDS, STDERR, STDIN, STDOUT};

/// Filesystem node types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
}

/// Directory entry as surfaced by `readdir`.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub kind: NodeKind,
    pub inode: u32,
}

/// VFS node operations.
///
/// `rename` moves an entry of `self` into the directory identified by
/// `new_parent_inode` (both must live on the same filesystem); it fails
/// if the destination name exists.
pub trait VfsNode: Send + Sync {
    fn name(&self) -> String;
    fn kind(&self) -> NodeKind;
    /// Backend-opaque identity; the FAT32 backend uses the first cluster.
    fn inode(&self) -> u32;
    fn size(&self) -> u32;

    fn read(&self, offset: u32, buf: &mut [u8]) -> Result<usize, FsError>;
    fn write(&self, offset: u32, data: &[u8]) -> Result<usize, FsError>;

    /// The i-th visible entry of a directory, in on-disk order.
    fn readdir(&self, index: usize) -> Result<Option<DirEntry>, FsError>;
    /// Look up a child of a directory by name.
    fn finddir(&self, name: &str) -> Result<Arc<dyn VfsNode>, FsError>;

    fn create_file(&self, name: &str) -> Result<Arc<dyn VfsNode>, FsError>;
    fn mkdir(&self, name: &str) -> Result<Arc<dyn VfsNode>, FsError>;
    fn unlink(&self, name: &str) -> Result<(), FsError>;
    fn rmdir(&self, name: &str) -> Result<(), FsError>;
    fn rename(&self, old_name: &str, new_parent_inode: u32, new_name: &str)
        -> Result<(), FsError>;
    /// Truncate (or extend, zero-filled) a file to `size` bytes.
    fn truncate(&self, size: u32) -> Result<(), FsError>;
}

static ROOT: RwLock<Option<Arc<dyn VfsNode>>> = RwLock::new(None);

/// Mount `node` as the filesystem root.
pub fn set_root(node: Arc<dyn VfsNode>) {
    *ROOT.write() = Some(node);
}

/// The mounted root, or `NoRootFs`.
pub fn root() -> Result<Arc<dyn VfsNode>, FsError> {
    ROOT.read().clone().ok_or(FsError::NoRootFs)
}

/// Resolve an absolute path against an explicit root: split on `/` and
/// call each component's `finddir`. No `.`/`..` normalisation happens
/// here; paths are taken literally.
pub fn resolve_path_from(
    root: &Arc<dyn VfsNode>,
    path: &str,
) -> Result<Arc<dyn VfsNode>, FsError> {
    let mut node = root.clone();
    for component in path.split('/').filter(|s| !s.is_empty()) {
        node = node.finddir(component)?;
    }
    Ok(node)
}

/// Resolve an absolute path against the mounted root.
pub fn resolve_path(path: &str) -> Result<Arc<dyn VfsNode>, FsError> {
    resolve_path_from(&root()?, path)
}

/// Walk each segment of `path`, creating missing directories. Idempotent
/// on existing directories; fails if an intermediate component exists as
/// a file.
pub fn ensure_path_exists_from(
    root: &Arc<dyn VfsNode>,
    path: &str,
) -> Result<Arc<dyn VfsNode>, FsError> {
    let mut node = root.clone();
    for component in path.split('/').filter(|s| !s.is_empty()) {
        node = match node.finddir(component) {
            Ok(next) => {
                if next.kind() != NodeKind::Directory {
                    return Err(FsError::NotADirectory);
                }
                next
            }
            Err(FsError::NotFound) => node.mkdir(component)?,
            Err(e) => return Err(e),
        };
    }
    Ok(node)
}

/// Walk/create against the mounted root.
pub fn ensure_path_exists(path: &str) -> Result<Arc<dyn VfsNode>, FsError> {
    ensure_path_exists_from(&root()?, path)
}

/// Split an absolute path into `(parent, name)`. The root itself has no
/// name and is rejected.
pub fn split_path(path: &str) -> Result<(&str, &str), FsError> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(FsError::InvalidPath);
    }
    match trimmed.rfind('/') {
        Some(0) => Ok(("/", &trimmed[1..])),
        Some(pos) => Ok((&trimmed[..pos], &trimmed[pos + 1..])),
        None => Err(FsError::InvalidPath),
    }
}

/// Join a path against a working directory: absolute paths ignore the
/// CWD, relative paths are joined with exactly one `/` separator.
pub fn join_cwd(cwd: &str, path: &str) -> String {
    if path.starts_with('/') {
        return String::from(path);
    }
    let mut joined = String::with_capacity(cwd.len() + 1 + path.len());
    joined.push_str(cwd.trim_end_matches('/'));
    joined.push('/');
    joined.push_str(path);
    joined
}

/// Collect every visible entry of a directory node.
pub fn list_dir(node: &Arc<dyn VfsNode>) -> Result<Vec<DirEntry>, FsError> {
    let mut entries = Vec::new();
    let mut index = 0;
    while let Some(entry) = node.readdir(index)? {
        entries.push(entry);
        index += 1;
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_cwd_absolute_ignores_cwd() {
        assert_eq!(join_cwd("/apps", "/etc/motd"), "/etc/motd");
    }

    #[test]
    fn test_join_cwd_relative() {
        assert_eq!(join_cwd("/apps", "cat"), "/apps/cat");
        assert_eq!(join_cwd("/", "cat"), "/cat");
    }

    #[test]
    fn test_join_cwd_single_separator() {
        assert_eq!(join_cwd("/apps/", "cat"), "/apps/cat");
    }

    #[test]
    fn test_join_cwd_no_normalisation() {
        // Dot components pass through untouched
        assert_eq!(join_cwd("/a", "./b"), "/a/./b");
    }

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("/a").unwrap(), ("/", "a"));
        assert_eq!(split_path("/a/b").unwrap(), ("/a", "b"));
        assert_eq!(split_path("/a/b/c").unwrap(), ("/a/b", "c"));
        assert_eq!(split_path("/a/b/").unwrap(), ("/a", "b"));
    }

    #[test]
    fn test_split_path_root_rejected() {
        assert!(split_path("/").is_err());
        assert!(split_path("").is_err());
    }

    #[test]
    fn test_split_path_relative_rejected() {
        assert!(split_path("name").is_err());
    }
}
