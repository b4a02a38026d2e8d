//! Version-controlled file tree holding the desired state.
//!
//! All paths handed to a [`SourceTree`] are relative to its root.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Source path not found: {0}")]
    NotFound(PathBuf),

    #[error("Source path already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("Source I/O error for '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Path traversal detected: {0}")]
    PathTraversal(String),

    #[error("Source unreachable: {0}")]
    Unreachable(String),
}

impl SourceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SourceError::Unreachable(_))
    }

    fn io(path: &Path, err: std::io::Error) -> Self {
        match err.kind() {
            ErrorKind::NotFound => SourceError::NotFound(path.to_path_buf()),
            ErrorKind::AlreadyExists => SourceError::AlreadyExists(path.to_path_buf()),
            _ => SourceError::Io {
                path: path.to_path_buf(),
                source: err,
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, SourceError>;

/// A file found in the source tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Path relative to the tree root.
    pub path: PathBuf,
    pub modified: DateTime<Utc>,
    pub size: u64,
}

pub trait SourceTree: Send + Sync {
    /// Name used in logs and connectivity alerts.
    fn name(&self) -> &str {
        "source"
    }

    /// Brings the local view up to date. Fails with a retryable error when
    /// the tree cannot be reached.
    fn refresh(&self) -> Result<()>;

    /// Revision identifier of the last refresh, if the tree is versioned.
    fn revision(&self) -> Option<String>;

    /// Lists regular, non-hidden files under `dir`, oldest first. Ties are
    /// broken by path. A missing directory yields an empty list.
    fn list_files(&self, dir: &Path) -> Result<Vec<SourceFile>>;

    fn exists(&self, path: &Path) -> bool;

    fn read(&self, path: &Path) -> Result<Vec<u8>>;

    /// Writes `bytes`, replacing any existing file.
    fn write(&self, path: &Path, bytes: &[u8]) -> Result<()>;

    /// Creates a new file; fails with [`SourceError::AlreadyExists`] instead
    /// of overwriting.
    fn create(&self, path: &Path, bytes: &[u8]) -> Result<()>;

    /// Renames `from` to `to`; fails if `to` already exists.
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    fn remove(&self, path: &Path) -> Result<()>;
}

/// Commit identifier recorded as `desired_commit`: the tree's revision, or
/// `local-<unix seconds>` when the tree is not versioned.
pub fn commit_id(source: &dyn SourceTree, now: DateTime<Utc>) -> String {
    source
        .revision()
        .unwrap_or_else(|| format!("local-{}", now.timestamp()))
}

/// A [`SourceTree`] backed by a local directory.
///
/// When the directory is a git checkout, the revision is the commit that
/// `HEAD` points at.
pub struct LocalFileTree {
    root: PathBuf,
    revision: RwLock<Option<String>>,
}

impl LocalFileTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            revision: RwLock::new(None),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves `relative` against the root, rejecting anything that could
    /// escape it.
    pub fn resolve(&self, relative: &Path) -> Result<PathBuf> {
        for component in relative.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => return Err(SourceError::PathTraversal(relative.display().to_string())),
            }
        }
        Ok(self.root.join(relative))
    }

    fn ensure_parent(&self, full: &Path) -> Result<()> {
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).map_err(|e| SourceError::io(parent, e))?;
        }
        Ok(())
    }
}

impl SourceTree for LocalFileTree {
    fn refresh(&self) -> Result<()> {
        if !self.root.is_dir() {
            return Err(SourceError::Unreachable(format!(
                "{} is not a directory",
                self.root.display()
            )));
        }
        let head = read_git_head(&self.root);
        let mut revision = self
            .revision
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *revision = head;
        Ok(())
    }

    fn revision(&self) -> Option<String> {
        self.revision
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn list_files(&self, dir: &Path) -> Result<Vec<SourceFile>> {
        let base = self.resolve(dir)?;
        if !base.is_dir() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        let walker = WalkDir::new(&base)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden(e.file_name()));

        for entry in walker {
            let entry = entry.map_err(|e| SourceError::Io {
                path: base.clone(),
                source: e.into(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let metadata = entry.metadata().map_err(|e| SourceError::Io {
                path: entry.path().to_path_buf(),
                source: e.into(),
            })?;
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            let relative = entry
                .path()
                .strip_prefix(&self.root)
                .unwrap_or(entry.path())
                .to_path_buf();
            files.push(SourceFile {
                path: relative,
                modified: DateTime::<Utc>::from(modified),
                size: metadata.len(),
            });
        }

        files.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));
        Ok(files)
    }

    fn exists(&self, path: &Path) -> bool {
        self.resolve(path).map(|p| p.exists()).unwrap_or(false)
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let full = self.resolve(path)?;
        fs::read(&full).map_err(|e| SourceError::io(path, e))
    }

    fn write(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let full = self.resolve(path)?;
        self.ensure_parent(&full)?;

        let tmp = full.with_extension("fabsync-tmp");
        fs::write(&tmp, bytes).map_err(|e| SourceError::io(path, e))?;
        fs::rename(&tmp, &full).map_err(|e| {
            if let Err(cleanup) = fs::remove_file(&tmp) {
                log::warn!("Failed to remove {}: {}", tmp.display(), cleanup);
            }
            SourceError::io(path, e)
        })
    }

    fn create(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let full = self.resolve(path)?;
        self.ensure_parent(&full)?;

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&full)
            .map_err(|e| SourceError::io(path, e))?;
        file.write_all(bytes).map_err(|e| SourceError::io(path, e))?;
        file.sync_all().map_err(|e| SourceError::io(path, e))
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;
        if dst.exists() {
            return Err(SourceError::AlreadyExists(to.to_path_buf()));
        }
        self.ensure_parent(&dst)?;
        fs::rename(&src, &dst).map_err(|e| SourceError::io(from, e))
    }

    fn remove(&self, path: &Path) -> Result<()> {
        let full = self.resolve(path)?;
        fs::remove_file(&full).map_err(|e| SourceError::io(path, e))
    }
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().map(|s| s.starts_with('.')).unwrap_or(false)
}

/// Reads the commit `HEAD` points at without shelling out to git.
fn read_git_head(root: &Path) -> Option<String> {
    let git_dir = root.join(".git");
    let head = fs::read_to_string(git_dir.join("HEAD")).ok()?;
    let head = head.trim();

    let Some(reference) = head.strip_prefix("ref: ") else {
        return Some(head.to_string()).filter(|h| !h.is_empty());
    };

    if let Ok(hash) = fs::read_to_string(git_dir.join(reference)) {
        return Some(hash.trim().to_string());
    }

    // Fall back to packed refs: "<hash> <ref>" per line.
    let packed = fs::read_to_string(git_dir.join("packed-refs")).ok()?;
    packed
        .lines()
        .filter(|line| !line.starts_with('#') && !line.starts_with('^'))
        .find_map(|line| {
            let (hash, name) = line.split_once(' ')?;
            (name == reference).then(|| hash.to_string())
        })
}
