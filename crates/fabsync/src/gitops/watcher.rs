//! File system watcher for the source tree and the raw drop directory.
//!
//! Changes are debounced and forwarded to the scheduler as sync triggers.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer, DebouncedEvent, Debouncer};
use tokio::sync::broadcast;

use super::error::{GitOpsError, Result};
use super::ingest;
use super::resource::ResourceKind;

const DEBOUNCE: Duration = Duration::from_millis(500);

/// Watches the source root and sends `()` on `trigger` for relevant changes.
pub struct SourceWatcher {
    root: PathBuf,
    raw_dir: PathBuf,
    trigger: broadcast::Sender<()>,
    shutdown: Arc<AtomicBool>,
}

impl SourceWatcher {
    /// `raw_dir` is relative to `root`.
    pub fn new(root: impl Into<PathBuf>, raw_dir: impl Into<PathBuf>, trigger: broadcast::Sender<()>) -> Self {
        Self {
            root: root.into(),
            raw_dir: raw_dir.into(),
            trigger,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Watches until [`SourceWatcher::stop`] is called.
    pub fn watch(&self) -> Result<()> {
        let (tx, rx) = std::sync::mpsc::channel();

        let mut debouncer: Debouncer<RecommendedWatcher> =
            new_debouncer(DEBOUNCE, tx).map_err(|e| GitOpsError::WatchError(e.to_string()))?;
        debouncer
            .watcher()
            .watch(&self.root, RecursiveMode::Recursive)
            .map_err(|e| GitOpsError::WatchError(e.to_string()))?;

        log::info!("Started watching source tree: {}", self.root.display());

        loop {
            if self.is_stopped() {
                break;
            }

            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(Ok(events)) => {
                    let relevant: Vec<&DebouncedEvent> =
                        events.iter().filter(|e| self.is_relevant(&e.path)).collect();
                    if let Some(first) = relevant.first() {
                        log::debug!(
                            "{} change(s) under {}, first: {}",
                            relevant.len(),
                            self.root.display(),
                            first.path.display()
                        );
                        // No scheduler listening is fine
                        let _ = self.trigger.send(());
                    }
                }
                Ok(Err(e)) => {
                    log::error!("Watch error: {}", e);
                }
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        log::info!("Stopped watching source tree");
        Ok(())
    }

    /// YAML files in the raw directory or a managed kind directory.
    fn is_relevant(&self, path: &Path) -> bool {
        let Ok(relative) = path.strip_prefix(&self.root) else {
            return false;
        };
        if !ingest::is_yaml(relative) {
            return false;
        }
        if relative.starts_with(&self.raw_dir) {
            return true;
        }
        relative
            .components()
            .next()
            .and_then(|c| c.as_os_str().to_str())
            .and_then(ResourceKind::from_directory)
            .is_some()
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

/// Runs a [`SourceWatcher`] on a background thread.
pub struct BackgroundWatcher {
    watcher: Arc<SourceWatcher>,
    handle: Option<std::thread::JoinHandle<Result<()>>>,
}

impl BackgroundWatcher {
    pub fn start(watcher: SourceWatcher) -> Self {
        let watcher = Arc::new(watcher);
        let thread_watcher = Arc::clone(&watcher);
        Self {
            watcher,
            handle: Some(std::thread::spawn(move || thread_watcher.watch())),
        }
    }

    pub fn stop(&mut self) {
        self.watcher.stop();
        if let Some(handle) = self.handle.take() {
            match handle.join() {
                Ok(Err(e)) => log::error!("Watcher stopped with error: {}", e),
                Err(_) => log::error!("Watcher thread panicked"),
                Ok(Ok(())) => {}
            }
        }
    }
}

impl Drop for BackgroundWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn watcher(dir: &TempDir) -> (SourceWatcher, broadcast::Receiver<()>) {
        let (tx, rx) = broadcast::channel(16);
        (SourceWatcher::new(dir.path(), "raw", tx), rx)
    }

    #[test]
    fn test_relevant_paths() {
        let dir = TempDir::new().unwrap();
        let (watcher, _rx) = watcher(&dir);
        let root = dir.path();

        assert!(watcher.is_relevant(&root.join("raw/batch.yaml")));
        assert!(watcher.is_relevant(&root.join("vpcs/vpc-1.yml")));
        assert!(!watcher.is_relevant(&root.join("raw/notes.txt")));
        assert!(!watcher.is_relevant(&root.join("docs/readme.yaml")));
        assert!(!watcher.is_relevant(Path::new("/elsewhere/vpcs/vpc-1.yaml")));
    }

    #[test]
    fn test_watcher_stop() {
        let dir = TempDir::new().unwrap();
        let (watcher, _rx) = watcher(&dir);

        assert!(!watcher.is_stopped());
        watcher.stop();
        assert!(watcher.is_stopped());
    }

    #[test]
    fn test_file_change_sends_trigger() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("raw")).unwrap();
        let (watcher, mut rx) = watcher(&dir);
        let mut background = BackgroundWatcher::start(watcher);

        std::thread::sleep(Duration::from_millis(200));
        fs::write(dir.path().join("raw/batch.yaml"), "kind: VPC\n").unwrap();

        let mut triggered = false;
        for _ in 0..40 {
            std::thread::sleep(Duration::from_millis(50));
            if rx.try_recv().is_ok() {
                triggered = true;
                break;
            }
        }
        background.stop();
        assert!(triggered, "no trigger after writing a raw file");
    }
}
