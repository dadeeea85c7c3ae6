//! Reload on configuration file changes
//!
//! Watches the shared data directory for the files the host application
//! writes (routing rules, configuration override) and runs a reload once
//! changes settle.

use crate::error::{Result, TunnelError};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Quiet period before a burst of changes triggers a reload
pub const RELOAD_DEBOUNCE: Duration = Duration::from_millis(500);

/// Runs `on_change` after watched files change. Stops when dropped.
pub struct FileReloadWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl FileReloadWatcher {
    /// Watch `names` inside `dir`.
    ///
    /// `on_change` runs on the blocking pool, at most once per `debounce`
    /// window of activity. Must be called from within a tokio runtime.
    pub fn start<F>(dir: &Path, names: &[&str], debounce: Duration, on_change: F) -> Result<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let names: Vec<OsString> = names.iter().map(OsString::from).collect();
        let (tx, rx) = mpsc::unbounded_channel::<()>();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    warn!("File watch error: {}", e);
                    return;
                }
            };
            if !matches!(
                event.kind,
                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
            ) {
                return;
            }
            let relevant = event
                .paths
                .iter()
                .filter_map(|p| p.file_name())
                .any(|name| names.iter().any(|n| n == name));
            if relevant {
                let _ = tx.send(());
            }
        })
        .map_err(|e| TunnelError::WatchFailed(e.to_string()))?;

        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| TunnelError::WatchFailed(format!("{}: {}", dir.display(), e)))?;

        let task = tokio::spawn(Self::run(rx, debounce, Arc::new(on_change)));
        info!("Watching {:?} for configuration changes", dir);

        Ok(Self {
            _watcher: watcher,
            task,
        })
    }

    async fn run<F>(mut rx: mpsc::UnboundedReceiver<()>, debounce: Duration, on_change: Arc<F>)
    where
        F: Fn() + Send + Sync + 'static,
    {
        while rx.recv().await.is_some() {
            // Restart the quiet period on every further change
            loop {
                match tokio::time::timeout(debounce, rx.recv()).await {
                    Ok(Some(())) => continue,
                    Ok(None) => return,
                    Err(_) => break,
                }
            }

            debug!("Watched files changed, reloading");
            let on_change = on_change.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || (*on_change)()).await {
                warn!("Reload after file change failed: {}", e);
            }
        }
    }
}

impl Drop for FileReloadWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn counting_watcher(dir: &Path) -> (FileReloadWatcher, Arc<AtomicUsize>) {
        let reloads = Arc::new(AtomicUsize::new(0));
        let counter = reloads.clone();
        let watcher = FileReloadWatcher::start(
            dir,
            &["routing_rules.json", "routing_rules.txt"],
            Duration::from_millis(150),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();
        (watcher, reloads)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_burst_of_changes_reloads_once() {
        let temp = TempDir::new().unwrap();
        let (_watcher, reloads) = counting_watcher(temp.path());

        let path = temp.path().join("routing_rules.json");
        for n in 0..3 {
            fs::write(&path, format!("{{\"domain\":[\"{}.example\"]}}", n)).unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(reloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unrelated_files_are_ignored() {
        let temp = TempDir::new().unwrap();
        let (_watcher, reloads) = counting_watcher(temp.path());

        fs::write(temp.path().join("preferences.json"), "{}").unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(reloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dropped_watcher_stops_reloading() {
        let temp = TempDir::new().unwrap();
        let (watcher, reloads) = counting_watcher(temp.path());
        drop(watcher);

        fs::write(temp.path().join("routing_rules.txt"), "x.com").unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(reloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_directory_fails() {
        let temp = TempDir::new().unwrap();
        let result = FileReloadWatcher::start(
            &temp.path().join("missing"),
            &["routing_rules.json"],
            RELOAD_DEBOUNCE,
            || {},
        );
        assert!(matches!(result, Err(TunnelError::WatchFailed(_))));
    }
}
