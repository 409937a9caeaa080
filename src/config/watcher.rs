//! Configuration file watcher for hot reload.
//!
//! The parent directory is watched rather than the file itself so editors
//! that save by rename are still picked up. Each candidate event is
//! fingerprinted (mtime, length, content hash); an update is delivered only
//! when the fingerprint differs from the last one delivered, so a single save
//! that produces a burst of notify events reloads exactly once.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use xxhash_rust::xxh3::xxh3_64;

use crate::config::loader::load_config;
use crate::config::schema::ProxyConfig;
use crate::observability::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    modified: Option<SystemTime>,
    len: u64,
    digest: u64,
}

impl Fingerprint {
    fn of(path: &Path) -> std::io::Result<Self> {
        let meta = fs::metadata(path)?;
        let content = fs::read(path)?;
        Ok(Self {
            modified: meta.modified().ok(),
            len: meta.len(),
            digest: xxh3_64(&content),
        })
    }
}

/// A watcher that monitors the configuration file for changes.
pub struct ConfigWatcher {
    path: PathBuf,
    update_tx: mpsc::UnboundedSender<ProxyConfig>,
    last: Arc<Mutex<Option<Fingerprint>>>,
}

impl ConfigWatcher {
    /// Create a new ConfigWatcher.
    ///
    /// Returns the watcher and a receiver for configuration updates.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<ProxyConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let last = Fingerprint::of(path).ok();

        (
            Self {
                path: path.to_path_buf(),
                update_tx,
                last: Arc::new(Mutex::new(last)),
            },
            update_rx,
        )
    }

    /// Start watching. The returned watcher must be kept alive.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let tx = self.update_tx.clone();
        let path = self.path.clone();
        let last = self.last.clone();
        let file_name = path.file_name().map(|n| n.to_os_string());

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if !(event.kind.is_modify() || event.kind.is_create()) {
                        return;
                    }
                    let ours = event
                        .paths
                        .iter()
                        .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                    if ours {
                        reload_if_changed(&path, &last, &tx);
                    }
                }
                Err(e) => tracing::error!(error = %e, "Config watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?self.path, "Config watcher started");
        Ok(watcher)
    }
}

/// Deliver a freshly loaded config if the file actually changed since the
/// last delivery. Returns true if an update was sent.
fn reload_if_changed(
    path: &Path,
    last: &Mutex<Option<Fingerprint>>,
    tx: &mpsc::UnboundedSender<ProxyConfig>,
) -> bool {
    let fingerprint = match Fingerprint::of(path) {
        Ok(fp) => fp,
        Err(e) => {
            tracing::debug!(error = %e, "Config file not readable yet");
            return false;
        }
    };

    let mut last = last.lock();
    if *last == Some(fingerprint) {
        return false;
    }

    tracing::info!("Config file change detected, reloading");
    match load_config(path) {
        Ok(config) => {
            *last = Some(fingerprint);
            tx.send(config).is_ok()
        }
        Err(e) => {
            // remember the broken version so it is not re-parsed on every event
            *last = Some(fingerprint);
            tracing::error!(error = %e, "Failed to reload config, keeping current configuration");
            metrics::record_config_reload(false);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_config(name: &str, content: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "tandem-watcher-{}-{}.toml",
            name,
            std::process::id()
        ));
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn reloads_once_per_change() {
        let path = temp_config("once", "[listener]\nmax_connections = 1\n");
        let last = Mutex::new(Fingerprint::of(&path).ok());
        let (tx, mut rx) = mpsc::unbounded_channel();

        // unchanged file: nothing delivered
        assert!(!reload_if_changed(&path, &last, &tx));

        fs::write(&path, "[listener]\nmax_connections = 2\n").unwrap();
        assert!(reload_if_changed(&path, &last, &tx));
        // the same change reported again is ignored
        assert!(!reload_if_changed(&path, &last, &tx));

        let config = rx.try_recv().unwrap();
        assert_eq!(config.listener.max_connections, 2);
        assert!(rx.try_recv().is_err());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn broken_config_is_not_delivered() {
        let path = temp_config("broken", "[listener]\nmax_connections = 1\n");
        let last = Mutex::new(Fingerprint::of(&path).ok());
        let (tx, mut rx) = mpsc::unbounded_channel();

        fs::write(&path, "[listener\n").unwrap();
        assert!(!reload_if_changed(&path, &last, &tx));
        assert!(rx.try_recv().is_err());

        let _ = fs::remove_file(&path);
    }
}
