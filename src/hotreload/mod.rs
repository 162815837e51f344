//! Tier source watching
//!
//! Three triggers lead to a reload of the identity map and the limits file:
//! filesystem notifications, a modification-time poll, and explicit requests
//! through a [`ReloadHandle`]. All of them funnel into one task, so reloads
//! are serialized. Parsing runs on the blocking pool and only the final
//! snapshot swap is visible to requests.

use crate::error::{GatewayError, Result};
use crate::tiers::{TierSources, TierStore};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Hot reload configuration
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct HotReloadConfig {
    /// Enable hot reload
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Quiet period after a file event before reloading
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Modification-time polling interval, 0 disables polling
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_debounce_ms() -> u64 {
    1000 // 1 second
}

fn default_poll_interval() -> u64 {
    5
}

impl Default for HotReloadConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            debounce_ms: default_debounce_ms(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReloadTrigger {
    FileEvent,
    Explicit,
}

/// Requests a reload from outside the watcher
#[derive(Clone)]
pub struct ReloadHandle {
    tx: mpsc::Sender<ReloadTrigger>,
}

impl ReloadHandle {
    /// Queue a reload. Returns false if the watcher is gone.
    pub fn trigger(&self) -> bool {
        match self.tx.try_send(ReloadTrigger::Explicit) {
            Ok(()) => true,
            // A reload is already queued
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Modification time and length of one source file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: Option<SystemTime>,
    len: u64,
}

impl FileStamp {
    fn read(path: &Path) -> Option<Self> {
        let metadata = std::fs::metadata(path).ok()?;
        Some(Self {
            modified: metadata.modified().ok(),
            len: metadata.len(),
        })
    }
}

/// Detects source changes by comparing file metadata
pub struct SourcePoller {
    sources: TierSources,
    last: [Option<FileStamp>; 2],
}

impl SourcePoller {
    pub fn new(sources: TierSources) -> Self {
        let last = Self::stamp(&sources);
        Self { sources, last }
    }

    fn stamp(sources: &TierSources) -> [Option<FileStamp>; 2] {
        sources.paths().map(FileStamp::read)
    }

    /// True if either source changed since the last call
    pub fn check_for_changes(&mut self) -> bool {
        let current = Self::stamp(&self.sources);
        if current == self.last {
            return false;
        }
        self.last = current;
        true
    }

    /// Record the current state as seen
    pub fn mark_seen(&mut self) {
        self.last = Self::stamp(&self.sources);
    }
}

/// Watches the tier sources and reloads the store on change
pub struct HotReloadService {
    store: Arc<TierStore>,
    sources: TierSources,
    debounce_duration: Duration,
    poll_interval: Option<Duration>,
}

impl HotReloadService {
    /// Create a new hot reload service for a file-backed store
    pub fn new(store: Arc<TierStore>, config: &HotReloadConfig) -> Result<Self> {
        let sources = store
            .sources()
            .cloned()
            .ok_or_else(|| GatewayError::Config("Tier store has no source files".to_string()))?;

        Ok(Self {
            store,
            sources,
            debounce_duration: Duration::from_millis(config.debounce_ms),
            poll_interval: Some(Duration::from_secs(config.poll_interval_secs))
                .filter(|interval| !interval.is_zero()),
        })
    }

    /// Start watching. The returned handle queues explicit reloads.
    pub fn start(self) -> Result<(ReloadHandle, JoinHandle<()>)> {
        let (tx, rx) = mpsc::channel(16);
        let watcher = self.watch_sources(tx.clone())?;

        info!(
            mapping = %self.sources.mapping_path.display(),
            limits = %self.sources.limits_path.display(),
            debounce_ms = self.debounce_duration.as_millis() as u64,
            poll_secs = self.poll_interval.map(|d| d.as_secs()).unwrap_or(0),
            "Hot reload watcher started"
        );

        let task = tokio::spawn(async move {
            // Keep watcher alive
            let _watcher = watcher;
            self.run(rx).await;
        });

        Ok((ReloadHandle { tx }, task))
    }

    fn watch_sources(&self, tx: mpsc::Sender<ReloadTrigger>) -> Result<RecommendedWatcher> {
        let watched: HashSet<PathBuf> = self
            .sources
            .paths()
            .iter()
            .map(|path| absolute(path))
            .collect();

        let mut watcher: RecommendedWatcher = Watcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    let relevant = matches!(
                        event.kind,
                        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
                    ) && event.paths.iter().any(|path| watched.contains(path));

                    if relevant {
                        // A full queue already holds a pending reload
                        let _ = tx.try_send(ReloadTrigger::FileEvent);
                    }
                }
                Err(e) => warn!(error = %e, "File watcher error"),
            },
            Config::default(),
        )
        .map_err(|e| GatewayError::Watcher(format!("Failed to create file watcher: {}", e)))?;

        // Watch the directories so files replaced by rename are still seen
        let directories: HashSet<PathBuf> = self
            .sources
            .paths()
            .iter()
            .map(|path| {
                absolute(path)
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from("."))
            })
            .collect();

        for directory in &directories {
            watcher
                .watch(directory, RecursiveMode::NonRecursive)
                .map_err(|e| {
                    GatewayError::Watcher(format!(
                        "Failed to watch {}: {}",
                        directory.display(),
                        e
                    ))
                })?;
        }

        Ok(watcher)
    }

    async fn run(self, mut rx: mpsc::Receiver<ReloadTrigger>) {
        let mut poller = SourcePoller::new(self.sources.clone());
        let mut ticker = self.poll_interval.map(|interval| {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker
        });

        loop {
            let reason = tokio::select! {
                trigger = rx.recv() => match trigger {
                    Some(ReloadTrigger::FileEvent) => {
                        // Let a burst of writes settle, then fold queued events
                        tokio::time::sleep(self.debounce_duration).await;
                        while let Ok(queued) = rx.try_recv() {
                            debug!(?queued, "Coalescing reload trigger");
                        }
                        "file-event"
                    }
                    Some(ReloadTrigger::Explicit) => "explicit",
                    None => break,
                },
                _ = tick(&mut ticker) => {
                    if !poller.check_for_changes() {
                        continue;
                    }
                    "mtime-poll"
                }
            };

            self.reload(reason).await;
            poller.mark_seen();
        }

        debug!("Hot reload watcher stopped");
    }

    async fn reload(&self, reason: &'static str) {
        debug!(reason, "Reloading tier configuration");

        let store = self.store.clone();
        match tokio::task::spawn_blocking(move || store.reload()).await {
            Ok(Ok(version)) => info!(reason, version, "Tier configuration reloaded"),
            // The store already logged the rejected source
            Ok(Err(_)) => {}
            Err(e) => error!(reason, error = %e, "Reload task failed"),
        }
    }
}

async fn tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| {
        std::env::current_dir()
            .map(|dir| dir.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    })
}

/// Start watching a file-backed store
pub fn watch_tier_sources(
    store: Arc<TierStore>,
    config: &HotReloadConfig,
) -> Result<(ReloadHandle, JoinHandle<()>)> {
    HotReloadService::new(store, config)?.start()
}
