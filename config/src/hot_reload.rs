//! # Configuration Hot Reload
//!
//! Watches the configuration directories and reloads the
//! [`ConfigManager`] once per burst of file changes.
//!
//! The `notify` callback only classifies events and pushes them into a
//! bounded channel. A single consumer task drains the channel, records each
//! change, and re-arms one debounce deadline; when the deadline passes
//! without further changes it performs exactly one reload. Closing the
//! channel ([`ConfigWatcher::stop`]) ends the consumer and drops any armed
//! deadline.

use crate::file_loader::is_config_file;
use crate::manager::ConfigManager;
use chrono::{DateTime, Utc};
use errors::{ConfigError, ConfigResult};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Changes buffered between the filesystem listener and the consumer.
const EVENT_QUEUE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
    Reloaded
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Modified => "modified",
            Self::Deleted => "deleted",
            Self::Reloaded => "reloaded"
        };
        f.write_str(name)
    }
}

/// One observed change. `reloaded` events carry the configuration before
/// and after the reload.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeEvent {
    pub id: String,
    pub kind: ChangeKind,
    pub path: PathBuf,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_config: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_config: Option<Value>
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind, path: impl Into<PathBuf>) -> Self {
        let timestamp = Utc::now();
        Self {
            id: format!("{kind}_{}", timestamp.timestamp_millis()),
            kind,
            path: path.into(),
            timestamp,
            old_config: None,
            new_config: None
        }
    }
}

/// Receives change events and reload failures.
pub trait ChangeHandler: Send + Sync {
    fn on_event(&self, event: &ChangeEvent) -> anyhow::Result<()>;

    fn on_error(&self, _error: &ConfigError) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub kind: Option<ChangeKind>,
    /// Matches events whose path ends with this path.
    pub path: Option<PathBuf>
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatcherStatus {
    pub watching: bool,
    pub watch_dirs: Vec<PathBuf>,
    pub handler_count: usize,
    pub recent_event_count: usize,
    pub reload_pending: bool
}

struct Running {
    // dropping the watcher deregisters the filesystem listener
    _watcher: RecommendedWatcher,
    tx: mpsc::Sender<(ChangeKind, PathBuf)>
}

pub struct ConfigWatcher {
    manager: Arc<ConfigManager>,
    watch_dirs: Vec<PathBuf>,
    ignore_dir: Option<PathBuf>,
    debounce: Duration,
    max_events: usize,
    handlers: RwLock<Vec<Arc<dyn ChangeHandler>>>,
    events: Mutex<VecDeque<ChangeEvent>>,
    reload_lock: Mutex<()>,
    pending: AtomicBool,
    running: Mutex<Option<Running>>
}

impl ConfigWatcher {
    /// A stopped watcher over the manager's configuration directory.
    pub fn new(manager: Arc<ConfigManager>, debounce: Duration, max_events: usize) -> Self {
        let watch_dirs = vec![manager.config_dir().to_path_buf()];
        Self {
            manager,
            watch_dirs,
            ignore_dir: None,
            debounce,
            max_events: max_events.max(1),
            handlers: RwLock::new(Vec::new()),
            events: Mutex::new(VecDeque::new()),
            reload_lock: Mutex::new(()),
            pending: AtomicBool::new(false),
            running: Mutex::new(None)
        }
    }

    /// Changes below `dir` (the version store) are ignored.
    pub fn ignoring(mut self, dir: impl Into<PathBuf>) -> Self {
        self.ignore_dir = Some(dir.into());
        self
    }

    pub fn add_handler(&self, handler: Arc<dyn ChangeHandler>) {
        self.handlers.write().push(handler);
    }

    pub fn is_watching(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Starts listening. Must be called from within a Tokio runtime.
    ///
    /// # M-CANONICAL-DOCS
    ///
    /// ## Purpose
    /// Registers a recursive `notify` watch on every watch directory and
    /// spawns the debounce consumer. Calling `start` while watching is a
    /// no-op.
    ///
    /// ## Error Handling
    /// Returns `ConfigError::Watch` when there is no runtime or the
    /// platform watcher cannot be created or registered.
    pub fn start(self: &Arc<Self>) -> ConfigResult<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| ConfigError::Watch {
            reason: format!("no async runtime: {e}")
        })?;

        let (tx, rx) = mpsc::channel(EVENT_QUEUE);
        let listener_tx = tx.clone();
        let ignore_dir = self.ignore_dir.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    let Some(kind) = classify(&event.kind) else {
                        return;
                    };
                    for path in event.paths {
                        if !is_relevant(&path, ignore_dir.as_deref()) {
                            continue;
                        }
                        if listener_tx.try_send((kind, path)).is_err() {
                            debug!("change queue full or closed, dropping event");
                        }
                    }
                }
                Err(e) => warn!("Watch error: {e}")
            },
            notify::Config::default()
        )
        .map_err(|e| ConfigError::Watch {
            reason: format!("failed to create file watcher: {e}")
        })?;

        for dir in &self.watch_dirs {
            watcher
                .watch(dir, RecursiveMode::Recursive)
                .map_err(|e| ConfigError::Watch {
                    reason: format!("failed to watch {}: {e}", dir.display())
                })?;
            info!(dir = %dir.display(), "watching configuration directory");
        }

        runtime.spawn(Arc::clone(self).consume(rx));
        *running = Some(Running {
            _watcher: watcher,
            tx
        });
        Ok(())
    }

    /// Deregisters the listener and closes the change channel. A reload
    /// already running completes.
    pub fn stop(&self) {
        if self.running.lock().take().is_some() {
            self.pending.store(false, Ordering::SeqCst);
            info!("configuration watcher stopped");
        }
    }

    /// Feeds a change into the debounce pipeline as if the filesystem
    /// listener had observed it. Returns `false` when not watching.
    pub fn notify_change(&self, kind: ChangeKind, path: impl Into<PathBuf>) -> bool {
        let running = self.running.lock();
        let Some(running) = running.as_ref() else {
            return false;
        };
        running.tx.try_send((kind, path.into())).is_ok()
    }

    async fn consume(self: Arc<Self>, mut rx: mpsc::Receiver<(ChangeKind, PathBuf)>) {
        let mut deadline: Option<Instant> = None;
        let mut trigger = PathBuf::new();
        loop {
            tokio::select! {
                change = rx.recv() => {
                    let Some((kind, path)) = change else {
                        break;
                    };
                    debug!(%kind, path = %path.display(), "configuration file change");
                    let event = ChangeEvent::new(kind, &path);
                    self.record(event.clone());
                    self.dispatch_event(&event);
                    trigger = path;
                    self.pending.store(true, Ordering::SeqCst);
                    deadline = Some(Instant::now() + self.debounce);
                }
                () = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    deadline = None;
                    let path = std::mem::take(&mut trigger);
                    // a forced reload inside the window already picked the burst up
                    if !self.pending.load(Ordering::SeqCst) {
                        debug!(path = %path.display(), "burst already reloaded, skipping");
                        continue;
                    }
                    let watcher = Arc::clone(&self);
                    if let Err(e) = tokio::task::spawn_blocking(move || watcher.reload_now(path)).await {
                        error!("reload task failed: {e}");
                    }
                }
            }
        }
        self.pending.store(false, Ordering::SeqCst);
        debug!("change consumer exited");
    }

    /// Reloads immediately, bypassing the debounce window.
    pub fn force_reload(&self) -> ConfigResult<ChangeEvent> {
        self.reload_now(self.manager.config_dir().to_path_buf())
    }

    fn reload_now(&self, path: PathBuf) -> ConfigResult<ChangeEvent> {
        let _guard = self.reload_lock.lock();
        self.pending.store(false, Ordering::SeqCst);

        let old_config = self.manager.get_merged_config();
        match self.manager.reload() {
            Ok(new_config) => {
                let mut event = ChangeEvent::new(ChangeKind::Reloaded, path);
                event.old_config = Some(old_config);
                event.new_config = Some((*new_config).clone());
                self.record(event.clone());
                self.dispatch_event(&event);
                info!(path = %event.path.display(), "configuration reloaded");
                Ok(event)
            }
            Err(err) => {
                self.dispatch_error(&err);
                Err(err)
            }
        }
    }

    fn record(&self, event: ChangeEvent) {
        let mut events = self.events.lock();
        events.push_back(event);
        while events.len() > self.max_events {
            events.pop_front();
        }
    }

    fn dispatch_event(&self, event: &ChangeEvent) {
        let handlers: Vec<Arc<dyn ChangeHandler>> = self.handlers.read().clone();
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler.on_event(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(event = %event.id, error = %e, "change handler failed"),
                Err(_) => error!(event = %event.id, "change handler panicked")
            }
        }
    }

    fn dispatch_error(&self, err: &ConfigError) {
        let handlers: Vec<Arc<dyn ChangeHandler>> = self.handlers.read().clone();
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler.on_error(err))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "change handler failed on error"),
                Err(_) => error!("change handler panicked on error")
            }
        }
    }

    /// The last `limit` events, oldest first.
    pub fn recent_events(&self, limit: usize) -> Vec<ChangeEvent> {
        let events = self.events.lock();
        let skip = events.len().saturating_sub(limit);
        events.iter().skip(skip).cloned().collect()
    }

    pub fn event_history(&self, filter: &EventFilter) -> Vec<ChangeEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| filter.kind.is_none_or(|k| k == e.kind))
            .filter(|e| filter.path.as_ref().is_none_or(|p| e.path.ends_with(p)))
            .cloned()
            .collect()
    }

    pub fn status(&self) -> WatcherStatus {
        WatcherStatus {
            watching: self.is_watching(),
            watch_dirs: self.watch_dirs.clone(),
            handler_count: self.handlers.read().len(),
            recent_event_count: self.events.lock().len(),
            reload_pending: self.pending.load(Ordering::SeqCst)
        }
    }
}

fn classify(kind: &EventKind) -> Option<ChangeKind> {
    match kind {
        EventKind::Create(_) => Some(ChangeKind::Created),
        EventKind::Modify(_) => Some(ChangeKind::Modified),
        EventKind::Remove(_) => Some(ChangeKind::Deleted),
        _ => None
    }
}

fn is_relevant(path: &Path, ignore_dir: Option<&Path>) -> bool {
    if ignore_dir.is_some_and(|dir| path.starts_with(dir)) {
        return false;
    }
    let hidden = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'));
    !hidden && is_config_file(path)
}
