use crate::config::watcher::{create_file_watcher, DeferredWatcher, DummyWatcher, FileWatcher, WatcherKind};
use crate::error::{PowerlineError, Result};
use crate::utils::{BackgroundTask, PowerlineLogger};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::hash::{Hash, Hasher};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub type LoadFn = Arc<dyn Fn(&Path) -> Result<Value> + Send + Sync>;

/// Resolves a not-yet-existing config file. Returns the path once it exists.
pub type MissingProbe = Arc<dyn Fn(&Path) -> io::Result<Option<PathBuf>> + Send + Sync>;

static NEXT_CALLBACK_ID: AtomicU64 = AtomicU64::new(1);

/// Function run when a watched file changes. Compared by identity, so the
/// same callback registered for many paths can be unregistered in one go.
#[derive(Clone)]
pub struct ReloadCallback {
    id: u64,
    func: Arc<dyn Fn(&Path) + Send + Sync>,
}

impl ReloadCallback {
    pub fn new(func: impl Fn(&Path) + Send + Sync + 'static) -> Self {
        Self {
            id: NEXT_CALLBACK_ID.fetch_add(1, Ordering::Relaxed),
            func: Arc::new(func),
        }
    }

    pub fn call(&self, path: &Path) {
        (self.func)(path)
    }
}

impl PartialEq for ReloadCallback {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ReloadCallback {}

impl Hash for ReloadCallback {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for ReloadCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReloadCallback({})", self.id)
    }
}

/// Read and parse one JSON config file.
pub fn load_json_config(path: &Path) -> Result<Value> {
    let mut bytes = fs::read(path)?;
    let parsed: std::result::Result<Value, _> = simd_json::serde::from_slice(&mut bytes);
    match parsed {
        Ok(value) => Ok(value),
        Err(_) => {
            // simd-json mangles its input buffer; re-read for an accurate
            // serde_json error position.
            let content = fs::read_to_string(path)?;
            serde_json::from_str(&content).map_err(|e| PowerlineError::ConfigParse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })
        }
    }
}

enum WatcherSlot {
    Deferred(DeferredWatcher),
    Ready(Box<dyn FileWatcher>),
}

impl WatcherSlot {
    fn get(&self) -> &dyn FileWatcher {
        match self {
            Self::Deferred(watcher) => watcher,
            Self::Ready(watcher) => watcher.as_ref(),
        }
    }
}

struct LoaderState {
    watcher: WatcherSlot,
    watcher_type: String,
    watched: HashMap<PathBuf, HashSet<ReloadCallback>>,
    missing: HashMap<PathBuf, Vec<(MissingProbe, ReloadCallback)>>,
    loaded: HashMap<PathBuf, Value>,
    interval: Option<Duration>,
    pl: PowerlineLogger,
}

/// Loads config files, caches their parsed contents and tells registered
/// callbacks when files change or missing files appear.
pub struct ConfigLoader {
    state: Mutex<LoaderState>,
    load_fn: LoadFn,
    run_once: bool,
    /// Polling thread and the interval it was started with.
    task: Mutex<Option<(BackgroundTask, Duration)>>,
}

impl ConfigLoader {
    pub fn new(run_once: bool) -> Self {
        Self::with_load_fn(Arc::new(load_json_config), run_once)
    }

    pub fn with_load_fn(load_fn: LoadFn, run_once: bool) -> Self {
        let (watcher, watcher_type) = if run_once {
            (WatcherSlot::Ready(Box::new(DummyWatcher)), "none")
        } else {
            (WatcherSlot::Deferred(DeferredWatcher::new()), "deferred")
        };
        Self {
            state: Mutex::new(LoaderState {
                watcher,
                watcher_type: watcher_type.to_string(),
                watched: HashMap::new(),
                missing: HashMap::new(),
                loaded: HashMap::new(),
                interval: None,
                pl: PowerlineLogger::new("powerline"),
            }),
            load_fn,
            run_once,
            task: Mutex::new(None),
        }
    }

    /// Use an explicit watcher instead of one chosen by `common.watcher`.
    pub fn with_watcher(load_fn: LoadFn, watcher: Box<dyn FileWatcher>, watcher_type: &str) -> Self {
        let loader = Self::with_load_fn(load_fn, false);
        {
            let mut state = loader.lock();
            state.watcher = WatcherSlot::Ready(watcher);
            state.watcher_type = watcher_type.to_string();
        }
        loader
    }

    fn lock(&self) -> MutexGuard<'_, LoaderState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_pl(&self, pl: PowerlineLogger) {
        self.lock().pl = pl;
    }

    pub fn set_interval(&self, interval: Option<Duration>) {
        self.lock().interval = interval;
    }

    pub fn watcher_kind(&self) -> WatcherKind {
        self.lock().watcher.get().kind()
    }

    /// Switch to the watcher named by `common.watcher`, replaying anything
    /// registered while the choice was still pending.
    pub fn set_watcher(&self, watcher_type: &str) {
        if self.run_once {
            return;
        }
        let mut state = self.lock();
        if state.watcher_type == watcher_type {
            return;
        }
        let watcher = create_file_watcher(&state.pl, watcher_type);
        if let WatcherSlot::Deferred(deferred) = &state.watcher {
            if let Err(e) = deferred.transfer_calls(watcher.as_ref()) {
                state
                    .pl
                    .error("config_loader", format!("Error while transferring watches: {}", e));
            }
        } else {
            for path in state.watched.keys() {
                if let Err(e) = watcher.watch(path) {
                    state.pl.debug(
                        "config_loader",
                        format!("Failed to watch {}: {}", path.display(), e),
                    );
                }
            }
        }
        state.watcher = WatcherSlot::Ready(watcher);
        state.watcher_type = watcher_type.to_string();
    }

    /// Run `callback` whenever the file at `path` changes.
    pub fn register(&self, callback: ReloadCallback, path: &Path) {
        let mut state = self.lock();
        if let Err(e) = state.watcher.get().watch(path) {
            state.pl.debug(
                "config_loader",
                format!("Failed to watch {}: {}", path.display(), e),
            );
        }
        state
            .watched
            .entry(path.to_path_buf())
            .or_default()
            .insert(callback);
    }

    /// Probe `key` on every update; the first time the probe yields a path,
    /// `callback` runs once with it and the probe is dropped.
    pub fn register_missing(&self, probe: MissingProbe, callback: ReloadCallback, key: &Path) {
        let mut state = self.lock();
        let entries = state.missing.entry(key.to_path_buf()).or_default();
        if !entries.iter().any(|(_, existing)| existing == &callback) {
            entries.push((probe, callback));
        }
    }

    /// Forget every watched path handled only by `removed`.
    pub fn unregister_functions(&self, removed: &[ReloadCallback]) {
        let mut state = self.lock();
        let mut emptied = Vec::new();
        for (path, callbacks) in state.watched.iter_mut() {
            callbacks.retain(|callback| !removed.contains(callback));
            if callbacks.is_empty() {
                emptied.push(path.clone());
            }
        }
        for path in emptied {
            state.watched.remove(&path);
            state.loaded.remove(&path);
            state.watcher.get().unwatch(&path);
        }
    }

    pub fn unregister_missing(&self, removed: &[ReloadCallback]) {
        let mut state = self.lock();
        state.missing.retain(|_, entries| {
            entries.retain(|(_, callback)| !removed.contains(callback));
            !entries.is_empty()
        });
    }

    /// Parsed contents of `path`, served from the cache when possible.
    pub fn load(&self, path: &Path) -> Result<Value> {
        if let Some(value) = self.lock().loaded.get(path) {
            return Ok(value.clone());
        }
        let value = (self.load_fn)(path)?;
        self.lock().loaded.insert(path.to_path_buf(), value.clone());
        Ok(value)
    }

    pub fn watched_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<_> = self.lock().watched.keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn missing_keys(&self) -> Vec<PathBuf> {
        let mut keys: Vec<_> = self.lock().missing.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// One polling tick: reload changed files, promote missing files that
    /// appeared, then run the affected callbacks.
    ///
    /// Cached values are refreshed before callbacks run, so a rebuild
    /// triggered by a callback never reads the stale copy.
    pub fn update(&self) {
        let (changed, probes, pl) = {
            let state = self.lock();
            let watcher = state.watcher.get();
            let mut changed: Vec<(PathBuf, Vec<ReloadCallback>)> = Vec::new();
            for (path, callbacks) in &state.watched {
                let modified = match watcher.changed(path) {
                    Ok(modified) => modified,
                    Err(e) => {
                        state.pl.error(
                            "config_loader",
                            format!("Error while running watcher for path {}: {}", path.display(), e),
                        );
                        true
                    }
                };
                if modified {
                    changed.push((path.clone(), callbacks.iter().cloned().collect()));
                }
            }
            let probes: Vec<(PathBuf, MissingProbe, ReloadCallback)> = state
                .missing
                .iter()
                .flat_map(|(key, entries)| {
                    entries
                        .iter()
                        .map(move |(probe, callback)| (key.clone(), probe.clone(), callback.clone()))
                })
                .collect();
            (changed, probes, state.pl.clone())
        };

        let mut promoted: Vec<(PathBuf, PathBuf, ReloadCallback)> = Vec::new();
        for (key, probe, callback) in probes {
            match probe(&key) {
                Ok(Some(path)) => promoted.push((key, path, callback)),
                Ok(None) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => pl.error(
                    "config_loader",
                    format!("Error while running condition function for key {}: {}", key.display(), e),
                ),
            }
        }

        if !promoted.is_empty() {
            let mut state = self.lock();
            for (key, _, callback) in &promoted {
                if let Some(entries) = state.missing.get_mut(key) {
                    entries.retain(|(_, existing)| existing != callback);
                    if entries.is_empty() {
                        state.missing.remove(key);
                    }
                }
            }
        }

        let mut to_reload: Vec<&Path> = changed.iter().map(|(path, _)| path.as_path()).collect();
        to_reload.extend(promoted.iter().map(|(_, path, _)| path.as_path()));
        for path in to_reload {
            self.lock().loaded.remove(path);
            match (self.load_fn)(path) {
                Ok(value) => {
                    self.lock().loaded.insert(path.to_path_buf(), value);
                }
                Err(e) => pl.error(
                    "config_loader",
                    format!("Error while loading {}: {}", path.display(), e),
                ),
            }
        }

        for (path, callbacks) in &changed {
            for callback in callbacks {
                callback.call(path);
            }
        }
        for (_, path, callback) in &promoted {
            callback.call(path);
        }
    }

    pub fn is_alive(&self) -> bool {
        self.task
            .lock()
            .map(|task| task.as_ref().is_some_and(|(task, _)| task.is_alive()))
            .unwrap_or(false)
    }

    /// Start polling in a background thread every `interval`. No-op without
    /// an interval or when already polling at that interval; a thread
    /// running at a different interval is replaced.
    pub fn start(self: &Arc<Self>) -> io::Result<()> {
        let Some(interval) = self.lock().interval else {
            return Ok(());
        };
        let mut task = self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match task.take() {
            Some((running, current)) if running.is_alive() && current == interval => {
                *task = Some((running, current));
                return Ok(());
            }
            Some((mut stale, _)) => stale.shutdown(),
            None => {}
        }
        let loader = Arc::downgrade(self);
        let spawned = BackgroundTask::spawn(
            "config-loader".to_string(),
            move |shutdown| loop {
                let Some(loader) = loader.upgrade() else {
                    break;
                };
                loader.update();
                drop(loader);
                if shutdown.wait(interval) {
                    break;
                }
            },
        )?;
        *task = Some((spawned, interval));
        Ok(())
    }

    pub fn shutdown(&self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some((mut task, _)) = task.take() {
                task.shutdown();
            }
        }
    }
}

impl Drop for ConfigLoader {
    fn drop(&mut self) {
        self.shutdown();
    }
}
