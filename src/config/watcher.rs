use crate::utils::PowerlineLogger;
use dashmap::DashMap;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

/// Something that can tell whether a file changed since it was last asked.
pub trait FileWatcher: Send + Sync {
    fn watch(&self, path: &Path) -> io::Result<()>;

    fn unwatch(&self, path: &Path);

    /// Whether `path` changed since the previous call. A path that was never
    /// watched counts as changed and is watched from now on.
    fn changed(&self, path: &Path) -> io::Result<bool>;

    fn kind(&self) -> WatcherKind;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherKind {
    Notify,
    Stat,
    Dummy,
    Deferred,
}

/// Modification time plus length. Length catches rewrites that land within
/// the filesystem's mtime granularity.
type Fingerprint = (Option<SystemTime>, u64);

fn fingerprint(path: &Path) -> io::Result<Fingerprint> {
    let metadata = fs::metadata(path)?;
    Ok((metadata.modified().ok(), metadata.len()))
}

/// Polls file metadata.
#[derive(Default)]
pub struct StatFileWatcher {
    watches: DashMap<PathBuf, Fingerprint>,
}

impl StatFileWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_watching(&self, path: &Path) -> bool {
        self.watches.contains_key(path)
    }
}

impl FileWatcher for StatFileWatcher {
    fn watch(&self, path: &Path) -> io::Result<()> {
        let current = fingerprint(path)?;
        self.watches.insert(path.to_path_buf(), current);
        Ok(())
    }

    fn unwatch(&self, path: &Path) {
        self.watches.remove(path);
    }

    fn changed(&self, path: &Path) -> io::Result<bool> {
        let current = fingerprint(path)?;
        match self.watches.insert(path.to_path_buf(), current) {
            Some(previous) => Ok(previous != current),
            None => Ok(true),
        }
    }

    fn kind(&self) -> WatcherKind {
        WatcherKind::Stat
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Marks files dirty from filesystem notifications.
///
/// The parent directory of each file is what gets registered with the
/// backend, so editors that save by renaming a new file into place are
/// still noticed.
pub struct NotifyFileWatcher {
    backend: Mutex<RecommendedWatcher>,
    /// Canonical file path to "touched since last asked".
    dirty: Arc<DashMap<PathBuf, bool>>,
    /// Path as watched to its canonical form.
    aliases: DashMap<PathBuf, PathBuf>,
    /// Registered directories and how many watched files each holds.
    dirs: Mutex<HashMap<PathBuf, usize>>,
}

impl NotifyFileWatcher {
    pub fn new() -> notify::Result<Self> {
        let dirty: Arc<DashMap<PathBuf, bool>> = Arc::new(DashMap::new());
        let marks = dirty.clone();
        let backend = notify::recommended_watcher(move |event: notify::Result<Event>| {
            let Ok(event) = event else {
                return;
            };
            if event.kind.is_access() {
                return;
            }
            for path in &event.paths {
                if let Some(mut touched) = marks.get_mut(path) {
                    *touched = true;
                }
            }
        })?;
        Ok(Self {
            backend: Mutex::new(backend),
            dirty,
            aliases: DashMap::new(),
            dirs: Mutex::new(HashMap::new()),
        })
    }

    pub fn is_watching(&self, path: &Path) -> bool {
        self.aliases.contains_key(path)
    }

    fn canonical(path: &Path) -> io::Result<(PathBuf, PathBuf)> {
        let name = path
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("{} names no file", path.display())))?;
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let dir = fs::canonicalize(parent)?;
        let file = dir.join(name);
        Ok((dir, file))
    }
}

impl FileWatcher for NotifyFileWatcher {
    fn watch(&self, path: &Path) -> io::Result<()> {
        fs::metadata(path)?;
        if let Some(file) = self.aliases.get(path) {
            self.dirty.insert(file.clone(), false);
            return Ok(());
        }
        let (dir, file) = Self::canonical(path)?;
        let mut dirs = lock(&self.dirs);
        let count = dirs.entry(dir.clone()).or_insert(0);
        if *count == 0 {
            lock(&self.backend)
                .watch(&dir, RecursiveMode::NonRecursive)
                .map_err(io::Error::other)?;
        }
        *count += 1;
        self.dirty.insert(file.clone(), false);
        self.aliases.insert(path.to_path_buf(), file);
        Ok(())
    }

    fn unwatch(&self, path: &Path) {
        let Some((_, file)) = self.aliases.remove(path) else {
            return;
        };
        self.dirty.remove(&file);
        let Some(dir) = file.parent() else {
            return;
        };
        let mut dirs = lock(&self.dirs);
        if let Some(count) = dirs.get_mut(dir) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                dirs.remove(dir);
                let _ = lock(&self.backend).unwatch(dir);
            }
        }
    }

    fn changed(&self, path: &Path) -> io::Result<bool> {
        fs::metadata(path)?;
        let file = match self.aliases.get(path) {
            Some(file) => file.clone(),
            None => {
                self.watch(path)?;
                return Ok(true);
            }
        };
        Ok(self
            .dirty
            .get_mut(&file)
            .map(|mut touched| std::mem::replace(&mut *touched, false))
            .unwrap_or(true))
    }

    fn kind(&self) -> WatcherKind {
        WatcherKind::Notify
    }
}

/// Never reports changes. Used in run-once mode.
pub struct DummyWatcher;

impl FileWatcher for DummyWatcher {
    fn watch(&self, _path: &Path) -> io::Result<()> {
        Ok(())
    }

    fn unwatch(&self, _path: &Path) {}

    fn changed(&self, _path: &Path) -> io::Result<bool> {
        Ok(false)
    }

    fn kind(&self) -> WatcherKind {
        WatcherKind::Dummy
    }
}

enum DeferredCall {
    Watch(PathBuf),
    Unwatch(PathBuf),
}

/// Records watch/unwatch calls until the real watcher kind is known (it is
/// configured by the main config, which itself has to be watched).
#[derive(Default)]
pub struct DeferredWatcher {
    calls: Mutex<Vec<DeferredCall>>,
}

impl DeferredWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replay every recorded call on `watcher`.
    pub fn transfer_calls(&self, watcher: &dyn FileWatcher) -> io::Result<()> {
        let calls = match self.calls.lock() {
            Ok(mut calls) => std::mem::take(&mut *calls),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for call in calls {
            match call {
                DeferredCall::Watch(path) => {
                    if let Err(e) = watcher.watch(&path) {
                        if e.kind() != io::ErrorKind::NotFound {
                            return Err(e);
                        }
                    }
                }
                DeferredCall::Unwatch(path) => watcher.unwatch(&path),
            }
        }
        Ok(())
    }

    fn record(&self, call: DeferredCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

impl FileWatcher for DeferredWatcher {
    fn watch(&self, path: &Path) -> io::Result<()> {
        self.record(DeferredCall::Watch(path.to_path_buf()));
        Ok(())
    }

    fn unwatch(&self, path: &Path) {
        self.record(DeferredCall::Unwatch(path.to_path_buf()));
    }

    fn changed(&self, _path: &Path) -> io::Result<bool> {
        Ok(false)
    }

    fn kind(&self) -> WatcherKind {
        WatcherKind::Deferred
    }
}

/// Build a watcher from the `common.watcher` setting.
pub fn create_file_watcher(pl: &PowerlineLogger, watcher_type: &str) -> Box<dyn FileWatcher> {
    match watcher_type {
        "none" => {
            pl.debug("watcher", "Using requested dummy watcher");
            Box::new(DummyWatcher)
        }
        "stat" => {
            pl.debug("watcher", "Using requested stat-based watcher");
            Box::new(StatFileWatcher::new())
        }
        "notify" | "inotify" => match NotifyFileWatcher::new() {
            Ok(watcher) => {
                pl.debug("watcher", "Using requested notify-based watcher");
                Box::new(watcher)
            }
            Err(e) => {
                pl.warn(
                    "watcher",
                    format!("Failed to create notify-based watcher ({}), using stat-based watcher", e),
                );
                Box::new(StatFileWatcher::new())
            }
        },
        "auto" => match NotifyFileWatcher::new() {
            Ok(watcher) => {
                pl.debug("watcher", "Using notify-based watcher");
                Box::new(watcher)
            }
            Err(e) => {
                pl.debug("watcher", format!("Notify unavailable ({}), using stat-based watcher", e));
                Box::new(StatFileWatcher::new())
            }
        },
        other => {
            pl.warn(
                "watcher",
                format!("Watcher type {} is not available, using stat-based watcher", other),
            );
            Box::new(StatFileWatcher::new())
        }
    }
}
