use dashmap::DashMap;
use std::env;
use std::fs;
use std::sync::{Arc, OnceLock};
use std::thread;

/// Process-wide facts that are expensive or pointless to look up on every
/// render. Each value is computed once on first use and reused until
/// [`ProcessContext::reset`].
#[derive(Default)]
pub struct ProcessContext {
    values: DashMap<&'static str, Option<Arc<str>>>,
}

static CONTEXT: OnceLock<ProcessContext> = OnceLock::new();

impl ProcessContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global() -> &'static ProcessContext {
        CONTEXT.get_or_init(ProcessContext::new)
    }

    /// Look up `key`, computing it with `init` if it was never computed.
    /// `None` results are memoized as well.
    pub fn get_or_init(
        &self,
        key: &'static str,
        init: impl FnOnce() -> Option<String>,
    ) -> Option<Arc<str>> {
        self.values
            .entry(key)
            .or_insert_with(|| init().map(Arc::from))
            .clone()
    }

    pub fn username(&self) -> Option<Arc<str>> {
        self.get_or_init("username", || {
            env::var("USER")
                .or_else(|_| env::var("LOGNAME"))
                .or_else(|_| env::var("USERNAME"))
                .ok()
                .filter(|name| !name.is_empty())
        })
    }

    pub fn hostname(&self) -> Option<Arc<str>> {
        self.get_or_init("hostname", || {
            fs::read_to_string("/proc/sys/kernel/hostname")
                .or_else(|_| fs::read_to_string("/etc/hostname"))
                .ok()
                .map(|name| name.trim().to_string())
                .or_else(|| env::var("HOSTNAME").ok())
                .filter(|name| !name.is_empty())
        })
    }

    pub fn cpu_count(&self) -> usize {
        self.get_or_init("cpu_count", || {
            thread::available_parallelism()
                .ok()
                .map(|count| count.get().to_string())
        })
        .and_then(|count| count.parse().ok())
        .unwrap_or(1)
    }

    /// Effective user id, from `/proc/self/status`.
    pub fn euid(&self) -> Option<u32> {
        self.get_or_init("euid", || {
            let status = fs::read_to_string("/proc/self/status").ok()?;
            status
                .lines()
                .find_map(|line| line.strip_prefix("Uid:"))
                .and_then(|ids| ids.split_whitespace().nth(1))
                .map(str::to_string)
        })
        .and_then(|euid| euid.parse().ok())
    }

    /// Forget every memoized value.
    pub fn reset(&self) {
        self.values.clear();
    }
}
