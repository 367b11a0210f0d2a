//! Segments whose data is refreshed by a background thread.
//!
//! A [`KeyedSegment`] groups every invocation of one segment function that
//! differs only by arguments. Each distinct argument set maps to a key; the
//! background loop recomputes every key a render asked for recently, and
//! renders only ever read the cache. [`ThreadedSegment`] is the same engine
//! with a single implicit key.

use crate::segments::cache::{CachedResult, KeyedCache, DROP_INTERVAL};
use crate::segments::{SegmentContext, SegmentFunction, SegmentOutput};
use crate::utils::{BackgroundTask, PowerlineLogger};
use serde_json::{Map, Value};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Lower bound on the sleep between two passes, however long a pass took.
pub const MIN_SLEEP: Duration = Duration::from_millis(100);

/// Arguments that configure the updater instead of selecting data.
const SCHEDULING_ARGS: [&str; 2] = ["interval", "update_first"];

/// Canonical form of an argument map: every argument except the scheduling
/// ones, values serialized to JSON. Equal argument sets give equal keys
/// regardless of insertion order.
pub type ArgsKey = BTreeMap<String, String>;

pub fn args_key(args: &Map<String, Value>) -> ArgsKey {
    args.iter()
        .filter(|(name, _)| !SCHEDULING_ARGS.contains(&name.as_str()))
        .map(|(name, value)| (name.clone(), value.to_string()))
        .collect()
}

/// Data source refreshed per distinct key.
pub trait KeyedUpdate: Send + Sync + 'static {
    type Key: Clone + Eq + Hash + Debug + Send + Sync + 'static;
    type Value: Clone + Send + Sync + 'static;

    /// Logging prefix.
    fn name(&self) -> &'static str;

    fn key(&self, ctx: &SegmentContext<'_>, args: &Map<String, Value>) -> anyhow::Result<Self::Key>;

    /// Compute the current value for `key`. `previous` is the last value that
    /// computed successfully, for sources that report rates.
    fn compute(
        &self,
        pl: &PowerlineLogger,
        key: &Self::Key,
        previous: Option<&Self::Value>,
    ) -> anyhow::Result<Self::Value>;

    fn render_one(
        &self,
        value: &Self::Value,
        ctx: &SegmentContext<'_>,
        args: &Map<String, Value>,
    ) -> anyhow::Result<SegmentOutput>;

    fn default_interval(&self) -> Duration {
        DEFAULT_INTERVAL
    }

    fn truncate(&self, _amount: usize, _contents: &str, _args: &Map<String, Value>) -> Option<String> {
        None
    }

    fn can_truncate(&self) -> bool {
        false
    }
}

/// Data source with no per-argument variance.
pub trait ThreadedUpdate: Send + Sync + 'static {
    type Value: Clone + Send + Sync + 'static;

    fn name(&self) -> &'static str;

    fn update(&self, pl: &PowerlineLogger, previous: Option<&Self::Value>) -> anyhow::Result<Self::Value>;

    fn render(
        &self,
        value: &Self::Value,
        ctx: &SegmentContext<'_>,
        args: &Map<String, Value>,
    ) -> anyhow::Result<SegmentOutput>;

    fn default_interval(&self) -> Duration {
        DEFAULT_INTERVAL
    }
}

/// Adapts a [`ThreadedUpdate`] to the keyed engine under the unit key.
pub struct Single<U>(pub U);

impl<U: ThreadedUpdate> KeyedUpdate for Single<U> {
    type Key = ();
    type Value = U::Value;

    fn name(&self) -> &'static str {
        self.0.name()
    }

    fn key(&self, _ctx: &SegmentContext<'_>, _args: &Map<String, Value>) -> anyhow::Result<()> {
        Ok(())
    }

    fn compute(&self, pl: &PowerlineLogger, _key: &(), previous: Option<&U::Value>) -> anyhow::Result<U::Value> {
        self.0.update(pl, previous)
    }

    fn render_one(
        &self,
        value: &U::Value,
        ctx: &SegmentContext<'_>,
        args: &Map<String, Value>,
    ) -> anyhow::Result<SegmentOutput> {
        self.0.render(value, ctx, args)
    }

    fn default_interval(&self) -> Duration {
        self.0.default_interval()
    }
}

pub type ThreadedSegment<U> = KeyedSegment<Single<U>>;

impl<U: ThreadedUpdate> KeyedSegment<Single<U>> {
    pub fn threaded(updater: U) -> Self {
        Self::new(Single(updater))
    }
}

struct Schedule {
    interval: Duration,
    update_first: bool,
    drop_interval: Duration,
    pl: Option<PowerlineLogger>,
    /// When the previous background pass finished.
    last_pass: Option<Instant>,
}

struct Shared<U: KeyedUpdate> {
    updater: U,
    cache: KeyedCache<U::Key, U::Value>,
    schedule: Mutex<Schedule>,
}

enum TaskState {
    Idle,
    Running(BackgroundTask),
    Stopped,
}

/// Background-refreshed segment keyed by [`KeyedUpdate::key`].
///
/// The first render outside run-once mode starts the background loop. After
/// [`SegmentFunction::shutdown`] the loop is never restarted and renders
/// keep returning whatever was cached.
pub struct KeyedSegment<U: KeyedUpdate> {
    shared: Arc<Shared<U>>,
    task: Mutex<TaskState>,
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic".to_string()
    }
}

impl<U: KeyedUpdate> Shared<U> {
    fn schedule(&self) -> MutexGuard<'_, Schedule> {
        self.schedule.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn logger(&self) -> PowerlineLogger {
        self.schedule()
            .pl
            .clone()
            .unwrap_or_else(|| PowerlineLogger::new("powerline"))
    }

    /// Compute one key and store the outcome. Errors and panics mark the key
    /// crashed and keep its last good value.
    fn refresh_key(&self, pl: &PowerlineLogger, key: &U::Key) {
        let previous = self.cache.get(key);
        let previous_value = previous.as_ref().and_then(|entry| entry.value.as_ref());
        let outcome = catch_unwind(AssertUnwindSafe(|| self.updater.compute(pl, key, previous_value)));
        let failure = match outcome {
            Ok(Ok(value)) => {
                self.cache.replace(key.clone(), CachedResult::ok(value));
                return;
            }
            Ok(Err(e)) => format!("{:#}", e),
            Err(payload) => panic_message(payload.as_ref()),
        };
        pl.error(
            self.updater.name(),
            format!("Exception while computing state for {:?}: {}", key, failure),
        );
        self.cache
            .replace(key.clone(), CachedResult::crashed(previous_value.cloned()));
    }

    /// One background pass over every live key.
    ///
    /// Results computed inline by a render since the previous pass are kept
    /// while they are younger than the interval.
    fn refresh_pass(&self) {
        let (pl, interval, drop_interval, last_pass) = {
            let schedule = self.schedule();
            (
                schedule.pl.clone().unwrap_or_else(|| PowerlineLogger::new("powerline")),
                schedule.interval,
                schedule.drop_interval,
                schedule.last_pass,
            )
        };
        for key in self.cache.live_keys(drop_interval) {
            if let Some(entry) = self.cache.get(&key) {
                let computed_inline = last_pass.map_or(true, |end| entry.computed_at > end);
                if computed_inline && !entry.crashed && entry.age() < interval {
                    continue;
                }
            }
            self.refresh_key(&pl, &key);
        }
        self.schedule().last_pass = Some(Instant::now());
    }

    fn run(&self, shutdown: &crate::utils::Event) {
        loop {
            let started = Instant::now();
            self.refresh_pass();
            let interval = self.schedule().interval;
            let sleep = interval.saturating_sub(started.elapsed()).max(MIN_SLEEP);
            if shutdown.wait(sleep) {
                break;
            }
        }
    }
}

impl<U: KeyedUpdate> KeyedSegment<U> {
    pub fn new(updater: U) -> Self {
        let interval = updater.default_interval();
        Self {
            shared: Arc::new(Shared {
                updater,
                cache: KeyedCache::new(),
                schedule: Mutex::new(Schedule {
                    interval,
                    update_first: true,
                    drop_interval: DROP_INTERVAL,
                    pl: None,
                    last_pass: None,
                }),
            }),
            task: Mutex::new(TaskState::Idle),
        }
    }

    pub fn updater(&self) -> &U {
        &self.shared.updater
    }

    pub fn cached(&self, key: &U::Key) -> Option<Arc<CachedResult<U::Value>>> {
        self.shared.cache.get(key)
    }

    pub fn is_running(&self) -> bool {
        matches!(&*self.lock_task(), TaskState::Running(task) if task.is_alive())
    }

    pub fn is_stopped(&self) -> bool {
        matches!(&*self.lock_task(), TaskState::Stopped)
    }

    /// Run a background pass on the calling thread.
    pub fn refresh_now(&self) {
        self.shared.refresh_pass();
    }

    fn lock_task(&self) -> MutexGuard<'_, TaskState> {
        self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn configure(&self, pl: &PowerlineLogger, args: &Map<String, Value>) -> bool {
        let mut schedule = self.shared.schedule();
        if let Some(seconds) = args.get("interval").and_then(Value::as_f64) {
            if seconds > 0.0 {
                match Duration::try_from_secs_f64(seconds) {
                    Ok(interval) => schedule.interval = interval,
                    Err(e) => pl.warn(
                        self.shared.updater.name(),
                        format!("Ignoring interval {}: {}", seconds, e),
                    ),
                }
            }
        }
        if let Some(update_first) = args.get("update_first").and_then(Value::as_bool) {
            schedule.update_first = update_first;
        }
        schedule.pl = Some(pl.clone());
        schedule.update_first
    }

    fn ensure_started(&self) {
        let mut task = self.lock_task();
        if !matches!(*task, TaskState::Idle) {
            return;
        }
        let shared = self.shared.clone();
        let name = format!("segment-{}", shared.updater.name());
        match BackgroundTask::spawn(name, move |shutdown| shared.run(shutdown)) {
            Ok(spawned) => *task = TaskState::Running(spawned),
            Err(e) => self.shared.logger().error(
                self.shared.updater.name(),
                format!("Failed to start background updates: {}", e),
            ),
        }
    }
}

impl<U: KeyedUpdate> SegmentFunction for KeyedSegment<U> {
    fn call(&self, ctx: &SegmentContext<'_>, args: &Map<String, Value>) -> anyhow::Result<SegmentOutput> {
        let update_first = self.configure(ctx.pl, args);
        let key = self.shared.updater.key(ctx, args)?;
        self.shared.cache.observe(key.clone());

        let mut entry = self.shared.cache.get(&key);
        if entry.is_none() && (ctx.run_once || update_first) {
            self.shared.refresh_key(ctx.pl, &key);
            entry = self.shared.cache.get(&key);
        }
        if !ctx.run_once {
            self.ensure_started();
        }

        match entry.as_ref().and_then(|entry| entry.value.as_ref()) {
            Some(value) => self.shared.updater.render_one(value, ctx, args),
            None => Ok(SegmentOutput::None),
        }
    }

    fn truncate(
        &self,
        _ctx: &SegmentContext<'_>,
        amount: usize,
        contents: &str,
        args: &Map<String, Value>,
    ) -> Option<String> {
        self.shared.updater.truncate(amount, contents, args)
    }

    fn can_truncate(&self) -> bool {
        self.shared.updater.can_truncate()
    }

    fn shutdown(&self) {
        let previous = std::mem::replace(&mut *self.lock_task(), TaskState::Stopped);
        if let TaskState::Running(mut task) = previous {
            task.shutdown();
        }
    }
}

impl<U: KeyedUpdate> Drop for KeyedSegment<U> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segments::SegmentInfo;
    use crate::utils::RecordingSink;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Returns `"<key>:<n>"` where n counts computations of that key.
    #[derive(Default)]
    struct Counter {
        computed: Mutex<HashMap<String, usize>>,
        total: AtomicUsize,
    }

    impl KeyedUpdate for Counter {
        type Key = String;
        type Value = String;

        fn name(&self) -> &'static str {
            "counter"
        }

        fn key(&self, _ctx: &SegmentContext<'_>, args: &Map<String, Value>) -> anyhow::Result<String> {
            Ok(args.get("name").and_then(Value::as_str).unwrap_or("default").to_string())
        }

        fn compute(&self, _pl: &PowerlineLogger, key: &String, _previous: Option<&String>) -> anyhow::Result<String> {
            self.total.fetch_add(1, Ordering::SeqCst);
            if key == "bad" {
                anyhow::bail!("cannot compute {}", key);
            }
            if key == "panics" {
                panic!("boom");
            }
            let mut computed = self.computed.lock().unwrap();
            let n = computed.entry(key.clone()).or_default();
            *n += 1;
            Ok(format!("{}:{}", key, n))
        }

        fn render_one(
            &self,
            value: &String,
            _ctx: &SegmentContext<'_>,
            _args: &Map<String, Value>,
        ) -> anyhow::Result<SegmentOutput> {
            Ok(SegmentOutput::text(value.clone()))
        }
    }

    fn call(segment: &KeyedSegment<Counter>, pl: &PowerlineLogger, run_once: bool, args: Value) -> SegmentOutput {
        let info = SegmentInfo::default();
        let ctx = SegmentContext { pl, info: &info, run_once };
        segment.call(&ctx, args.as_object().unwrap()).unwrap()
    }

    #[test]
    fn test_args_key_ignores_order_and_scheduling() {
        let a = json!({"interface": "eth0", "suffix": "B/s", "interval": 2});
        let b = json!({"suffix": "B/s", "interface": "eth0", "update_first": false});
        let c = json!({"suffix": "B/s", "interface": "wlan0"});
        let key_a = args_key(a.as_object().unwrap());
        assert_eq!(key_a, args_key(b.as_object().unwrap()));
        assert_ne!(key_a, args_key(c.as_object().unwrap()));
    }

    #[test]
    fn test_run_once_computes_inline_without_thread() {
        let segment = KeyedSegment::new(Counter::default());
        let pl = PowerlineLogger::new("test");
        assert_eq!(call(&segment, &pl, true, json!({"name": "a"})), SegmentOutput::text("a:1"));
        assert_eq!(call(&segment, &pl, true, json!({"name": "a"})), SegmentOutput::text("a:1"));
        assert!(!segment.is_running());
    }

    #[test]
    fn test_without_update_first_nothing_until_first_pass() {
        let segment = KeyedSegment::new(Counter::default());
        segment.shutdown();
        let pl = PowerlineLogger::new("test");
        let args = json!({"name": "lazy", "update_first": false});
        assert!(call(&segment, &pl, false, args.clone()).is_none());
        segment.refresh_now();
        assert_eq!(call(&segment, &pl, false, args), SegmentOutput::text("lazy:1"));
    }

    #[test]
    fn test_fresh_inline_result_is_not_recomputed() {
        let segment = KeyedSegment::new(Counter::default());
        segment.shutdown();
        let pl = PowerlineLogger::new("test");
        let args = json!({"name": "a", "interval": 60});
        assert_eq!(call(&segment, &pl, false, args.clone()), SegmentOutput::text("a:1"));
        segment.refresh_now();
        assert_eq!(call(&segment, &pl, false, args.clone()), SegmentOutput::text("a:1"));
        assert_eq!(segment.updater().total.load(Ordering::SeqCst), 1);

        // Once a pass has run, later passes always recompute.
        segment.refresh_now();
        assert_eq!(call(&segment, &pl, false, args), SegmentOutput::text("a:2"));
    }

    #[test]
    fn test_crashing_key_is_isolated() {
        let segment = KeyedSegment::new(Counter::default());
        segment.shutdown();
        let sink = Arc::new(RecordingSink::new());
        let pl = PowerlineLogger::with_sink("test", sink.clone());
        let good = json!({"name": "good", "interval": 0.001});
        let bad = json!({"name": "bad", "interval": 0.001});
        let panics = json!({"name": "panics", "interval": 0.001});

        assert_eq!(call(&segment, &pl, false, good.clone()), SegmentOutput::text("good:1"));
        assert!(call(&segment, &pl, false, bad.clone()).is_none());
        assert!(call(&segment, &pl, false, panics.clone()).is_none());
        sink.pop();

        std::thread::sleep(Duration::from_millis(5));
        segment.refresh_now();
        assert_eq!(call(&segment, &pl, false, good), SegmentOutput::text("good:2"));
        assert!(call(&segment, &pl, false, bad).is_none());
        assert!(call(&segment, &pl, false, panics).is_none());
        assert!(segment.cached(&"bad".to_string()).unwrap().crashed);

        let lines = sink.lines();
        assert_eq!(lines.len(), 2);
        assert!(lines.iter().all(|line| line.starts_with("test:counter:Exception while computing state")));
        assert!(lines.iter().any(|line| line.ends_with("boom")));
    }

    #[test]
    fn test_background_loop_refreshes_and_stops_for_good() {
        let segment = KeyedSegment::new(Counter::default());
        let pl = PowerlineLogger::new("test");
        let args = json!({"name": "bg", "interval": 0.001});
        call(&segment, &pl, false, args.clone());
        assert!(segment.is_running());

        let deadline = Instant::now() + Duration::from_secs(5);
        while segment.updater().total.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(segment.updater().total.load(Ordering::SeqCst) >= 3);

        segment.shutdown();
        assert!(segment.is_stopped());
        std::thread::sleep(Duration::from_millis(300));
        let settled = segment.updater().total.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(segment.updater().total.load(Ordering::SeqCst), settled);

        // Still serves the cache and never restarts.
        assert!(!call(&segment, &pl, false, args).is_none());
        assert!(segment.is_stopped());
    }

    #[test]
    fn test_out_of_range_interval_keeps_default() {
        let segment = KeyedSegment::new(Counter::default());
        segment.shutdown();
        let sink = Arc::new(RecordingSink::new());
        let pl = PowerlineLogger::with_sink("test", sink.clone());
        let args = json!({"name": "huge", "interval": 1e20});
        assert_eq!(call(&segment, &pl, false, args), SegmentOutput::text("huge:1"));
        assert_eq!(segment.shared.schedule().interval, DEFAULT_INTERVAL);
        let lines = sink.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("test:counter:Ignoring interval"));
    }

    struct Ticks(AtomicUsize);

    impl ThreadedUpdate for Ticks {
        type Value = usize;

        fn name(&self) -> &'static str {
            "ticks"
        }

        fn update(&self, _pl: &PowerlineLogger, previous: Option<&usize>) -> anyhow::Result<usize> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(previous.copied().unwrap_or(0) + 1)
        }

        fn render(&self, value: &usize, _ctx: &SegmentContext<'_>, _args: &Map<String, Value>) -> anyhow::Result<SegmentOutput> {
            Ok(SegmentOutput::text(value.to_string()))
        }
    }

    #[test]
    fn test_threaded_segment_shares_one_key() {
        let segment = ThreadedSegment::threaded(Ticks(AtomicUsize::new(0)));
        let pl = PowerlineLogger::new("test");
        let info = SegmentInfo::default();
        let ctx = SegmentContext { pl: &pl, info: &info, run_once: true };
        let first = json!({"format": "a"});
        let second = json!({"format": "b"});
        assert_eq!(segment.call(&ctx, first.as_object().unwrap()).unwrap(), SegmentOutput::text("1"));
        assert_eq!(segment.call(&ctx, second.as_object().unwrap()).unwrap(), SegmentOutput::text("1"));
        assert_eq!(segment.updater().0 .0.load(Ordering::SeqCst), 1);
    }
}
