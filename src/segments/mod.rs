pub mod cache;
pub mod env;
pub mod net;
pub mod shell;
pub mod sys;
pub mod threaded;
pub mod time;
pub mod vcs;

pub use cache::*;
pub use threaded::*;

use crate::error::{PowerlineError, Result};
use crate::utils::PowerlineLogger;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Per-render context handed to segment functions.
#[derive(Debug, Clone, Default)]
pub struct SegmentInfo {
    pub cwd: Option<PathBuf>,
    pub environ: HashMap<String, String>,
    /// Extension-specific values such as `last_exit_code` or `jobnum`.
    pub extra: Map<String, Value>,
}

impl SegmentInfo {
    /// Snapshot of the current process environment and directory.
    pub fn from_env() -> Self {
        Self {
            cwd: std::env::current_dir().ok(),
            environ: std::env::vars().collect(),
            extra: Map::new(),
        }
    }

    pub fn getenv(&self, name: &str) -> Option<&str> {
        self.environ.get(name).map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.extra.get(name)
    }

    pub fn with_extra(mut self, name: &str, value: Value) -> Self {
        self.extra.insert(name.to_string(), value);
        self
    }
}

/// Everything a segment function sees besides its own arguments.
#[derive(Clone, Copy)]
pub struct SegmentContext<'a> {
    pub pl: &'a PowerlineLogger,
    pub info: &'a SegmentInfo,
    /// No background work may be started; compute everything inline.
    pub run_once: bool,
}

/// One piece of rendered output. Unset fields are inherited from the
/// segment's descriptor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Chunk {
    pub contents: String,
    pub highlight_groups: Vec<String>,
    pub divider_highlight_group: Option<String>,
    pub gradient_level: Option<f64>,
    pub draw_soft_divider: Option<bool>,
    pub draw_hard_divider: Option<bool>,
    pub draw_inner_divider: Option<bool>,
    /// Replaces the segment's priority for this chunk alone; `Some(None)`
    /// keeps the chunk whatever the segment says.
    pub priority: Option<Option<f64>>,
}

impl Chunk {
    pub fn new(contents: impl Into<String>) -> Self {
        Self {
            contents: contents.into(),
            ..Self::default()
        }
    }

    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.highlight_groups = groups.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_gradient(mut self, level: f64) -> Self {
        self.gradient_level = Some(level);
        self
    }

    pub fn with_inner_divider(mut self, draw: bool) -> Self {
        self.draw_inner_divider = Some(draw);
        self
    }

    pub fn with_priority(mut self, priority: Option<f64>) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// What a segment function produced for one render.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum SegmentOutput {
    /// Render nothing.
    #[default]
    None,
    Text(String),
    Chunks(Vec<Chunk>),
}

impl SegmentOutput {
    pub fn text(contents: impl Into<String>) -> Self {
        Self::Text(contents.into())
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// A named source of segment contents.
pub trait SegmentFunction: Send + Sync {
    fn call(&self, ctx: &SegmentContext<'_>, args: &Map<String, Value>) -> anyhow::Result<SegmentOutput>;

    /// Shorten `contents` by about `amount` columns. `None` means the
    /// function cannot truncate.
    fn truncate(
        &self,
        _ctx: &SegmentContext<'_>,
        _amount: usize,
        _contents: &str,
        _args: &Map<String, Value>,
    ) -> Option<String> {
        None
    }

    fn can_truncate(&self) -> bool {
        false
    }

    /// Stop any background work. The instance keeps serving cached values.
    fn shutdown(&self) {}
}

type PlainFn = dyn Fn(&SegmentContext<'_>, &Map<String, Value>) -> anyhow::Result<SegmentOutput> + Send + Sync;

/// Stateless segment backed by a closure.
pub struct FnSegment {
    func: Arc<PlainFn>,
}

impl FnSegment {
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(&SegmentContext<'_>, &Map<String, Value>) -> anyhow::Result<SegmentOutput> + Send + Sync + 'static,
    {
        Self { func: Arc::new(func) }
    }
}

impl SegmentFunction for FnSegment {
    fn call(&self, ctx: &SegmentContext<'_>, args: &Map<String, Value>) -> anyhow::Result<SegmentOutput> {
        (self.func)(ctx, args)
    }
}

pub type SegmentFactory = Arc<dyn Fn() -> Arc<dyn SegmentFunction> + Send + Sync>;

/// Segment functions by the name themes refer to them with. Each theme
/// build asks for fresh instances, so stateful segments never outlive the
/// renderer that created them.
#[derive(Clone, Default)]
pub struct SegmentRegistry {
    factories: HashMap<String, SegmentFactory>,
}

impl SegmentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        time::register(&mut registry);
        env::register(&mut registry);
        shell::register(&mut registry);
        sys::register(&mut registry);
        net::register(&mut registry);
        vcs::register(&mut registry);
        registry
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Arc<dyn SegmentFunction> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    pub fn register_fn<F>(&mut self, name: &str, func: F)
    where
        F: Fn(&SegmentContext<'_>, &Map<String, Value>) -> anyhow::Result<SegmentOutput> + Send + Sync + 'static,
    {
        let shared: Arc<dyn SegmentFunction> = Arc::new(FnSegment::new(func));
        self.register(name, move || shared.clone());
    }

    pub fn create(&self, name: &str) -> Result<Arc<dyn SegmentFunction>> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| PowerlineError::UnknownSegment(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Substitute `value` for the first `{}` in a user-supplied format.
pub(crate) fn fill(format: &str, value: &str) -> String {
    format.replacen("{}", value, 1)
}

/// Typed argument lookup helpers shared by the built-in segments.
pub(crate) fn arg_str<'a>(args: &'a Map<String, Value>, name: &str) -> Option<&'a str> {
    args.get(name).and_then(Value::as_str)
}

pub(crate) fn arg_bool(args: &Map<String, Value>, name: &str, default: bool) -> bool {
    args.get(name).and_then(Value::as_bool).unwrap_or(default)
}

pub(crate) fn arg_u64(args: &Map<String, Value>, name: &str) -> Option<u64> {
    args.get(name).and_then(Value::as_u64)
}

pub(crate) fn arg_f64(args: &Map<String, Value>, name: &str) -> Option<f64> {
    args.get(name).and_then(Value::as_f64)
}
