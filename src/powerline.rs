use crate::colorscheme::Colorscheme;
use crate::config::{
    from_value, merge_values, ColorsConfig, ColorschemeConfig, ConfigFinder, ConfigLoader, MainConfig,
    ReloadCallback, ThemeConfig,
};
use crate::error::{PowerlineError, Result};
use crate::renderer::{RenderOutput, RenderRequest, Renderer, RendererKind, Style};
use crate::segments::SegmentRegistry;
use crate::theme::Theme;
use crate::utils::{LogLevel, LogSink, PowerlineLogger, TracingSink};
use arc_swap::ArcSwapOption;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// How to build a [`Powerline`].
pub struct PowerlineOptions {
    pub ext: String,
    pub renderer: RendererKind,
    /// One-shot rendering: no background threads, no file watching.
    pub run_once: bool,
    /// Replaces the search path when set.
    pub config_paths: Option<Vec<PathBuf>>,
    pub config_overrides: Option<Value>,
    pub theme_overrides: Option<Value>,
    pub registry: SegmentRegistry,
    pub log_sink: Arc<dyn LogSink>,
}

impl PowerlineOptions {
    pub fn new(ext: &str, renderer: RendererKind) -> Self {
        Self {
            ext: ext.to_string(),
            renderer,
            run_once: false,
            config_paths: None,
            config_overrides: None,
            theme_overrides: None,
            registry: SegmentRegistry::with_builtins(),
            log_sink: Arc::new(TracingSink),
        }
    }
}

/// Artifacts that need reloading before the next render. Setting a flag
/// twice is the same as setting it once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ReloadFlags {
    main: bool,
    colors: bool,
    colorscheme: bool,
    theme: bool,
}

impl ReloadFlags {
    fn all() -> Self {
        Self {
            main: true,
            colors: true,
            colorscheme: true,
            theme: true,
        }
    }

    fn any(&self) -> bool {
        self.main || self.colors || self.colorscheme || self.theme
    }

    fn merge(&mut self, other: ReloadFlags) {
        self.main |= other.main;
        self.colors |= other.colors;
        self.colorscheme |= other.colorscheme;
        self.theme |= other.theme;
    }
}

/// One reload callback per artifact.
struct Callbacks {
    main: ReloadCallback,
    colors: ReloadCallback,
    colorscheme: ReloadCallback,
    theme: ReloadCallback,
}

impl Callbacks {
    fn new(flags: &Arc<Mutex<ReloadFlags>>) -> Self {
        let flag = |set: fn(&mut ReloadFlags)| {
            let flags = flags.clone();
            ReloadCallback::new(move |_path| set(&mut lock(&flags)))
        };
        Self {
            main: flag(|f| f.main = true),
            colors: flag(|f| f.colors = true),
            colorscheme: flag(|f| f.colorscheme = true),
            theme: flag(|f| f.theme = true),
        }
    }

    fn all(&self) -> [ReloadCallback; 4] {
        [
            self.main.clone(),
            self.colors.clone(),
            self.colorscheme.clone(),
            self.theme.clone(),
        ]
    }
}

/// Last successfully loaded configuration, replaced as a whole when a
/// rebuild succeeds.
#[derive(Clone, Default)]
struct Loaded {
    main: Option<MainConfig>,
    colors: Option<ColorsConfig>,
    colorscheme: Option<Arc<Colorscheme>>,
    theme: Option<ThemeConfig>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Owns configuration loading and the live renderer. Renders always see one
/// complete renderer; reloads build a new one beside it and swap the
/// reference once everything loaded.
pub struct Powerline {
    ext: String,
    kind: RendererKind,
    run_once: bool,
    pl: PowerlineLogger,
    finder: ConfigFinder,
    loader: Arc<ConfigLoader>,
    registry: SegmentRegistry,
    config_overrides: Option<Value>,
    theme_overrides: Option<Value>,
    flags: Arc<Mutex<ReloadFlags>>,
    callbacks: Callbacks,
    loaded: Mutex<Loaded>,
    renderer: ArcSwapOption<Renderer>,
    /// Poll the loader at the start of each render.
    poll_inline: AtomicBool,
    stopped: AtomicBool,
}

impl Powerline {
    /// Load every artifact and build the first renderer. Any failure here is
    /// returned since there is nothing to fall back to.
    pub fn new(options: PowerlineOptions) -> Result<Self> {
        let pl = PowerlineLogger::with_sink(&options.ext, options.log_sink);
        let loader = Arc::new(ConfigLoader::new(options.run_once));
        loader.set_pl(pl.clone());
        let finder = match options.config_paths {
            Some(paths) => ConfigFinder::new(paths),
            None => ConfigFinder::from_env(),
        };
        let flags = Arc::new(Mutex::new(ReloadFlags::all()));
        let callbacks = Callbacks::new(&flags);

        let powerline = Self {
            ext: options.ext,
            kind: options.renderer,
            run_once: options.run_once,
            pl,
            finder,
            loader,
            registry: options.registry,
            config_overrides: options.config_overrides,
            theme_overrides: options.theme_overrides,
            flags,
            callbacks,
            loaded: Mutex::new(Loaded::default()),
            renderer: ArcSwapOption::empty(),
            poll_inline: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        };
        powerline.update_renderer()?;
        Ok(powerline)
    }

    pub fn ext(&self) -> &str {
        &self.ext
    }

    pub fn pl(&self) -> &PowerlineLogger {
        &self.pl
    }

    pub fn loader(&self) -> &Arc<ConfigLoader> {
        &self.loader
    }

    /// The live renderer. Holding the returned handle keeps it usable even
    /// after a reload replaced it.
    pub fn renderer(&self) -> Option<Arc<Renderer>> {
        self.renderer.load_full()
    }

    /// Rebuild whatever the reload flags ask for.
    ///
    /// With a renderer already live a failed rebuild is logged and the old
    /// renderer stays; the flags are consumed either way. Settings from
    /// `common` take effect only once the renderer built from them is live.
    pub fn update_renderer(&self) -> Result<()> {
        let mut loaded = lock(&self.loaded);
        let flags = std::mem::take(&mut *lock(&self.flags));
        if !flags.any() {
            return Ok(());
        }

        match self.rebuild(&loaded, flags) {
            Ok((next, renderer, main_reloaded)) => {
                *loaded = next;
                if let Some(previous) = self.renderer.swap(Some(Arc::new(renderer))) {
                    previous.shutdown();
                }
                if main_reloaded {
                    if let Some(main) = &loaded.main {
                        self.apply_common(main);
                    }
                }
                Ok(())
            }
            Err(err) if self.renderer().is_some() => {
                self.pl.error("powerline", format!("Failed to create renderer: {}", err));
                Ok(())
            }
            Err(err) => {
                lock(&self.flags).merge(flags);
                Err(err)
            }
        }
    }

    /// Build the next renderer. The flag tells whether the main config was
    /// reloaded on the way.
    fn rebuild(&self, current: &Loaded, mut flags: ReloadFlags) -> Result<(Loaded, Renderer, bool)> {
        let mut next = current.clone();
        let mut main_reloaded = false;

        if flags.main || next.main.is_none() {
            let main = self.load_main_config()?;
            let previous = next.main.as_ref();
            let ext = main.ext_config(&self.ext);
            if previous.map(|p| p.ext_config(&self.ext)) != Some(ext.clone()) {
                flags.colorscheme = true;
                flags.theme = true;
            }
            if previous.map(|p| &p.common) != Some(&main.common) {
                flags.theme = true;
            }
            next.main = Some(main);
            main_reloaded = true;
        }
        let main = next
            .main
            .clone()
            .ok_or_else(|| PowerlineError::invalid("main", "main configuration not loaded"))?;
        let ext = main.ext_config(&self.ext);

        if flags.colors || next.colors.is_none() {
            let colors = self.load_artifact(&self.callbacks.colors, |finder, loader, cb| {
                finder.load_config("colors", loader, Some(cb))
            })?;
            next.colors = Some(from_value("colors", colors)?);
            flags.colorscheme = true;
        }

        if flags.colorscheme || next.colorscheme.is_none() {
            let scheme = self.load_colorscheme(&ext.colorscheme)?;
            let colors = next.colors.as_ref().cloned().unwrap_or_default();
            next.colorscheme = Some(Arc::new(Colorscheme::new(&scheme, &colors)?));
            flags.theme = true;
        }

        if flags.theme || next.theme.is_none() {
            let top_theme = ext
                .top_theme
                .clone()
                .unwrap_or_else(|| main.common.default_top_theme.clone());
            let levels = vec![
                format!("themes/{}", top_theme),
                format!("themes/{}/__main__", self.ext),
                format!("themes/{}/{}", self.ext, ext.theme),
            ];
            let mut theme = self.load_artifact(&self.callbacks.theme, |finder, loader, cb| {
                finder.load_hierarchical(&levels, &[0, 1], loader, Some(cb))
            })?;
            if let Some(overrides) = &self.theme_overrides {
                merge_values(&mut theme, overrides);
            }
            next.theme = Some(from_value("theme", theme)?);
        }

        let colorscheme = next
            .colorscheme
            .clone()
            .ok_or_else(|| PowerlineError::invalid("colorscheme", "colorscheme not loaded"))?;
        let theme_config = next
            .theme
            .as_ref()
            .ok_or_else(|| PowerlineError::invalid("theme", "theme not loaded"))?;
        let theme = Theme::new(theme_config, colorscheme, &self.registry)?;
        let common = &main.common;
        let style = Style::new(
            self.kind,
            common.term_truecolor,
            common.additional_escapes.as_deref(),
            common.ambiwidth,
        );
        let renderer = Renderer::new(theme, style, self.pl.clone(), self.run_once);
        Ok((next, renderer, main_reloaded))
    }

    /// Re-register `callback` for a fresh lookup so paths of a previous
    /// configuration no longer trigger reloads.
    fn load_artifact<F>(&self, callback: &ReloadCallback, load: F) -> Result<Value>
    where
        F: FnOnce(&ConfigFinder, &ConfigLoader, &ReloadCallback) -> Result<Value>,
    {
        let removed = [callback.clone()];
        self.loader.unregister_functions(&removed);
        self.loader.unregister_missing(&removed);
        load(&self.finder, &self.loader, callback)
    }

    fn load_main_config(&self) -> Result<MainConfig> {
        let mut value = self.load_artifact(&self.callbacks.main, |finder, loader, cb| {
            finder.load_config("config", loader, Some(cb))
        })?;
        if let Some(overrides) = &self.config_overrides {
            merge_values(&mut value, overrides);
        }
        from_value("main", value)
    }

    /// Levels `colorschemes/<name>`, `colorschemes/<ext>/__main__` and
    /// `colorschemes/<ext>/<name>`; one besides `__main__` must exist.
    fn load_colorscheme(&self, name: &str) -> Result<ColorschemeConfig> {
        let levels = [
            (format!("colorschemes/{}", name), true),
            (format!("colorschemes/{}/__main__", self.ext), false),
            (format!("colorschemes/{}/{}", self.ext, name), true),
        ];
        let value = self.load_artifact(&self.callbacks.colorscheme, |finder, loader, cb| {
            let mut merged = Value::Object(Default::default());
            let mut found = false;
            let mut missing = None;
            for (level, counts) in &levels {
                match finder.load_config(level, loader, Some(cb)) {
                    Ok(layer) => {
                        merge_values(&mut merged, &layer);
                        found |= *counts;
                    }
                    Err(err) if err.is_not_found() => {
                        if *counts {
                            missing = Some(err);
                        }
                    }
                    Err(err) => return Err(err),
                }
            }
            match (found, missing) {
                (true, _) => Ok(merged),
                (false, Some(err)) => Err(err),
                (false, None) => Err(PowerlineError::invalid("colorscheme", format!("{} not found", name))),
            }
        })?;
        from_value("colorscheme", value)
    }

    fn apply_common(&self, main: &MainConfig) {
        let common = &main.common;
        match common.log_level.parse::<LogLevel>() {
            Ok(level) if std::env::var_os("POWERLINE_DEBUG").is_none() => self.pl.set_level(level),
            Ok(_) => {}
            Err(err) => self.pl.warn("powerline", err),
        }
        if self.run_once || !common.reload_config {
            self.poll_inline.store(false, Ordering::SeqCst);
            self.loader.shutdown();
            return;
        }
        self.loader.set_watcher(&common.watcher);
        self.pl.debug(
            "powerline",
            format!("Config watcher: {:?}", self.loader.watcher_kind()),
        );
        let interval = match common.interval {
            Some(seconds) if seconds > 0.0 => match Duration::try_from_secs_f64(seconds) {
                Ok(interval) => Some(interval),
                Err(err) => {
                    self.pl.warn(
                        "powerline",
                        format!("Ignoring interval {}: {}, polling on render", seconds, err),
                    );
                    None
                }
            },
            _ => None,
        };
        match interval {
            Some(interval) => {
                self.poll_inline.store(false, Ordering::SeqCst);
                self.loader.set_interval(Some(interval));
                if let Err(err) = self.loader.start() {
                    self.pl.error("powerline", format!("Failed to start config loader: {}", err));
                }
            }
            None => {
                self.loader.shutdown();
                self.loader.set_interval(None);
                self.poll_inline.store(true, Ordering::SeqCst);
            }
        }
    }

    /// Render one line; failures come back as an error.
    pub fn try_render(&self, request: &RenderRequest<'_>) -> Result<RenderOutput> {
        self.prepare()?.render(request)
    }

    /// Render one line. Failures are logged and shown in place of the line.
    pub fn render(&self, request: &RenderRequest<'_>) -> RenderOutput {
        self.try_render(request).unwrap_or_else(|err| self.failure(err))
    }

    pub fn render_above_lines(&self, request: &RenderRequest<'_>) -> Vec<RenderOutput> {
        match self.prepare().and_then(|renderer| renderer.render_above_lines(request)) {
            Ok(lines) => lines,
            Err(err) => vec![self.failure(err)],
        }
    }

    fn prepare(&self) -> Result<Arc<Renderer>> {
        if self.poll_inline.load(Ordering::SeqCst) {
            self.loader.update();
        }
        self.update_renderer()?;
        self.renderer()
            .ok_or_else(|| PowerlineError::invalid("renderer", "no renderer available"))
    }

    fn failure(&self, err: PowerlineError) -> RenderOutput {
        self.pl.error("powerline", format!("Failed to render: {}", err));
        let text = err.to_string();
        RenderOutput {
            width: Some(crate::renderer::width::strwidth(&text, 1)),
            raw: Some(text.clone()),
            text,
        }
    }

    /// Stop background work and forget every file watch. Safe to call more
    /// than once.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.loader.shutdown();
        let callbacks = self.callbacks.all();
        self.loader.unregister_functions(&callbacks);
        self.loader.unregister_missing(&callbacks);
        if let Some(renderer) = self.renderer() {
            renderer.shutdown();
        }
    }
}

impl Drop for Powerline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segments::SegmentInfo;
    use crate::utils::RecordingSink;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, content: &str) {
        let path = dir.join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn config_tree(dir: &Path) {
        write(
            dir,
            "config.json",
            r#"{"common": {"interval": null, "watcher": "stat"}, "ext": {"test": {"theme": "main"}}}"#,
        );
        write(dir, "colors.json", r#"{"colors": {"black": 16, "white": 231}}"#);
        write(
            dir,
            "colorschemes/default.json",
            r#"{"groups": {"string": {"fg": "white", "bg": "black"}}}"#,
        );
        write(
            dir,
            "themes/powerline.json",
            r#"{"dividers": {"left": {"hard": ">", "soft": "|"}, "right": {"hard": "<", "soft": "|"}}, "spaces": 0, "outer_padding": 0}"#,
        );
        write(
            dir,
            "themes/test/main.json",
            r#"{"segments": {"left": [{"type": "string", "contents": "hello"}]}}"#,
        );
    }

    fn powerline(dir: &Path, run_once: bool) -> (Powerline, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new());
        let mut options = PowerlineOptions::new("test", RendererKind::Plain);
        options.run_once = run_once;
        options.config_paths = Some(vec![dir.to_path_buf()]);
        options.log_sink = sink.clone();
        (Powerline::new(options).unwrap(), sink)
    }

    fn render_raw(powerline: &Powerline) -> String {
        let info = SegmentInfo::default();
        powerline
            .render(&RenderRequest {
                output_raw: true,
                ..RenderRequest::new(&info)
            })
            .raw
            .unwrap()
    }

    #[test]
    fn test_initial_render() {
        let dir = TempDir::new().unwrap();
        config_tree(dir.path());
        let (powerline, _) = powerline(dir.path(), true);
        assert_eq!(render_raw(&powerline), "hello>");
    }

    #[test]
    fn test_missing_config_is_fatal_at_startup() {
        let dir = TempDir::new().unwrap();
        let mut options = PowerlineOptions::new("test", RendererKind::Plain);
        options.run_once = true;
        options.config_paths = Some(vec![dir.path().to_path_buf()]);
        assert!(matches!(
            Powerline::new(options),
            Err(PowerlineError::ConfigNotFound { .. })
        ));
    }

    #[test]
    fn test_colorscheme_needs_more_than_main_level() {
        let dir = TempDir::new().unwrap();
        config_tree(dir.path());
        fs::remove_file(dir.path().join("colorschemes/default.json")).unwrap();
        write(
            dir.path(),
            "colorschemes/test/__main__.json",
            r#"{"groups": {"string": {"fg": "white", "bg": "black"}}}"#,
        );
        let mut options = PowerlineOptions::new("test", RendererKind::Plain);
        options.run_once = true;
        options.config_paths = Some(vec![dir.path().to_path_buf()]);
        assert!(Powerline::new(options).is_err());
    }

    #[test]
    fn test_flags_coalesce_into_one_rebuild() {
        let dir = TempDir::new().unwrap();
        config_tree(dir.path());
        let (powerline, _) = powerline(dir.path(), true);
        let before = powerline.renderer().unwrap();
        for _ in 0..3 {
            powerline.callbacks.theme.call(Path::new("themes/test/main.json"));
        }
        assert!(lock(&powerline.flags).theme);
        powerline.update_renderer().unwrap();
        assert!(!lock(&powerline.flags).any());
        let after = powerline.renderer().unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        // Nothing pending: no new renderer.
        powerline.update_renderer().unwrap();
        assert!(Arc::ptr_eq(&after, &powerline.renderer().unwrap()));
    }

    #[test]
    fn test_broken_reload_keeps_old_renderer() {
        let dir = TempDir::new().unwrap();
        config_tree(dir.path());
        let (powerline, sink) = powerline(dir.path(), false);
        assert_eq!(render_raw(&powerline), "hello>");

        // Unknown function: the theme parses but the renderer cannot be built.
        write(
            dir.path(),
            "themes/test/main.json",
            r#"{"segments": {"left": [{"function": "nope.missing"}]}}"#,
        );
        powerline.callbacks.theme.call(Path::new("themes/test/main.json"));
        powerline.loader.update();
        assert_eq!(render_raw(&powerline), "hello>");
        assert!(sink.lines().iter().any(|l| l.contains("Failed to create renderer")));
        assert!(!lock(&powerline.flags).any());
    }

    #[test]
    fn test_rejected_config_leaves_settings_alone() {
        let dir = TempDir::new().unwrap();
        config_tree(dir.path());
        write(
            dir.path(),
            "themes/test/other.json",
            r#"{"segments": {"left": [{"type": "string", "contents": "other"}]}}"#,
        );
        let (powerline, sink) = powerline(dir.path(), false);
        assert_eq!(render_raw(&powerline), "hello>");
        let level = powerline.pl.level();

        write(
            dir.path(),
            "config.json",
            r#"{"common": {"interval": null, "watcher": "stat", "reload_config": false, "log_level": "CRITICAL"},
                "ext": {"test": {"theme": "missing"}}}"#,
        );
        assert_eq!(render_raw(&powerline), "hello>");
        assert!(sink.lines().iter().any(|l| l.contains("Failed to create renderer")));
        assert!(powerline.poll_inline.load(Ordering::SeqCst));
        assert_eq!(powerline.pl.level(), level);

        write(
            dir.path(),
            "config.json",
            r#"{"common": {"interval": null, "watcher": "stat"}, "ext": {"test": {"theme": "other"}}}"#,
        );
        assert_eq!(render_raw(&powerline), "other>");
        powerline.shutdown();
    }

    #[test]
    fn test_out_of_range_interval_polls_on_render() {
        let dir = TempDir::new().unwrap();
        config_tree(dir.path());
        write(
            dir.path(),
            "config.json",
            r#"{"common": {"interval": 1e20, "watcher": "stat"}, "ext": {"test": {"theme": "main"}}}"#,
        );
        let (powerline, sink) = powerline(dir.path(), false);
        assert!(powerline.poll_inline.load(Ordering::SeqCst));
        assert!(!powerline.loader.is_alive());
        assert!(sink
            .lines()
            .iter()
            .any(|l| l.starts_with("test:powerline:Ignoring interval")));
        assert_eq!(render_raw(&powerline), "hello>");
        powerline.shutdown();
    }

    #[test]
    fn test_render_error_is_visible() {
        let dir = TempDir::new().unwrap();
        config_tree(dir.path());
        write(
            dir.path(),
            "themes/test/main.json",
            r#"{"segments": {"left": [{"type": "string", "contents": "x", "highlight_groups": ["nope"]}]}}"#,
        );
        let (powerline, sink) = powerline(dir.path(), true);
        let info = SegmentInfo::default();
        let out = powerline.render(&RenderRequest::new(&info));
        assert!(out.text.contains("nope"), "{}", out.text);
        assert!(powerline.try_render(&RenderRequest::new(&info)).is_err());
        assert!(sink.lines().iter().any(|l| l.starts_with("test:powerline:Failed to render")));
    }

    #[test]
    fn test_shutdown_unregisters_callbacks() {
        let dir = TempDir::new().unwrap();
        config_tree(dir.path());
        let (powerline, _) = powerline(dir.path(), false);
        assert!(!powerline.loader.watched_paths().is_empty());
        powerline.shutdown();
        assert!(powerline.loader.watched_paths().is_empty());
        assert!(powerline.loader.missing_keys().is_empty());
        powerline.shutdown();
    }
}
