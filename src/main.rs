use anyhow::{bail, Context, Result};
use atty::Stream;
use colored::Colorize;
use pico_args::Arguments;
use powerline_engine::config::parse_overrides;
use powerline_engine::{Powerline, PowerlineOptions, RenderRequest, RendererKind, SegmentInfo, Side};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
struct Args {
    ext: String,
    renderer: String,
    side: Option<Side>,
    width: Option<usize>,
    mode: Option<String>,
    line: usize,
    above: bool,
    last_exit_code: Option<i64>,
    jobnum: Option<u64>,
    config_paths: Vec<PathBuf>,
    config_overrides: Vec<String>,
    theme_overrides: Vec<String>,
    watch: bool,
    tick: f64,
    help: bool,
}

impl Args {
    fn from_env() -> Result<Self> {
        let mut args = Arguments::from_env();

        let parsed = Self {
            help: args.contains(["-h", "--help"]),
            watch: args.contains("--watch"),
            above: args.contains("--above"),
            renderer: args
                .opt_value_from_str("--renderer")?
                .unwrap_or_else(|| "ansi".to_string()),
            side: args.opt_value_from_str("--side")?,
            width: args.opt_value_from_str("--width")?,
            mode: args.opt_value_from_str("--mode")?,
            line: args.opt_value_from_str("--line")?.unwrap_or(0),
            last_exit_code: args.opt_value_from_str("--last-exit-code")?,
            jobnum: args.opt_value_from_str("--jobnum")?,
            config_paths: args.values_from_str("--config-path")?,
            config_overrides: args.values_from_str("--config-override")?,
            theme_overrides: args.values_from_str("--theme-override")?,
            tick: args.opt_value_from_str("--tick")?.unwrap_or(1.0),
            ext: args
                .opt_free_from_str()?
                .unwrap_or_else(|| "shell".to_string()),
        };

        let rest = args.finish();
        if !rest.is_empty() {
            bail!("unexpected arguments: {:?}", rest);
        }
        Ok(parsed)
    }

    fn segment_info(&self) -> SegmentInfo {
        let mut info = SegmentInfo::from_env();
        if let Some(code) = self.last_exit_code {
            info = info.with_extra("last_exit_code", json!(code));
        }
        if let Some(jobs) = self.jobnum {
            info = info.with_extra("jobnum", json!(jobs));
        }
        info
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("POWERLINE_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .try_init();
}

fn render_lines(powerline: &Powerline, args: &Args) -> String {
    let info = args.segment_info();
    let request = RenderRequest {
        mode: args.mode.as_deref(),
        width: args.width,
        side: args.side,
        line: args.line,
        ..RenderRequest::new(&info)
    };
    let mut lines: Vec<String> = Vec::new();
    if args.above {
        lines.extend(powerline.render_above_lines(&request).into_iter().map(|out| out.text));
    }
    lines.push(powerline.render(&request).text);
    lines.join("\n")
}

async fn watch(powerline: Arc<Powerline>, args: Args) -> Result<()> {
    let tick = Duration::try_from_secs_f64(args.tick.max(0.1))
        .map_err(|e| anyhow::anyhow!("invalid --tick {}: {}", args.tick, e))?;
    let mut ticker = tokio::time::interval(tick);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                let (powerline, args) = (powerline.clone(), args.clone());
                let line = tokio::task::spawn_blocking(move || render_lines(&powerline, &args))
                    .await
                    .context("Render task failed")?;
                println!("{}", line);
            }
        }
    }
    powerline.shutdown();
    Ok(())
}

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        if atty::is(Stream::Stderr) {
            eprintln!("{} {:#}", "error:".red().bold(), err);
        } else {
            eprintln!("error: {:#}", err);
        }
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args = Args::from_env()?;

    if args.help {
        print_help();
        return Ok(());
    }

    let kind: RendererKind = args.renderer.parse()?;
    let mut options = PowerlineOptions::new(&args.ext, kind);
    options.run_once = !args.watch;
    if !args.config_paths.is_empty() {
        options.config_paths = Some(args.config_paths.clone());
    }
    options.config_overrides = parse_overrides(&args.config_overrides)?;
    options.theme_overrides = parse_overrides(&args.theme_overrides)?;

    let powerline = Powerline::new(options).context("Failed to create powerline")?;
    if args.watch {
        return watch(Arc::new(powerline), args).await;
    }

    println!("{}", render_lines(&powerline, &args));
    powerline.shutdown();
    Ok(())
}

fn print_help() {
    println!("powerline - status line renderer");
    println!();
    println!("USAGE:");
    println!("    powerline [EXT] [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    --renderer <KIND>          ansi, shell, bash, zsh, tmux, plain [default: ansi]");
    println!("    --side <SIDE>              Render only the left or right side");
    println!("    --width <N>                Fit the line into N columns");
    println!("    --mode <MODE>              Editor or shell mode");
    println!("    --line <N>                 Theme line to render [default: 0]");
    println!("    --above                    Also render the lines above the main one");
    println!("    --last-exit-code <N>       Exit status of the previous command");
    println!("    --jobnum <N>               Number of background jobs");
    println!("    --config-path <DIR>        Search DIR for configuration (repeatable)");
    println!("    --config-override <K=V>    Override a main config key (repeatable)");
    println!("    --theme-override <K=V>     Override a theme key (repeatable)");
    println!("    --watch                    Re-render every tick until Ctrl-C");
    println!("    --tick <SECS>              Seconds between renders with --watch [default: 1]");
    println!("    -h, --help                 Show this help message");
    println!();
    println!("ENVIRONMENT VARIABLES:");
    println!("    POWERLINE_CONFIG_PATHS     Colon-separated configuration search path");
    println!("    POWERLINE_LOG              tracing filter for diagnostics [default: warn]");
    println!("    POWERLINE_DEBUG            Enable debug logging");
}
