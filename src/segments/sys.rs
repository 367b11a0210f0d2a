use crate::segments::threaded::{ThreadedSegment, ThreadedUpdate};
use crate::segments::{
    arg_bool, arg_f64, arg_str, arg_u64, fill, Chunk, SegmentContext, SegmentFunction, SegmentOutput,
    SegmentRegistry,
};
use crate::utils::{PowerlineLogger, ProcessContext};
use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::fs;
use std::sync::Arc;

pub fn register(registry: &mut SegmentRegistry) {
    registry.register("sys.cpu_load_percent", || {
        Arc::new(ThreadedSegment::threaded(CpuLoad)) as Arc<dyn SegmentFunction>
    });

    registry.register_fn("sys.system_load", |_ctx, args| {
        let loadavg = fs::read_to_string("/proc/loadavg").context("Failed to read /proc/loadavg")?;
        let averages = parse_loadavg(&loadavg).context("Malformed /proc/loadavg")?;
        let cpu_count = if arg_bool(args, "track_cpu_count", false) {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            ProcessContext::global().cpu_count()
        };
        Ok(system_load_chunks(args, averages, cpu_count))
    });

    registry.register_fn("sys.uptime", |_ctx, args| {
        let uptime = fs::read_to_string("/proc/uptime").context("Failed to read /proc/uptime")?;
        let seconds: f64 = uptime
            .split_whitespace()
            .next()
            .and_then(|s| s.parse().ok())
            .context("Malformed /proc/uptime")?;
        let formatted = format_uptime(seconds as u64, args);
        Ok(SegmentOutput::Chunks(vec![Chunk {
            divider_highlight_group: Some("background:divider".to_string()),
            ..Chunk::new(formatted)
        }]))
    });
}

/// Aggregate CPU counters from the first line of `/proc/stat`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpuSample {
    pub total: u64,
    pub idle: u64,
    /// Busy share since the previous sample.
    pub percent: Option<f64>,
}

pub fn parse_proc_stat(stat: &str) -> Option<(u64, u64)> {
    let line = stat.lines().find(|line| line.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(|field| field.parse().ok())
        .collect::<Option<_>>()?;
    if fields.len() < 4 {
        return None;
    }
    // idle + iowait
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some((fields.iter().sum(), idle))
}

const FIRST_SAMPLE_GAP: std::time::Duration = std::time::Duration::from_millis(100);

pub struct CpuLoad;

impl CpuLoad {
    pub fn sample(stat: &str, previous: Option<&CpuSample>) -> Result<CpuSample> {
        let (total, idle) = parse_proc_stat(stat).context("Malformed /proc/stat")?;
        let percent = previous.and_then(|previous| {
            let total_delta = total.checked_sub(previous.total)?;
            let idle_delta = idle.checked_sub(previous.idle)?;
            (total_delta > 0).then(|| 100.0 * (1.0 - idle_delta as f64 / total_delta as f64))
        });
        Ok(CpuSample { total, idle, percent })
    }
}

impl ThreadedUpdate for CpuLoad {
    type Value = CpuSample;

    fn name(&self) -> &'static str {
        "cpu_load_percent"
    }

    fn update(&self, _pl: &PowerlineLogger, previous: Option<&CpuSample>) -> Result<CpuSample> {
        let read = || fs::read_to_string("/proc/stat").context("Failed to read /proc/stat");
        match previous {
            Some(previous) => Self::sample(&read()?, Some(previous)),
            None => {
                // A percentage needs two samples.
                let first = Self::sample(&read()?, None)?;
                std::thread::sleep(FIRST_SAMPLE_GAP);
                Self::sample(&read()?, Some(&first))
            }
        }
    }

    fn render(&self, value: &CpuSample, _ctx: &SegmentContext<'_>, args: &Map<String, Value>) -> Result<SegmentOutput> {
        let Some(percent) = value.percent.filter(|percent| *percent > 0.0) else {
            return Ok(SegmentOutput::None);
        };
        let format = arg_str(args, "format").unwrap_or("{}%");
        Ok(SegmentOutput::Chunks(vec![Chunk::new(fill(format, &format!("{:.0}", percent)))
            .with_groups(["cpu_load_percent_gradient", "cpu_load_percent"])
            .with_gradient(percent)]))
    }
}

pub fn parse_loadavg(loadavg: &str) -> Option<[f64; 3]> {
    let mut fields = loadavg.split_whitespace().map(|field| field.parse::<f64>().ok());
    Some([fields.next()??, fields.next()??, fields.next()??])
}

fn system_load_chunks(
    args: &Map<String, Value>,
    averages: [f64; 3],
    cpu_count: usize,
) -> SegmentOutput {
    let threshold_good = arg_f64(args, "threshold_good").unwrap_or(1.0);
    let threshold_bad = arg_f64(args, "threshold_bad").unwrap_or(2.0);
    let short = arg_bool(args, "short", false);
    let format = arg_str(args, "format").unwrap_or("{}");

    let shown = if short { &averages[..1] } else { &averages[..] };
    let mut chunks: Vec<Chunk> = shown
        .iter()
        .map(|avg| {
            let normalized = avg / cpu_count.max(1) as f64;
            let level = if normalized < threshold_good {
                0.0
            } else if normalized < threshold_bad {
                (normalized - threshold_good) * 100.0 / (threshold_bad - threshold_good)
            } else {
                100.0
            };
            Chunk {
                divider_highlight_group: Some("background:divider".to_string()),
                ..Chunk::new(fill(format, &format!("{:.1}", avg)))
                    .with_groups(["system_load_gradient", "system_load"])
                    .with_gradient(level)
            }
        })
        .collect();
    if !short {
        for chunk in chunks.iter_mut().take(2) {
            chunk.contents.push(' ');
        }
    }
    SegmentOutput::Chunks(chunks)
}

pub fn format_uptime(seconds: u64, args: &Map<String, Value>) -> String {
    let (minutes, seconds) = (seconds / 60, seconds % 60);
    let (hours, minutes) = (minutes / 60, minutes % 60);
    let (days, hours) = (hours / 24, hours % 24);
    let shorten_len = arg_u64(args, "shorten_len").unwrap_or(3) as usize;
    let units = [
        (days, arg_str(args, "days_format").unwrap_or("{}d")),
        (hours, arg_str(args, "hours_format").unwrap_or(" {}h")),
        (minutes, arg_str(args, "minutes_format").unwrap_or(" {}m")),
        (seconds, arg_str(args, "seconds_format").unwrap_or(" {}s")),
    ];
    units
        .iter()
        .filter(|(value, format)| *value > 0 && !format.is_empty())
        .take(shorten_len)
        .map(|(value, format)| fill(format, &value.to_string()))
        .collect::<String>()
        .trim()
        .to_string()
}
