use crate::segments::threaded::{KeyedSegment, KeyedUpdate};
use crate::segments::{
    arg_bool, arg_f64, arg_str, fill, Chunk, SegmentContext, SegmentFunction, SegmentOutput, SegmentRegistry,
};
use crate::utils::PowerlineLogger;
use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub fn register(registry: &mut SegmentRegistry) {
    registry.register("net.network_load", || {
        Arc::new(KeyedSegment::new(NetworkLoad)) as Arc<dyn SegmentFunction>
    });
}

const FIRST_SAMPLE_GAP: Duration = Duration::from_millis(250);

/// Names never picked by interface auto-detection.
const IGNORED_INTERFACES: [&str; 3] = ["lo", "vmnet", "sit"];

/// Byte counters of one interface at one moment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ByteSample {
    pub at: Instant,
    pub recv: u64,
    pub sent: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceLoad {
    pub interface: String,
    pub prev: Option<ByteSample>,
    pub last: ByteSample,
}

impl InterfaceLoad {
    /// Bytes per second received and sent between the two samples.
    pub fn rates(&self) -> Option<(f64, f64)> {
        let prev = self.prev?;
        let elapsed = self.last.at.duration_since(prev.at).as_secs_f64();
        if elapsed <= 0.0 {
            return Some((0.0, 0.0));
        }
        let rate = |last: u64, prev: u64| last.saturating_sub(prev) as f64 / elapsed;
        Some((rate(self.last.recv, prev.recv), rate(self.last.sent, prev.sent)))
    }
}

/// `(interface, received bytes, sent bytes)` for every line of
/// `/proc/net/dev`.
pub fn parse_net_dev(dev: &str) -> Vec<(String, u64, u64)> {
    dev.lines()
        .filter_map(|line| {
            let (name, counters) = line.split_once(':')?;
            let fields: Vec<u64> = counters
                .split_whitespace()
                .map(|field| field.parse().ok())
                .collect::<Option<_>>()?;
            Some((name.trim().to_string(), *fields.first()?, *fields.get(8)?))
        })
        .collect()
}

/// Interface carrying the default route in `/proc/net/route`.
pub fn default_route_interface(route: &str) -> Option<String> {
    route.lines().skip(1).find_map(|line| {
        let mut parts = line.split_whitespace();
        let interface = parts.next()?;
        let destination = parts.next()?;
        destination
            .chars()
            .all(|c| c == '0')
            .then(|| interface.to_string())
    })
}

/// Busiest interface, skipping loopback and virtual ones.
pub fn busiest_interface(interfaces: &[(String, u64, u64)]) -> Option<String> {
    interfaces
        .iter()
        .filter(|(name, _, _)| {
            let base = name.trim_end_matches(|c: char| c.is_ascii_digit());
            !IGNORED_INTERFACES.contains(&base)
        })
        .max_by_key(|(_, recv, sent)| recv + sent)
        .map(|(name, _, _)| name.clone())
}

/// Human readable byte count: `1.5 KiB/s` or, with SI prefixes, `1.5 kB/s`.
pub fn humanize_bytes(num: f64, suffix: &str, si_prefix: bool) -> String {
    if num == 0.0 {
        return format!("0 {}", suffix);
    }
    let (div, units): (f64, [&str; 6]) = if si_prefix {
        (1000.0, ["", "k", "M", "G", "T", "P"])
    } else {
        (1024.0, ["", "Ki", "Mi", "Gi", "Ti", "Pi"])
    };
    let decimals = [0, 0, 1, 2, 2, 2];
    let exponent = ((num.ln() / div.ln()).floor().max(0.0) as usize).min(units.len() - 1);
    let quotient = num / div.powi(exponent as i32);
    format!(
        "{:.*} {}{}",
        decimals[exponent],
        quotient,
        units[exponent],
        suffix
    )
}

fn read_counters(interface: &str) -> Result<ByteSample> {
    let dev = fs::read_to_string("/proc/net/dev").context("Failed to read /proc/net/dev")?;
    let (_, recv, sent) = parse_net_dev(&dev)
        .into_iter()
        .find(|(name, _, _)| name == interface)
        .with_context(|| format!("Interface {} not found", interface))?;
    Ok(ByteSample {
        at: Instant::now(),
        recv,
        sent,
    })
}

fn resolve_interface(requested: &str) -> Result<String> {
    if requested != "auto" {
        return Ok(requested.to_string());
    }
    if let Some(interface) = fs::read_to_string("/proc/net/route")
        .ok()
        .and_then(|route| default_route_interface(&route))
    {
        return Ok(interface);
    }
    let dev = fs::read_to_string("/proc/net/dev").context("Failed to read /proc/net/dev")?;
    Ok(busiest_interface(&parse_net_dev(&dev)).unwrap_or_else(|| "eth0".to_string()))
}

/// Receive and send rates per interface.
pub struct NetworkLoad;

impl KeyedUpdate for NetworkLoad {
    type Key = String;
    type Value = InterfaceLoad;

    fn name(&self) -> &'static str {
        "network_load"
    }

    fn key(&self, _ctx: &SegmentContext<'_>, args: &Map<String, Value>) -> Result<String> {
        Ok(arg_str(args, "interface").unwrap_or("auto").to_string())
    }

    fn compute(&self, _pl: &PowerlineLogger, key: &String, previous: Option<&InterfaceLoad>) -> Result<InterfaceLoad> {
        let interface = resolve_interface(key)?;
        let prev = match previous.filter(|previous| previous.interface == interface) {
            Some(previous) => previous.last,
            None => {
                let first = read_counters(&interface)?;
                std::thread::sleep(FIRST_SAMPLE_GAP);
                first
            }
        };
        let last = read_counters(&interface)?;
        Ok(InterfaceLoad {
            interface,
            prev: Some(prev),
            last,
        })
    }

    fn render_one(
        &self,
        load: &InterfaceLoad,
        ctx: &SegmentContext<'_>,
        args: &Map<String, Value>,
    ) -> Result<SegmentOutput> {
        let Some((recv, sent)) = load.rates() else {
            return Ok(SegmentOutput::None);
        };
        if load.prev.is_some_and(|prev| prev.at == load.last.at) {
            ctx.pl.warn(self.name(), "Measure interval zero.");
        }
        let suffix = arg_str(args, "suffix").unwrap_or("B/s");
        let si_prefix = arg_bool(args, "si_prefix", false);
        let chunks = [
            ("recv", recv, arg_str(args, "recv_format").unwrap_or("DL {}")),
            ("sent", sent, arg_str(args, "sent_format").unwrap_or("UL {}")),
        ]
        .into_iter()
        .map(|(direction, value, format)| {
            let contents = fill(format, &format!("{:>8}", humanize_bytes(value, suffix, si_prefix)));
            let base = [format!("network_load_{}", direction), "network_load".to_string()];
            let chunk = Chunk {
                divider_highlight_group: Some("background:divider".to_string()),
                ..Chunk::new(contents)
            };
            match arg_f64(args, &format!("{}_max", direction)) {
                Some(max) if max > 0.0 => {
                    let gradient: Vec<String> = base.iter().map(|group| format!("{}_gradient", group)).collect();
                    chunk
                        .with_groups(gradient.into_iter().chain(base))
                        .with_gradient((value * 100.0 / max).min(100.0))
                }
                _ => chunk.with_groups(base),
            }
        })
        .collect();
        Ok(SegmentOutput::Chunks(chunks))
    }

    fn default_interval(&self) -> Duration {
        Duration::from_secs(1)
    }
}
