use crate::segments::{Chunk, SegmentOutput, SegmentRegistry};
use serde_json::Value;

fn as_i64(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn register(registry: &mut SegmentRegistry) {
    registry.register_fn("shell.last_status", |ctx, _args| {
        match as_i64(ctx.info.get("last_exit_code")) {
            Some(0) | None => Ok(SegmentOutput::None),
            Some(code) => Ok(SegmentOutput::Chunks(vec![
                Chunk::new(code.to_string()).with_groups(["exit_fail"])
            ])),
        }
    });

    registry.register_fn("shell.jobnum", |ctx, args| {
        let show_zero = args.get("show_zero").and_then(Value::as_bool).unwrap_or(false);
        match as_i64(ctx.info.get("jobnum")) {
            Some(0) if !show_zero => Ok(SegmentOutput::None),
            Some(jobs) => Ok(SegmentOutput::Text(jobs.to_string())),
            None => Ok(SegmentOutput::None),
        }
    });
}
