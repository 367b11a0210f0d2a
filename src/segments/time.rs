use crate::segments::{arg_bool, arg_str, Chunk, SegmentOutput, SegmentRegistry};
use chrono::Local;
use std::fmt::Write;

pub fn register(registry: &mut SegmentRegistry) {
    registry.register_fn("time.date", |_ctx, args| {
        let format = arg_str(args, "format").unwrap_or("%Y-%m-%d");
        let istime = arg_bool(args, "istime", false);
        let mut contents = String::new();
        write!(contents, "{}", Local::now().format(format))
            .map_err(|_| anyhow::anyhow!("invalid date format: {}", format))?;
        Ok(SegmentOutput::Chunks(vec![date_chunk(contents, istime)]))
    });
}

fn date_chunk(contents: String, istime: bool) -> Chunk {
    let chunk = Chunk::new(contents);
    if istime {
        Chunk {
            divider_highlight_group: Some("time:divider".to_string()),
            ..chunk.with_groups(["time", "date"])
        }
    } else {
        chunk.with_groups(["date"])
    }
}
