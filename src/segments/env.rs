use crate::renderer::width::{strwidth, tail_fitting};
use crate::segments::{
    arg_bool, arg_str, arg_u64, Chunk, SegmentContext, SegmentFunction, SegmentOutput, SegmentRegistry,
};
use crate::utils::ProcessContext;
use serde_json::{Map, Value};
use std::path::{Path, MAIN_SEPARATOR};
use std::sync::Arc;

pub fn register(registry: &mut SegmentRegistry) {
    registry.register_fn("env.user", |ctx, args| {
        let process = ProcessContext::global();
        let Some(username) = process.username() else {
            ctx.pl.warn("user", "Failed to get username");
            return Ok(SegmentOutput::None);
        };
        if arg_str(args, "hide_user") == Some(&*username) {
            return Ok(SegmentOutput::None);
        }
        let groups: &[&str] = if process.euid() == Some(0) {
            &["superuser", "user"]
        } else {
            &["user"]
        };
        Ok(SegmentOutput::Chunks(vec![
            Chunk::new(username.to_string()).with_groups(groups.iter().copied())
        ]))
    });

    registry.register_fn("env.hostname", |ctx, args| {
        let Some(hostname) = ProcessContext::global().hostname() else {
            ctx.pl.warn("hostname", "Failed to get hostname");
            return Ok(SegmentOutput::None);
        };
        let only_if_ssh = arg_bool(args, "only_if_ssh", false);
        if only_if_ssh && ctx.info.getenv("SSH_CLIENT").is_none() {
            return Ok(SegmentOutput::None);
        }
        let hostname = if arg_bool(args, "exclude_domain", false) {
            hostname.split('.').next().unwrap_or_default().to_string()
        } else {
            hostname.to_string()
        };
        Ok(SegmentOutput::Text(hostname))
    });

    registry.register_fn("env.environment", |ctx, args| {
        Ok(arg_str(args, "variable")
            .and_then(|name| ctx.info.getenv(name))
            .map(SegmentOutput::text)
            .unwrap_or_default())
    });

    registry.register_fn("env.virtualenv", |ctx, _args| {
        Ok(ctx
            .info
            .getenv("VIRTUAL_ENV")
            .and_then(|path| Path::new(path).file_name())
            .map(|name| SegmentOutput::text(name.to_string_lossy()))
            .unwrap_or_default())
    });

    let cwd: Arc<dyn SegmentFunction> = Arc::new(CwdSegment);
    registry.register("env.cwd", move || cwd.clone());
}

/// Current directory as a breadcrumb, one chunk per path component.
pub struct CwdSegment;

impl CwdSegment {
    fn shortened_path(ctx: &SegmentContext<'_>, shorten_home: bool) -> Option<String> {
        let cwd = ctx.info.cwd.as_ref()?;
        let path = cwd.to_string_lossy().into_owned();
        if shorten_home {
            if let Some(home) = ctx.info.getenv("HOME").filter(|home| !home.is_empty()) {
                if let Some(rest) = path.strip_prefix(home) {
                    if rest.is_empty() || rest.starts_with(MAIN_SEPARATOR) {
                        return Some(format!("~{}", rest));
                    }
                }
            }
        }
        Some(path)
    }
}

impl SegmentFunction for CwdSegment {
    fn call(&self, ctx: &SegmentContext<'_>, args: &Map<String, Value>) -> anyhow::Result<SegmentOutput> {
        let Some(path) = Self::shortened_path(ctx, arg_bool(args, "shorten_home", true)) else {
            ctx.pl.warn("cwd", "Current directory not found");
            return Ok(SegmentOutput::text("[not found]"));
        };
        let shorten_len = arg_u64(args, "dir_shorten_len").map(|len| len as usize);
        let limit_depth = arg_u64(args, "dir_limit_depth").map(|depth| depth as usize);
        let use_path_separator = arg_bool(args, "use_path_separator", false);
        let ellipsis = match args.get("ellipsis") {
            Some(Value::Null) => None,
            Some(Value::String(ellipsis)) => Some(ellipsis.as_str()),
            _ => Some("..."),
        };

        let split: Vec<&str> = path.split(MAIN_SEPARATOR).collect();
        let last = split.len() - 1;
        let mut parts: Vec<String> = split
            .iter()
            .enumerate()
            .map(|(i, part)| match shorten_len {
                Some(len) if len > 0 && i < last && !part.is_empty() => part.chars().take(len).collect(),
                _ => part.to_string(),
            })
            .collect();
        if let Some(depth) = limit_depth.filter(|depth| *depth > 0) {
            if split.len() > depth + 1 {
                parts.drain(..parts.len() - depth);
                if let Some(ellipsis) = ellipsis {
                    parts.insert(0, ellipsis.to_string());
                }
            }
        }
        if parts.first().is_some_and(String::is_empty) {
            parts[0] = MAIN_SEPARATOR.to_string();
        }

        let mut chunks: Vec<Chunk> = parts
            .into_iter()
            .filter(|part| !part.is_empty())
            .map(|part| {
                let contents = if use_path_separator && part != MAIN_SEPARATOR.to_string() {
                    format!("{}{}", part, MAIN_SEPARATOR)
                } else {
                    part
                };
                Chunk {
                    divider_highlight_group: Some("cwd:divider".to_string()),
                    ..Chunk::new(contents).with_inner_divider(!use_path_separator)
                }
            })
            .collect();
        let Some(current) = chunks.last_mut() else {
            return Ok(SegmentOutput::None);
        };
        current.highlight_groups = vec!["cwd:current_folder".to_string(), "cwd".to_string()];
        if use_path_separator && current.contents.len() > 1 {
            current.contents.pop();
        }
        Ok(SegmentOutput::Chunks(chunks))
    }

    /// Leading components are dropped whole; a component longer than the
    /// overflow loses its leading characters behind an ellipsis.
    fn truncate(
        &self,
        _ctx: &SegmentContext<'_>,
        amount: usize,
        contents: &str,
        _args: &Map<String, Value>,
    ) -> Option<String> {
        let width = strwidth(contents, 1);
        if amount >= width {
            return Some(String::new());
        }
        // One column goes to the ellipsis.
        Some(format!("\u{2026}{}", tail_fitting(contents, width - amount - 1, 1)))
    }

    fn can_truncate(&self) -> bool {
        true
    }
}
