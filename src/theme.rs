use crate::colorscheme::Colorscheme;
use crate::config::{Dividers, ThemeConfig};
use crate::error::{PowerlineError, Result};
use crate::segment::{
    process_output, AttrArena, DescriptorBuilder, OutputScope, RenderSegment, SegmentDescriptor, SegmentSource,
    Side,
};
use crate::segments::threaded::panic_message;
use crate::segments::{SegmentContext, SegmentFunction, SegmentInfo, SegmentOutput, SegmentRegistry};
use crate::utils::PowerlineLogger;
use rayon::prelude::*;
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DividerKind {
    Soft,
    Hard,
}

/// What one render asks of a theme.
#[derive(Clone, Copy)]
pub struct SegmentRequest<'a> {
    pub pl: &'a PowerlineLogger,
    pub info: &'a SegmentInfo,
    pub mode: Option<&'a str>,
    pub side: Option<Side>,
    pub line: usize,
    pub run_once: bool,
    pub ambiwidth: usize,
}

impl<'a> SegmentRequest<'a> {
    pub fn context(&self) -> SegmentContext<'a> {
        SegmentContext {
            pl: self.pl,
            info: self.info,
            run_once: self.run_once,
        }
    }
}

/// A loaded theme: stacked lines of segment descriptors plus the colorscheme
/// they are drawn with. Line 0 is the main line, lines above it follow.
pub struct Theme {
    dividers: Dividers,
    spaces: usize,
    outer_padding: usize,
    lines: Vec<Vec<SegmentDescriptor>>,
    arena: AttrArena,
    functions: Vec<Arc<dyn SegmentFunction>>,
    colorscheme: Arc<Colorscheme>,
}

impl Theme {
    pub fn new(config: &ThemeConfig, colorscheme: Arc<Colorscheme>, registry: &SegmentRegistry) -> Result<Self> {
        let mut builder = DescriptorBuilder::new(registry, &config.segment_data);
        let mut build_line = |left: &[Value], right: &[Value]| -> Result<Vec<SegmentDescriptor>> {
            let mut line = Vec::with_capacity(left.len() + right.len());
            for (side, values) in [(Side::Left, left), (Side::Right, right)] {
                for value in values {
                    line.push(builder.build(value, side)?);
                }
            }
            Ok(line)
        };

        let mut lines = vec![build_line(&config.segments.left, &config.segments.right)?];
        // Configured top-most first; stored nearest to the main line first.
        for above in config.segments.above.iter().rev() {
            lines.push(build_line(&above.left, &above.right)?);
        }
        let (arena, functions) = builder.finish();

        Ok(Self {
            dividers: config.dividers.clone(),
            spaces: config.spaces,
            outer_padding: config.outer_padding,
            lines,
            arena,
            functions,
            colorscheme,
        })
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    pub fn colorscheme(&self) -> &Colorscheme {
        &self.colorscheme
    }

    pub fn spaces(&self) -> usize {
        self.spaces
    }

    pub fn outer_padding(&self) -> usize {
        self.outer_padding
    }

    pub fn divider(&self, side: Side, kind: DividerKind) -> &str {
        let pair = match side {
            Side::Left => &self.dividers.left,
            Side::Right => &self.dividers.right,
        };
        match kind {
            DividerKind::Soft => &pair.soft,
            DividerKind::Hard => &pair.hard,
        }
    }

    fn visible(&self, descriptor: &SegmentDescriptor, mode: Option<&str>) -> bool {
        let node = descriptor.node;
        if !self.arena.lookup(node, |c| c.display).unwrap_or(true) {
            return false;
        }
        if let Some(include) = self.arena.lookup(node, |c| c.include_modes.as_ref()) {
            if !mode.is_some_and(|mode| include.iter().any(|m| m == mode)) {
                return false;
            }
        }
        let exclude = self
            .arena
            .lookup(node, |c| (!c.exclude_modes.is_empty()).then_some(&c.exclude_modes));
        !matches!((exclude, mode), (Some(exclude), Some(mode)) if exclude.iter().any(|m| m == mode))
    }

    fn evaluate(&self, descriptor: &SegmentDescriptor, ctx: &SegmentContext<'_>) -> SegmentOutput {
        let (name, func) = match &descriptor.source {
            SegmentSource::Literal(contents) => return SegmentOutput::text(contents.clone()),
            SegmentSource::Function { name, func } => (name, func),
        };
        match catch_unwind(AssertUnwindSafe(|| func.call(ctx, &descriptor.args))) {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                ctx.pl.error(name, format!("Exception while computing segment: {:#}", err));
                SegmentOutput::None
            }
            Err(payload) => {
                ctx.pl.error(name, format!("Segment panicked: {}", panic_message(payload.as_ref())));
                SegmentOutput::None
            }
        }
    }

    /// Evaluate every visible segment of the requested line and side.
    ///
    /// Segment functions run in parallel; output keeps theme order. A
    /// failing function is logged and skipped, an unresolvable highlight
    /// group fails the whole render.
    pub fn get_segments(&self, request: &SegmentRequest<'_>) -> Result<Vec<RenderSegment>> {
        let line = self
            .lines
            .get(request.line)
            .ok_or(PowerlineError::NoSuchLine(request.line))?;
        let ctx = request.context();
        let outputs: Vec<Option<SegmentOutput>> = line
            .par_iter()
            .map(|descriptor| {
                let wanted = request.side.map_or(true, |side| side == descriptor.side);
                (wanted && self.visible(descriptor, request.mode)).then(|| self.evaluate(descriptor, &ctx))
            })
            .collect();

        let scope = OutputScope {
            arena: &self.arena,
            colorscheme: &self.colorscheme,
            mode: request.mode,
            ambiwidth: request.ambiwidth,
        };
        let mut segments = Vec::new();
        for (index, (descriptor, output)) in line.iter().zip(outputs).enumerate() {
            if let Some(output) = output {
                segments.extend(process_output(&scope, index, descriptor, output)?);
            }
        }
        Ok(segments)
    }

    /// Ask the segment's function to shorten it by `amount` columns.
    pub fn truncate(&self, request: &SegmentRequest<'_>, segment: &RenderSegment, amount: usize) -> Option<String> {
        let descriptor = self.lines.get(request.line)?.get(segment.source)?;
        let func = descriptor.function()?;
        let ctx = request.context();
        catch_unwind(AssertUnwindSafe(|| func.truncate(&ctx, amount, &segment.contents, &descriptor.args)))
            .ok()
            .flatten()
    }

    /// Stop background work of every segment this theme created.
    pub fn shutdown(&self) {
        for func in &self.functions {
            func.shutdown();
        }
    }
}
