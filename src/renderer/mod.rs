pub mod style;
pub mod width;

pub use style::*;

use crate::error::Result;
use crate::segment::{RenderSegment, Side};
use crate::segments::SegmentInfo;
use crate::theme::{DividerKind, SegmentRequest, Theme};
use crate::utils::PowerlineLogger;

/// Above this many segments the first drop pass removes segments using
/// their last measured widths instead of re-measuring the line each time.
pub const APPROXIMATE_DROP_THRESHOLD: usize = 100;

#[derive(Debug, Clone, Copy)]
pub struct RenderRequest<'a> {
    pub mode: Option<&'a str>,
    pub width: Option<usize>,
    pub side: Option<Side>,
    pub line: usize,
    pub segment_info: &'a SegmentInfo,
    /// Also return the line without escape sequences.
    pub output_raw: bool,
    /// Also return the printable width.
    pub output_width: bool,
}

impl<'a> RenderRequest<'a> {
    pub fn new(segment_info: &'a SegmentInfo) -> Self {
        Self {
            mode: None,
            width: None,
            side: None,
            line: 0,
            segment_info,
            output_raw: false,
            output_width: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderOutput {
    pub text: String,
    pub raw: Option<String>,
    pub width: Option<usize>,
}

struct Drawn {
    raw: String,
    highlighted: String,
}

/// Draws lines of one theme for one output target.
pub struct Renderer {
    theme: Theme,
    style: Style,
    pl: PowerlineLogger,
    run_once: bool,
}

impl Renderer {
    pub fn new(theme: Theme, style: Style, pl: PowerlineLogger, run_once: bool) -> Self {
        Self {
            theme,
            style,
            pl,
            run_once,
        }
    }

    pub fn theme(&self) -> &Theme {
        &self.theme
    }

    pub fn style(&self) -> &Style {
        &self.style
    }

    pub fn render(&self, request: &RenderRequest<'_>) -> Result<RenderOutput> {
        let seg_request = SegmentRequest {
            pl: &self.pl,
            info: request.segment_info,
            mode: request.mode,
            side: request.side,
            line: request.line,
            run_once: self.run_once,
            ambiwidth: self.style.ambiwidth,
        };
        let mut segments = self.theme.get_segments(&seg_request)?;

        let Some(width) = request.width else {
            let alive: Vec<&RenderSegment> = segments.iter().collect();
            let current = request.output_width.then(|| self.measure(&alive));
            return Ok(self.finish(&alive, request, current));
        };

        let mut current = self.measure(&segments.iter().collect::<Vec<_>>());
        if current > width {
            current = self.truncate(&seg_request, &mut segments, width, current);
        }

        let mut alive = vec![true; segments.len()];
        if current > width {
            current = self.drop_segments(&segments, &mut alive, width, current);
        }

        let spacers: Vec<usize> = (0..segments.len())
            .filter(|&i| alive[i] && segments[i].expand.is_some())
            .collect();
        if !spacers.is_empty() && width > current {
            let slack = width - current;
            let (each, mut remainder) = (slack / spacers.len(), slack % spacers.len());
            for i in spacers {
                let extra = each + usize::from(remainder > 0);
                remainder = remainder.saturating_sub(1);
                let segment = &mut segments[i];
                if let Some(align) = segment.expand {
                    segment.contents = align.pad(&segment.contents, extra);
                }
            }
            current = width;
        }

        let kept: Vec<&RenderSegment> = segments
            .iter()
            .zip(&alive)
            .filter_map(|(segment, alive)| alive.then_some(segment))
            .collect();
        Ok(self.finish(&kept, request, Some(current)))
    }

    /// Every stacked line above the main one, top-most first.
    pub fn render_above_lines(&self, request: &RenderRequest<'_>) -> Result<Vec<RenderOutput>> {
        (1..self.theme.line_count())
            .rev()
            .map(|line| self.render(&RenderRequest { line, ..*request }))
            .collect()
    }

    pub fn shutdown(&self) {
        self.theme.shutdown();
    }

    /// Give truncatable segments, cheapest to lose first, a chance to
    /// shorten themselves. Segments left empty are removed.
    fn truncate(
        &self,
        request: &SegmentRequest<'_>,
        segments: &mut Vec<RenderSegment>,
        width: usize,
        mut current: usize,
    ) -> usize {
        for index in drop_order(segments, true) {
            if current <= width {
                break;
            }
            if !segments[index].truncatable {
                continue;
            }
            if let Some(contents) = self.theme.truncate(request, &segments[index], current - width) {
                segments[index].contents = contents;
                let remaining: Vec<&RenderSegment> = segments.iter().filter(|s| !is_emptied(s)).collect();
                current = self.measure(&remaining);
            }
        }
        segments.retain(|segment| !is_emptied(segment));
        current
    }

    /// Drop prioritized segments, lowest priority first, until the line
    /// fits or nothing droppable remains.
    fn drop_segments(&self, segments: &[RenderSegment], alive: &mut [bool], width: usize, mut current: usize) -> usize {
        let mut candidates = drop_order(segments, false).into_iter();

        if segments.len() > APPROXIMATE_DROP_THRESHOLD {
            let kept: Vec<&RenderSegment> = segments.iter().collect();
            let lens: Vec<usize> = self
                .draw(&kept, false)
                .iter()
                .map(|drawn| self.style.strwidth(&drawn.raw))
                .collect();
            let mut overflow = current - width;
            for index in candidates.by_ref() {
                alive[index] = false;
                overflow = overflow.saturating_sub(lens[index]);
                if overflow == 0 {
                    break;
                }
            }
            current = self.measure(&living(segments, alive));
        }

        for index in candidates {
            if current <= width {
                break;
            }
            alive[index] = false;
            current = self.measure(&living(segments, alive));
        }
        current
    }

    fn measure(&self, segments: &[&RenderSegment]) -> usize {
        self.draw(segments, false)
            .iter()
            .map(|drawn| self.style.strwidth(&drawn.raw))
            .sum()
    }

    fn finish(&self, segments: &[&RenderSegment], request: &RenderRequest<'_>, current: Option<usize>) -> RenderOutput {
        let drawn = self.draw(segments, true);
        let mut text: String = drawn.iter().map(|d| d.highlighted.as_str()).collect();
        text.push_str(&self.style.reset());
        RenderOutput {
            text,
            raw: request
                .output_raw
                .then(|| drawn.iter().map(|d| d.raw.as_str()).collect()),
            width: if request.output_width { current } else { None },
        }
    }

    fn draw(&self, segments: &[&RenderSegment], highlighted: bool) -> Vec<Drawn> {
        (0..segments.len())
            .map(|index| self.draw_one(segments, index, highlighted))
            .collect()
    }

    fn draw_one(&self, segments: &[&RenderSegment], index: usize, highlighted: bool) -> Drawn {
        let segment = segments[index];
        let side = segment.side;
        let neighbour = match side {
            Side::Left => segments.get(index + 1),
            Side::Right => index.checked_sub(1).and_then(|i| segments.get(i)),
        };
        // Across a side boundary the divider meets an empty background.
        let compare_bg = neighbour.filter(|n| n.side == side).and_then(|n| n.highlight.bg);
        let kind = if compare_bg == segment.highlight.bg {
            DividerKind::Soft
        } else {
            DividerKind::Hard
        };
        let draw_divider = match kind {
            DividerKind::Soft => segment.draw_soft_divider,
            DividerKind::Hard => segment.draw_hard_divider,
        };

        let outer = match side {
            Side::Left if index == 0 => self.theme.outer_padding(),
            Side::Right if index + 1 == segments.len() => self.theme.outer_padding(),
            _ => 0,
        };
        let padding = " ".repeat(outer);
        let spaces = if draw_divider {
            " ".repeat(self.theme.spaces())
        } else {
            String::new()
        };
        let contents = match side {
            Side::Left => format!("{}{}{}{}", padding, spaces, segment.contents, spaces),
            Side::Right => format!("{}{}{}{}", spaces, segment.contents, spaces, padding),
        };
        let divider = if draw_divider { self.theme.divider(side, kind) } else { "" };

        let raw = match side {
            Side::Left => format!("{}{}", contents, divider),
            Side::Right => format!("{}{}", divider, contents),
        };
        if !highlighted {
            return Drawn {
                raw,
                highlighted: String::new(),
            };
        }

        let contents_hl = self.style.hl(&contents, segment.highlight);
        let divider_hl = if draw_divider {
            let divider_style = match kind {
                DividerKind::Soft => segment.divider_highlight.unwrap_or(segment.highlight),
                DividerKind::Hard => crate::colorscheme::Highlight {
                    fg: segment.highlight.bg,
                    bg: compare_bg,
                    attrs: Default::default(),
                },
            };
            self.style.hl(divider, divider_style)
        } else {
            String::new()
        };
        let highlighted = match side {
            Side::Left => contents_hl + &divider_hl,
            Side::Right => divider_hl + &contents_hl,
        };
        Drawn { raw, highlighted }
    }
}

fn is_emptied(segment: &RenderSegment) -> bool {
    segment.contents.is_empty() && segment.expand.is_none()
}

fn living<'a>(segments: &'a [RenderSegment], alive: &[bool]) -> Vec<&'a RenderSegment> {
    segments
        .iter()
        .zip(alive)
        .filter_map(|(segment, alive)| alive.then_some(segment))
        .collect()
}

/// Indices in the order segments are given up: ascending priority, ties in
/// line order. Undroppable segments come last when `with_undroppable`.
fn drop_order(segments: &[RenderSegment], with_undroppable: bool) -> Vec<usize> {
    let mut prioritized: Vec<usize> = (0..segments.len())
        .filter(|&i| segments[i].priority.is_some())
        .collect();
    prioritized.sort_by(|&a, &b| {
        let (a, b) = (segments[a].priority, segments[b].priority);
        a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal)
    });
    if with_undroppable {
        prioritized.extend((0..segments.len()).filter(|&i| segments[i].priority.is_none()));
    }
    prioritized
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::colorscheme::Colorscheme;
    use crate::config::{from_value, ColorsConfig, ColorschemeConfig, ThemeConfig};
    use crate::segments::{Chunk, SegmentOutput, SegmentRegistry};
    use serde_json::{json, Value};
    use std::sync::Arc;

    fn renderer(segments: Value, kind: RendererKind) -> Renderer {
        let mut registry = SegmentRegistry::with_builtins();
        registry.register_fn("test.parts", |_ctx, _args| {
            Ok(SegmentOutput::Chunks(vec![
                Chunk::new("one").with_groups(["a"]),
                Chunk::new("two").with_groups(["b"]),
            ]))
        });
        registry.register_fn("test.ranked", |_ctx, _args| {
            Ok(SegmentOutput::Chunks(vec![
                Chunk::new("head").with_groups(["a"]),
                Chunk::new("tail").with_groups(["a"]).with_priority(Some(1.0)),
            ]))
        });
        let colors: ColorsConfig =
            from_value("colors", json!({"colors": {"black": 16, "white": 231, "red": 196}})).unwrap();
        let scheme: ColorschemeConfig = from_value(
            "colorscheme",
            json!({"groups": {
                "a": {"fg": "white", "bg": "black"},
                "b": {"fg": "black", "bg": "white"},
                "c": {"fg": "red", "bg": "black"},
                "cwd": "a",
                "cwd:divider": "a",
                "string": "a"
            }}),
        )
        .unwrap();
        let colorscheme = Arc::new(Colorscheme::new(&scheme, &colors).unwrap());
        let theme: ThemeConfig = from_value(
            "theme",
            json!({
                "dividers": {"left": {"hard": ">", "soft": "|"}, "right": {"hard": "<", "soft": "!"}},
                "spaces": 0,
                "outer_padding": 0,
                "segments": segments
            }),
        )
        .unwrap();
        let theme = Theme::new(&theme, colorscheme, &registry).unwrap();
        Renderer::new(theme, Style::new(kind, false, None, 1), PowerlineLogger::new("test"), true)
    }

    fn raw(renderer: &Renderer, width: Option<usize>) -> (String, usize) {
        let info = SegmentInfo::default();
        let out = renderer
            .render(&RenderRequest {
                width,
                output_raw: true,
                output_width: true,
                ..RenderRequest::new(&info)
            })
            .unwrap();
        (out.raw.unwrap(), out.width.unwrap())
    }

    fn string(contents: &str, group: &str, priority: Option<f64>) -> Value {
        json!({"type": "string", "contents": contents, "highlight_groups": [group], "priority": priority})
    }

    #[test]
    fn test_soft_and_hard_dividers() {
        let renderer = renderer(
            json!({"left": [string("A", "a", None), string("B", "c", None), string("C", "b", None)]}),
            RendererKind::Plain,
        );
        // a and c share a background, b differs, the end meets no background.
        assert_eq!(raw(&renderer, None), ("A|B>C>".to_string(), 6));
    }

    #[test]
    fn test_right_side_mirrors() {
        let renderer = renderer(
            json!({"left": [string("L", "a", None)], "right": [string("R", "a", None), string("S", "a", None)]}),
            RendererKind::Plain,
        );
        assert_eq!(raw(&renderer, None).0, "L><R!S");
    }

    #[test]
    fn test_lowest_priority_dropped_first() {
        let renderer = renderer(
            json!({"left": [
                string("AAAAA", "a", None),
                string("BBBBB", "a", Some(10.0)),
                string("CCCCC", "a", Some(5.0))
            ]}),
            RendererKind::Plain,
        );
        assert_eq!(raw(&renderer, None), ("AAAAA|BBBBB|CCCCC>".to_string(), 18));
        assert_eq!(raw(&renderer, Some(12)), ("AAAAA|BBBBB>".to_string(), 12));
        assert_eq!(raw(&renderer, Some(7)), ("AAAAA>".to_string(), 6));
        // Undroppable segments stay even when the line cannot fit.
        assert_eq!(raw(&renderer, Some(2)), ("AAAAA>".to_string(), 6));
    }

    #[test]
    fn test_chunk_priority_drops_it_before_siblings() {
        let renderer = renderer(
            json!({"left": [{"function": "test.ranked", "priority": 5}, string("K", "a", None)]}),
            RendererKind::Plain,
        );
        assert_eq!(raw(&renderer, None), ("head|tail|K>".to_string(), 12));
        assert_eq!(raw(&renderer, Some(10)), ("head|K>".to_string(), 7));
        assert_eq!(raw(&renderer, Some(3)), ("K>".to_string(), 2));
    }

    #[test]
    fn test_equal_priorities_drop_left_to_right() {
        let renderer = renderer(
            json!({"left": [string("X", "a", Some(1.0)), string("Y", "a", Some(1.0)), string("Z", "a", None)]}),
            RendererKind::Plain,
        );
        assert_eq!(raw(&renderer, Some(4)).0, "Y|Z>");
    }

    #[test]
    fn test_expand_distributes_remainder_first() {
        let renderer = renderer(
            json!({"left": [
                {"type": "string", "contents": "x", "highlight_groups": ["a"], "width": "auto"},
                string("m", "a", None),
                {"type": "string", "contents": "y", "highlight_groups": ["a"], "width": "auto", "align": "r"}
            ]}),
            RendererKind::Plain,
        );
        // Natural width 6, slack 5 split 3 + 2.
        assert_eq!(raw(&renderer, Some(11)), ("x   |m|  y>".to_string(), 11));
    }

    #[test]
    fn test_truncation_before_dropping() {
        let renderer = renderer(
            json!({"left": [
                {"function": "env.cwd", "highlight_groups": ["a"], "priority": 1},
                string("keep", "a", None)
            ]}),
            RendererKind::Plain,
        );
        let mut info = SegmentInfo::default();
        info.cwd = Some("/srv/projects".into());
        let out = renderer
            .render(&RenderRequest {
                width: Some(14),
                output_raw: true,
                output_width: true,
                ..RenderRequest::new(&info)
            })
            .unwrap();
        // "/|srv|projects|keep>" is 20 wide; leading components give way.
        assert_eq!(out.raw.as_deref(), Some("projects|keep>"));
        assert_eq!(out.width, Some(14));
    }

    #[test]
    fn test_multi_chunk_function_and_styles() {
        let renderer = renderer(json!({"left": [{"function": "test.parts"}]}), RendererKind::Ansi);
        let info = SegmentInfo::default();
        let out = renderer.render(&RenderRequest::new(&info)).unwrap();
        assert_eq!(
            out.text,
            concat!(
                "\x1b[0;38;5;231;48;5;16mone",
                "\x1b[0;38;5;16;48;5;231m>",
                "\x1b[0;38;5;16;48;5;231mtwo",
                "\x1b[0;38;5;231;49m>",
                "\x1b[0m"
            )
        );
        assert_eq!(out.raw, None);
        assert_eq!(out.width, None);
    }

    #[test]
    fn test_approximate_drop_keeps_width_bound() {
        let many: Vec<Value> = (0..150)
            .map(|i| string("seg", "a", Some(i as f64)))
            .chain(std::iter::once(string("end", "a", None)))
            .collect();
        let renderer = renderer(json!({ "left": many }), RendererKind::Plain);
        let (line, width) = raw(&renderer, Some(40));
        assert!(width <= 40);
        assert!(line.ends_with("end>"));
    }

    #[test]
    fn test_above_lines_top_first() {
        let renderer = renderer(
            json!({
                "left": [string("main", "a", None)],
                "above": [
                    {"left": [string("top", "a", None)]},
                    {"left": [string("near", "a", None)]}
                ]
            }),
            RendererKind::Plain,
        );
        let info = SegmentInfo::default();
        let lines: Vec<String> = renderer
            .render_above_lines(&RenderRequest {
                output_raw: true,
                ..RenderRequest::new(&info)
            })
            .unwrap()
            .into_iter()
            .filter_map(|out| out.raw)
            .collect();
        assert_eq!(lines, vec!["top>", "near>"]);
    }
}
