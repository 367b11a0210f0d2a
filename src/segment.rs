//! Theme segment descriptors and the records the renderer works on.
//!
//! Descriptor attributes live in an [`AttrArena`]. A descriptor node points
//! at the `segment_data` defaults for its name, which point at the defaults
//! for its function, so unset attributes are found by walking parent
//! indices.

use crate::colorscheme::{Colorscheme, Highlight};
use crate::config::{from_value, merge_maps, SegmentConfig, WidthSpec};
use crate::error::{PowerlineError, Result};
use crate::renderer::width::strwidth;
use crate::segments::{Chunk, SegmentFunction, SegmentOutput, SegmentRegistry};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Left,
    Right,
}

impl std::str::FromStr for Side {
    type Err = PowerlineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "left" => Ok(Self::Left),
            "right" => Ok(Self::Right),
            other => Err(PowerlineError::invalid("side", format!("expected left or right, got {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Align {
    #[default]
    Left,
    Right,
    Center,
}

impl Align {
    fn parse(align: Option<&str>) -> Self {
        match align {
            Some("r") => Self::Right,
            Some("c") => Self::Center,
            _ => Self::Left,
        }
    }

    /// `contents` padded with `amount` spaces on the aligned side.
    pub fn pad(self, contents: &str, amount: usize) -> String {
        let (before, after) = match self {
            Self::Left => (0, amount),
            Self::Right => (amount, 0),
            Self::Center => (amount / 2, amount - amount / 2),
        };
        format!("{}{}{}", " ".repeat(before), contents, " ".repeat(after))
    }
}

struct AttrNode {
    config: SegmentConfig,
    parent: Option<usize>,
}

#[derive(Default)]
pub struct AttrArena {
    nodes: Vec<AttrNode>,
}

impl AttrArena {
    pub fn push(&mut self, config: SegmentConfig, parent: Option<usize>) -> usize {
        self.nodes.push(AttrNode { config, parent });
        self.nodes.len() - 1
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn parent(&self, index: usize) -> Option<usize> {
        self.nodes.get(index).and_then(|node| node.parent)
    }

    /// Nodes from `index` up to the root.
    pub fn chain(&self, index: usize) -> impl Iterator<Item = &SegmentConfig> + '_ {
        std::iter::successors(Some(index), move |&i| self.parent(i))
            .filter_map(move |i| self.nodes.get(i))
            .map(|node| &node.config)
    }

    /// First value `get` finds walking up from `index`.
    pub fn lookup<'a, T>(&'a self, index: usize, get: impl Fn(&'a SegmentConfig) -> Option<T>) -> Option<T> {
        self.chain(index).find_map(get)
    }

    /// Arguments of the whole chain, nearer nodes overriding.
    pub fn merged_args(&self, index: usize) -> Map<String, Value> {
        let chain: Vec<&SegmentConfig> = self.chain(index).collect();
        let mut args = Map::new();
        for config in chain.into_iter().rev() {
            merge_maps(&mut args, &config.args);
        }
        args
    }
}

pub enum SegmentSource {
    Function {
        name: String,
        func: Arc<dyn SegmentFunction>,
    },
    Literal(String),
}

/// One entry of a theme line, ready to be evaluated.
pub struct SegmentDescriptor {
    pub name: String,
    pub side: Side,
    pub node: usize,
    pub source: SegmentSource,
    pub args: Map<String, Value>,
}

impl SegmentDescriptor {
    pub fn function(&self) -> Option<&Arc<dyn SegmentFunction>> {
        match &self.source {
            SegmentSource::Function { func, .. } => Some(func),
            SegmentSource::Literal(_) => None,
        }
    }
}

/// Builds descriptors for one theme. Function instances are shared by
/// every descriptor naming the same function.
pub struct DescriptorBuilder<'a> {
    registry: &'a SegmentRegistry,
    segment_data: &'a HashMap<String, Map<String, Value>>,
    arena: AttrArena,
    data_nodes: HashMap<(String, Option<usize>), Option<usize>>,
    functions: HashMap<String, Arc<dyn SegmentFunction>>,
}

impl<'a> DescriptorBuilder<'a> {
    pub fn new(registry: &'a SegmentRegistry, segment_data: &'a HashMap<String, Map<String, Value>>) -> Self {
        Self {
            registry,
            segment_data,
            arena: AttrArena::default(),
            data_nodes: HashMap::new(),
            functions: HashMap::new(),
        }
    }

    fn data_node(&mut self, key: &str, parent: Option<usize>) -> Result<Option<usize>> {
        if let Some(node) = self.data_nodes.get(&(key.to_string(), parent)) {
            return Ok(*node);
        }
        let node = match self.segment_data.get(key) {
            Some(data) => {
                let config: SegmentConfig = from_value("segment_data", Value::Object(data.clone()))?;
                Some(self.arena.push(config, parent))
            }
            None => parent,
        };
        self.data_nodes.insert((key.to_string(), parent), node);
        Ok(node)
    }

    pub fn build(&mut self, value: &Value, side: Side) -> Result<SegmentDescriptor> {
        let config: SegmentConfig = serde_json::from_value(value.clone()).map_err(|e| PowerlineError::InvalidSegment {
            name: value.get("name").or_else(|| value.get("function")).map(Value::to_string).unwrap_or_default(),
            message: e.to_string(),
        })?;

        let (name, source, parent) = match (config.kind.as_deref(), &config.function) {
            (Some("string"), _) => {
                let contents = config.contents.clone().ok_or_else(|| PowerlineError::InvalidSegment {
                    name: config.name.clone().unwrap_or_else(|| "string".to_string()),
                    message: "string segment without contents".to_string(),
                })?;
                let name = config.name.clone().unwrap_or_else(|| "string".to_string());
                let parent = match &config.name {
                    Some(name) => self.data_node(name, None)?,
                    None => None,
                };
                (name, SegmentSource::Literal(contents), parent)
            }
            (None | Some("function"), Some(function)) => {
                let func = match self.functions.get(function) {
                    Some(func) => func.clone(),
                    None => {
                        let func = self.registry.create(function)?;
                        self.functions.insert(function.clone(), func.clone());
                        func
                    }
                };
                let short = function.rsplit('.').next().unwrap_or(function);
                let name = config.name.clone().unwrap_or_else(|| short.to_string());
                let function_node = self.data_node(function, None)?;
                let parent = self.data_node(&name, function_node)?;
                (
                    name,
                    SegmentSource::Function {
                        name: function.clone(),
                        func,
                    },
                    parent,
                )
            }
            (kind, _) => {
                return Err(PowerlineError::InvalidSegment {
                    name: config.name.clone().unwrap_or_default(),
                    message: match kind {
                        Some(kind) => format!("unknown segment type {}", kind),
                        None => "segment needs a function or type \"string\"".to_string(),
                    },
                })
            }
        };

        let node = self.arena.push(config, parent);
        Ok(SegmentDescriptor {
            name,
            side,
            node,
            source,
            args: self.arena.merged_args(node),
        })
    }

    pub fn finish(self) -> (AttrArena, Vec<Arc<dyn SegmentFunction>>) {
        (self.arena, self.functions.into_values().collect())
    }
}

/// A chunk after styling has been resolved, as the render pipeline sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderSegment {
    /// Index of the descriptor within its theme line.
    pub source: usize,
    pub side: Side,
    pub contents: String,
    pub highlight: Highlight,
    pub divider_highlight: Option<Highlight>,
    pub draw_soft_divider: bool,
    pub draw_hard_divider: bool,
    /// Lower is dropped first; `None` is never dropped.
    pub priority: Option<f64>,
    /// Absorbs leftover width when set.
    pub expand: Option<Align>,
    pub truncatable: bool,
}

/// Settings shared by every chunk of one evaluation.
pub struct OutputScope<'a> {
    pub arena: &'a AttrArena,
    pub colorscheme: &'a Colorscheme,
    pub mode: Option<&'a str>,
    pub ambiwidth: usize,
}

/// Turn one function result into render records.
pub fn process_output(
    scope: &OutputScope<'_>,
    source: usize,
    descriptor: &SegmentDescriptor,
    output: SegmentOutput,
) -> Result<Vec<RenderSegment>> {
    let chunks = match output {
        SegmentOutput::None => return Ok(Vec::new()),
        SegmentOutput::Text(contents) => vec![Chunk::new(contents)],
        SegmentOutput::Chunks(chunks) => chunks,
    };
    let arena = scope.arena;
    let node = descriptor.node;

    let before = arena.lookup(node, |c| c.before.as_deref()).unwrap_or("");
    let after = arena.lookup(node, |c| c.after.as_deref()).unwrap_or("");
    let default_groups: Vec<String> = arena
        .lookup(node, |c| c.highlight_groups.clone())
        .unwrap_or_else(|| vec![descriptor.name.clone()]);
    let default_divider_group = arena.lookup(node, |c| c.divider_highlight_group.as_deref());
    let priority = arena.lookup(node, |c| c.priority);
    let align = Align::parse(arena.lookup(node, |c| c.align.as_deref()));
    let width = arena.lookup(node, |c| c.width.as_ref());
    let soft = arena.lookup(node, |c| c.draw_soft_divider).unwrap_or(true);
    let hard = arena.lookup(node, |c| c.draw_hard_divider).unwrap_or(true);
    let inner = arena.lookup(node, |c| c.draw_inner_divider);
    let truncatable = descriptor.function().is_some_and(|func| func.can_truncate());

    let last = chunks.len().saturating_sub(1);
    let mut records = Vec::with_capacity(chunks.len());
    for (index, chunk) in chunks.into_iter().enumerate() {
        let expand = matches!(width, Some(WidthSpec::Auto(_))).then_some(align);
        if chunk.contents.is_empty() && expand.is_none() {
            continue;
        }
        let mut contents = format!("{}{}{}", before, chunk.contents, after);
        if let Some(WidthSpec::Fixed(width)) = width {
            let current = strwidth(&contents, scope.ambiwidth);
            contents = align.pad(&contents, width.saturating_sub(current));
        }

        let groups = if chunk.highlight_groups.is_empty() {
            &default_groups
        } else {
            &chunk.highlight_groups
        };
        let highlight = scope.colorscheme.get_highlighting(groups, scope.mode, chunk.gradient_level)?;
        let divider_highlight = match chunk.divider_highlight_group.as_deref().or(default_divider_group) {
            Some(group) => Some(scope.colorscheme.get_highlighting(&[group], scope.mode, None)?),
            None => None,
        };

        let mut draw_soft_divider = chunk.draw_soft_divider.unwrap_or(soft);
        if index < last {
            if let Some(inner) = chunk.draw_inner_divider.or(inner) {
                draw_soft_divider = inner;
            }
        }
        records.push(RenderSegment {
            source,
            side: descriptor.side,
            contents,
            highlight,
            divider_highlight,
            draw_soft_divider,
            draw_hard_divider: chunk.draw_hard_divider.unwrap_or(hard),
            priority: chunk.priority.unwrap_or(priority),
            expand,
            truncatable,
        });
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ColorschemeConfig;
    use crate::config::ColorsConfig;
    use serde_json::json;

    fn registry() -> SegmentRegistry {
        let mut registry = SegmentRegistry::new();
        registry.register_fn("test.parts", |_ctx, _args| {
            Ok(SegmentOutput::Chunks(vec![
                Chunk::new("a").with_inner_divider(false),
                Chunk::new(""),
                Chunk::new("b").with_groups(["special"]),
            ]))
        });
        registry
    }

    fn colorscheme() -> Colorscheme {
        let colors: ColorsConfig = from_value(
            "colors",
            json!({"colors": {"red": 1, "blue": 4, "white": 15}}),
        )
        .unwrap();
        let scheme: ColorschemeConfig = from_value(
            "colorscheme",
            json!({"groups": {
                "parts": {"fg": "white", "bg": "blue"},
                "special": {"fg": "red", "bg": "blue", "attrs": ["bold"]},
                "g": {"fg": "red", "bg": "blue"}
            }}),
        )
        .unwrap();
        Colorscheme::new(&scheme, &colors).unwrap()
    }

    #[test]
    fn test_attribute_chain() {
        let registry = registry();
        let data: HashMap<String, Map<String, Value>> = serde_json::from_value(json!({
            "test.parts": {"before": "F ", "args": {"a": 1, "b": 1}, "priority": 5},
            "parts": {"before": "N ", "args": {"b": 2}}
        }))
        .unwrap();
        let mut builder = DescriptorBuilder::new(&registry, &data);
        let desc = builder
            .build(&json!({"function": "test.parts", "args": {"c": 3}}), Side::Left)
            .unwrap();
        let twin = builder.build(&json!({"function": "test.parts"}), Side::Right).unwrap();
        let (arena, functions) = builder.finish();

        assert_eq!(desc.name, "parts");
        assert_eq!(desc.args, json!({"a": 1, "b": 2, "c": 3}).as_object().unwrap().clone());
        assert_eq!(arena.lookup(desc.node, |c| c.before.as_deref()), Some("N "));
        assert_eq!(arena.lookup(desc.node, |c| c.priority), Some(5.0));
        // Both descriptors share the data nodes and one function instance.
        assert_eq!(arena.parent(desc.node), arena.parent(twin.node));
        assert_eq!(arena.len(), 4);
        assert_eq!(functions.len(), 1);
    }

    #[test]
    fn test_descriptor_errors() {
        let registry = registry();
        let data = HashMap::new();
        let mut builder = DescriptorBuilder::new(&registry, &data);
        assert!(matches!(
            builder.build(&json!({"function": "nope.missing"}), Side::Left),
            Err(PowerlineError::UnknownSegment(_))
        ));
        assert!(matches!(
            builder.build(&json!({"type": "string"}), Side::Left),
            Err(PowerlineError::InvalidSegment { .. })
        ));
        assert!(matches!(
            builder.build(&json!({"args": {}}), Side::Left),
            Err(PowerlineError::InvalidSegment { .. })
        ));
    }

    #[test]
    fn test_process_chunks() {
        let registry = registry();
        let data = HashMap::new();
        let mut builder = DescriptorBuilder::new(&registry, &data);
        let desc = builder
            .build(&json!({"function": "test.parts", "before": "<", "width": 4, "align": "r"}), Side::Left)
            .unwrap();
        let (arena, _) = builder.finish();
        let scheme = colorscheme();
        let scope = OutputScope {
            arena: &arena,
            colorscheme: &scheme,
            mode: None,
            ambiwidth: 1,
        };
        let output = registry
            .create("test.parts")
            .unwrap()
            .call(
                &crate::segments::SegmentContext {
                    pl: &crate::utils::PowerlineLogger::new("test"),
                    info: &Default::default(),
                    run_once: true,
                },
                &desc.args,
            )
            .unwrap();
        let records = process_output(&scope, 0, &desc, output).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].contents, "  <a");
        assert!(!records[0].draw_soft_divider);
        assert!(records[1].draw_soft_divider);
        assert_eq!(records[1].highlight.attrs, crate::colorscheme::Attrs::BOLD);
        assert_eq!(records[0].priority, None);
    }

    #[test]
    fn test_highlight_group_fallback() {
        let registry = SegmentRegistry::new();
        let data = HashMap::new();
        let mut builder = DescriptorBuilder::new(&registry, &data);
        let desc = builder
            .build(
                &json!({"type": "string", "contents": "x", "highlight_groups": ["missing", "g"]}),
                Side::Left,
            )
            .unwrap();
        let (arena, _) = builder.finish();
        let scheme = colorscheme();
        let scope = OutputScope {
            arena: &arena,
            colorscheme: &scheme,
            mode: None,
            ambiwidth: 1,
        };
        let records = process_output(&scope, 0, &desc, SegmentOutput::text("x")).unwrap();
        assert_eq!(records[0].highlight.fg.map(|c| c.cterm), Some(1));
        assert_eq!(records[0].highlight.bg.map(|c| c.cterm), Some(4));

        let missing = SegmentDescriptor {
            name: "nothing".to_string(),
            side: Side::Left,
            node: desc.node,
            source: SegmentSource::Literal(String::new()),
            args: Map::new(),
        };
        let scope_missing = OutputScope {
            arena: &AttrArena::default(),
            ..scope
        };
        assert!(matches!(
            process_output(&scope_missing, 0, &missing, SegmentOutput::text("x")),
            Err(PowerlineError::HighlightGroupNotFound(_))
        ));
    }
}
