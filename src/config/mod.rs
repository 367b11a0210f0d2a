pub mod defaults;
pub mod finder;
pub mod loader;
pub mod merge;
pub mod watcher;

pub use defaults::*;
pub use finder::*;
pub use loader::*;
pub use merge::*;
pub use watcher::*;

use crate::error::{PowerlineError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Top-level `config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MainConfig {
    pub common: CommonConfig,
    pub ext: HashMap<String, ExtConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommonConfig {
    pub term_truecolor: bool,
    pub ambiwidth: usize,
    /// Seconds between config loader polls. `None` polls inline on every
    /// render.
    pub interval: Option<f64>,
    pub reload_config: bool,
    pub watcher: String,
    pub log_level: String,
    pub default_top_theme: String,
    pub additional_escapes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtConfig {
    pub colorscheme: String,
    pub theme: String,
    pub top_theme: Option<String>,
}

/// `colors.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ColorsConfig {
    pub colors: HashMap<String, ColorSpec>,
    pub gradients: HashMap<String, GradientSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColorSpec {
    Full(u8, String),
    Cterm(u8),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GradientSpec {
    Full(Vec<u8>, Vec<String>),
    Cterm((Vec<u8>,)),
}

/// Merged colorscheme document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ColorschemeConfig {
    pub name: Option<String>,
    pub groups: HashMap<String, GroupSpec>,
    pub mode_translations: HashMap<String, ModeTranslation>,
}

/// A highlight group is either a set of properties or the name of another
/// group to use instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GroupSpec {
    Redirect(String),
    Props(GroupProps),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupProps {
    pub fg: String,
    pub bg: String,
    #[serde(default, alias = "attr")]
    pub attrs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ModeTranslation {
    pub colors: HashMap<String, String>,
    pub groups: HashMap<String, GroupSpec>,
}

/// Merged theme document (top theme, extension main theme and the named
/// theme).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThemeConfig {
    pub dividers: Dividers,
    pub spaces: usize,
    pub outer_padding: usize,
    pub segments: ThemeSegments,
    /// Per-function defaults keyed by segment name or function name.
    pub segment_data: HashMap<String, Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Dividers {
    pub left: DividerPair,
    pub right: DividerPair,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DividerPair {
    pub hard: String,
    pub soft: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ThemeSegments {
    pub left: Vec<Value>,
    pub right: Vec<Value>,
    /// Stacked lines drawn above the main one, top-most first.
    pub above: Vec<ThemeLine>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ThemeLine {
    pub left: Vec<Value>,
    pub right: Vec<Value>,
}

/// One entry of a theme's `segments.left` / `segments.right` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SegmentConfig {
    pub function: Option<String>,
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub contents: Option<String>,
    pub args: Map<String, Value>,
    pub priority: Option<f64>,
    pub before: Option<String>,
    pub after: Option<String>,
    pub width: Option<WidthSpec>,
    pub align: Option<String>,
    pub highlight_groups: Option<Vec<String>>,
    pub divider_highlight_group: Option<String>,
    pub draw_soft_divider: Option<bool>,
    pub draw_hard_divider: Option<bool>,
    pub draw_inner_divider: Option<bool>,
    pub include_modes: Option<Vec<String>>,
    pub exclude_modes: Vec<String>,
    pub display: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WidthSpec {
    Fixed(usize),
    Auto(String),
}

/// Deserialize a merged document into its typed form.
pub fn from_value<T: DeserializeOwned>(kind: &'static str, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| PowerlineError::invalid(kind, e))
}

impl MainConfig {
    pub fn ext_config(&self, ext: &str) -> ExtConfig {
        self.ext.get(ext).cloned().unwrap_or_default()
    }
}
