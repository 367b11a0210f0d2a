use crate::config::{ColorSpec, ColorsConfig, ColorschemeConfig, GradientSpec, GroupSpec, ModeTranslation};
use crate::error::{PowerlineError, Result};
use std::collections::HashMap;

/// A terminal color: 256-color index plus 24-bit value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Color {
    pub cterm: u8,
    pub hex: u32,
}

const STANDARD_COLORS: [u32; 16] = [
    0x000000, 0x800000, 0x008000, 0x808000, 0x000080, 0x800080, 0x008080, 0xc0c0c0,
    0x808080, 0xff0000, 0x00ff00, 0xffff00, 0x0000ff, 0xff00ff, 0x00ffff, 0xffffff,
];

const CUBE_LEVELS: [u32; 6] = [0x00, 0x5f, 0x87, 0xaf, 0xd7, 0xff];

/// 24-bit value of an xterm 256-color index.
pub fn cterm_to_hex(cterm: u8) -> u32 {
    match cterm {
        0..=15 => STANDARD_COLORS[cterm as usize],
        16..=231 => {
            let i = (cterm - 16) as usize;
            (CUBE_LEVELS[i / 36] << 16) | (CUBE_LEVELS[(i / 6) % 6] << 8) | CUBE_LEVELS[i % 6]
        }
        232..=255 => {
            let level = 8 + 10 * (cterm as u32 - 232);
            (level << 16) | (level << 8) | level
        }
    }
}

impl Color {
    pub fn from_cterm(cterm: u8) -> Self {
        Self {
            cterm,
            hex: cterm_to_hex(cterm),
        }
    }

    fn from_spec(cterm: u8, hex: Option<&str>) -> Result<Self> {
        match hex {
            None => Ok(Self::from_cterm(cterm)),
            Some(hex) => u32::from_str_radix(hex.trim_start_matches('#'), 16)
                .map(|hex| Self { cterm, hex })
                .map_err(|e| PowerlineError::invalid("colors", format!("bad hex color {}: {}", hex, e))),
        }
    }

    pub fn rgb(&self) -> (u8, u8, u8) {
        ((self.hex >> 16) as u8, (self.hex >> 8) as u8, self.hex as u8)
    }
}

/// Text attribute bit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Attrs(u8);

impl Attrs {
    pub const NONE: Attrs = Attrs(0);
    pub const BOLD: Attrs = Attrs(1);
    pub const ITALIC: Attrs = Attrs(2);
    pub const UNDERLINE: Attrs = Attrs(4);

    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Self {
        names.iter().fold(Self::NONE, |acc, name| match name.as_ref() {
            "bold" => acc | Self::BOLD,
            "italic" => acc | Self::ITALIC,
            "underline" => acc | Self::UNDERLINE,
            _ => acc,
        })
    }

    pub fn contains(self, other: Attrs) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for Attrs {
    type Output = Attrs;

    fn bitor(self, rhs: Attrs) -> Attrs {
        Attrs(self.0 | rhs.0)
    }
}

/// Resolved style of one chunk. `None` colors mean "terminal default".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Highlight {
    pub fg: Option<Color>,
    pub bg: Option<Color>,
    pub attrs: Attrs,
}

/// Color names of a resolved group plus its attributes, before colors are
/// looked up.
struct GroupProps {
    fg: String,
    bg: String,
    attrs: Attrs,
}

/// Redirect chains longer than this are treated as cycles.
const MAX_REDIRECTS: usize = 32;

#[derive(Debug, Clone)]
pub struct Colorscheme {
    name: Option<String>,
    colors: HashMap<String, Color>,
    gradients: HashMap<String, Vec<Color>>,
    groups: HashMap<String, GroupSpec>,
    translations: HashMap<String, ModeTranslation>,
}

impl Colorscheme {
    pub fn new(scheme: &ColorschemeConfig, colors: &ColorsConfig) -> Result<Self> {
        let mut table = HashMap::with_capacity(colors.colors.len());
        for (name, spec) in &colors.colors {
            let color = match spec {
                ColorSpec::Cterm(cterm) => Color::from_cterm(*cterm),
                ColorSpec::Full(cterm, hex) => Color::from_spec(*cterm, Some(hex))?,
            };
            table.insert(name.clone(), color);
        }

        let mut gradients = HashMap::with_capacity(colors.gradients.len());
        for (name, spec) in &colors.gradients {
            let gradient = match spec {
                GradientSpec::Cterm((cterms,)) => cterms.iter().map(|c| Color::from_cterm(*c)).collect(),
                GradientSpec::Full(cterms, hexes) => {
                    if cterms.len() != hexes.len() {
                        return Err(PowerlineError::invalid(
                            "colors",
                            format!("gradient {} has mismatched cterm and hex lists", name),
                        ));
                    }
                    cterms
                        .iter()
                        .zip(hexes)
                        .map(|(cterm, hex)| Color::from_spec(*cterm, Some(hex)))
                        .collect::<Result<Vec<_>>>()?
                }
            };
            if gradient.is_empty() {
                return Err(PowerlineError::invalid("colors", format!("gradient {} is empty", name)));
            }
            gradients.insert(name.clone(), gradient);
        }

        Ok(Self {
            name: scheme.name.clone(),
            colors: table,
            gradients,
            groups: scheme.groups.clone(),
            translations: scheme.mode_translations.clone(),
        })
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Style for the first group in `groups` that resolves.
    ///
    /// Mode translations are consulted before base groups. Groups replaced by
    /// a mode translation keep their colors as written; base groups get the
    /// mode's color translations applied.
    pub fn get_highlighting<S: AsRef<str>>(
        &self,
        groups: &[S],
        mode: Option<&str>,
        gradient_level: Option<f64>,
    ) -> Result<Highlight> {
        let trans = mode.and_then(|mode| self.translations.get(mode));
        let mut props = None;
        for group in groups {
            if let Some(found) = self.group_props(trans, group.as_ref())? {
                props = Some(found);
                break;
            }
        }
        let Some(props) = props else {
            return Err(PowerlineError::HighlightGroupNotFound(
                groups.iter().map(AsRef::as_ref).collect::<Vec<_>>().join(", "),
            ));
        };
        Ok(Highlight {
            fg: Some(self.pick_color(&props.fg, gradient_level)?),
            bg: Some(self.pick_color(&props.bg, gradient_level)?),
            attrs: props.attrs,
        })
    }

    fn group_props(&self, trans: Option<&ModeTranslation>, group: &str) -> Result<Option<GroupProps>> {
        let mut name = group.to_string();
        for _ in 0..MAX_REDIRECTS {
            let (spec, translate_colors) = match trans.and_then(|t| t.groups.get(&name)) {
                Some(spec) => (spec, false),
                None => match self.groups.get(&name) {
                    Some(spec) => (spec, true),
                    None => return Ok(None),
                },
            };
            match spec {
                GroupSpec::Redirect(target) => name = target.clone(),
                GroupSpec::Props(props) => {
                    let translate = |color: &String| -> String {
                        if !translate_colors {
                            return color.clone();
                        }
                        trans
                            .and_then(|t| t.colors.get(color))
                            .cloned()
                            .unwrap_or_else(|| color.clone())
                    };
                    return Ok(Some(GroupProps {
                        fg: translate(&props.fg),
                        bg: translate(&props.bg),
                        attrs: Attrs::from_names(&props.attrs),
                    }));
                }
            }
        }
        Err(PowerlineError::invalid(
            "colorscheme",
            format!("highlight group {} redirects in a cycle", group),
        ))
    }

    fn pick_color(&self, name: &str, gradient_level: Option<f64>) -> Result<Color> {
        if let Some(level) = gradient_level {
            if let Some(gradient) = self.gradients.get(name) {
                return Ok(gradient[gradient_index(gradient.len(), level)]);
            }
        }
        self.colors
            .get(name)
            .copied()
            .ok_or_else(|| PowerlineError::ColorNotFound(name.to_string()))
    }
}

fn gradient_index(len: usize, level: f64) -> usize {
    let level = level.clamp(0.0, 100.0);
    let index = (level * (len - 1) as f64 / 100.0).round() as usize;
    index.min(len - 1)
}
