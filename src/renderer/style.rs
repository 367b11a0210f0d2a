use crate::colorscheme::{Attrs, Color, Highlight};
use crate::error::{PowerlineError, Result};
use std::str::FromStr;

/// Encodes a style switch for one output target.
pub trait StyleEncoder: Send + Sync {
    /// Prefix switching the output to `fg`/`bg`/`attrs`. `None` colors are
    /// the terminal defaults.
    fn style_run(&self, fg: Option<Color>, bg: Option<Color>, attrs: Attrs) -> String;

    /// Suffix restoring the default style at the end of a line.
    fn reset(&self) -> String;
}

/// ANSI SGR sequences, 256-color or 24-bit.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnsiStyle {
    pub truecolor: bool,
}

impl AnsiStyle {
    fn color_codes(&self, codes: &mut Vec<String>, color: Option<Color>, base: u8) {
        match color {
            None => codes.push((base + 9).to_string()),
            Some(color) if self.truecolor => {
                let (r, g, b) = color.rgb();
                codes.push(format!("{};2;{};{};{}", base + 8, r, g, b));
            }
            Some(color) => codes.push(format!("{};5;{}", base + 8, color.cterm)),
        }
    }
}

impl StyleEncoder for AnsiStyle {
    fn style_run(&self, fg: Option<Color>, bg: Option<Color>, attrs: Attrs) -> String {
        let mut codes = vec!["0".to_string()];
        self.color_codes(&mut codes, fg, 30);
        self.color_codes(&mut codes, bg, 40);
        for (attr, code) in [(Attrs::BOLD, "1"), (Attrs::ITALIC, "3"), (Attrs::UNDERLINE, "4")] {
            if attrs.contains(attr) {
                codes.push(code.to_string());
            }
        }
        format!("\x1b[{}m", codes.join(";"))
    }

    fn reset(&self) -> String {
        "\x1b[0m".to_string()
    }
}

/// tmux `#[fg=…,bg=…]` style runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct TmuxStyle {
    pub truecolor: bool,
}

impl TmuxStyle {
    fn color(&self, color: Option<Color>) -> String {
        match color {
            None => "default".to_string(),
            Some(color) if self.truecolor => format!("#{:06x}", color.hex),
            Some(color) => format!("colour{}", color.cterm),
        }
    }
}

impl StyleEncoder for TmuxStyle {
    fn style_run(&self, fg: Option<Color>, bg: Option<Color>, attrs: Attrs) -> String {
        let flag = |attr, on: &str, off: &str| {
            if attrs.contains(attr) { on.to_string() } else { off.to_string() }
        };
        let parts = [
            format!("fg={}", self.color(fg)),
            format!("bg={}", self.color(bg)),
            flag(Attrs::BOLD, "bold", "nobold"),
            flag(Attrs::ITALIC, "italics", "noitalics"),
            flag(Attrs::UNDERLINE, "underscore", "nounderscore"),
        ];
        format!("#[{}]", parts.join(","))
    }

    fn reset(&self) -> String {
        String::new()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PlainStyle;

impl StyleEncoder for PlainStyle {
    fn style_run(&self, _fg: Option<Color>, _bg: Option<Color>, _attrs: Attrs) -> String {
        String::new()
    }

    fn reset(&self) -> String {
        String::new()
    }
}

/// How escape sequences are wrapped so the consumer does not count them as
/// printable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EscapePolicy {
    pub start: &'static str,
    pub end: &'static str,
    /// Multiplexer passthrough around every sequence.
    pub passthrough: Option<Passthrough>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Passthrough {
    Tmux,
    Screen,
}

impl EscapePolicy {
    pub fn wrap(&self, sequence: String) -> String {
        if sequence.is_empty() {
            return sequence;
        }
        let sequence = match self.passthrough {
            Some(Passthrough::Tmux) => format!("\x1bPtmux;{}\x1b\\", sequence.replace('\x1b', "\x1b\x1b")),
            Some(Passthrough::Screen) => format!("\x1bP{}\x1b\\", sequence),
            None => sequence,
        };
        format!("{}{}{}", self.start, sequence, self.end)
    }
}

/// Characters rewritten in contents so the consumer prints them literally.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Translations {
    table: Vec<(char, &'static str)>,
}

impl Translations {
    pub fn new(table: &[(char, &'static str)]) -> Self {
        Self { table: table.to_vec() }
    }

    pub fn apply(&self, s: &str) -> String {
        if self.table.is_empty() {
            return s.to_string();
        }
        let mut out = String::with_capacity(s.len());
        for c in s.chars() {
            match self.table.iter().find(|(from, _)| *from == c) {
                Some((_, to)) => out.push_str(to),
                None => out.push(c),
            }
        }
        out
    }
}

/// Output targets a renderer can be built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendererKind {
    Ansi,
    Bash,
    Zsh,
    Tmux,
    Plain,
}

impl FromStr for RendererKind {
    type Err = PowerlineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ansi" | "shell" => Ok(Self::Ansi),
            "bash" => Ok(Self::Bash),
            "zsh" => Ok(Self::Zsh),
            "tmux" => Ok(Self::Tmux),
            "plain" => Ok(Self::Plain),
            other => Err(PowerlineError::UnknownRenderer(other.to_string())),
        }
    }
}

/// Everything output-target specific about rendering.
pub struct Style {
    pub kind: RendererKind,
    pub encoder: Box<dyn StyleEncoder>,
    pub escape: EscapePolicy,
    pub translations: Translations,
    pub ambiwidth: usize,
}

impl Style {
    pub fn new(kind: RendererKind, truecolor: bool, additional_escapes: Option<&str>, ambiwidth: usize) -> Self {
        let passthrough = match additional_escapes {
            Some("tmux") => Some(Passthrough::Tmux),
            Some("screen") => Some(Passthrough::Screen),
            _ => None,
        };
        let (encoder, start, end, translations): (Box<dyn StyleEncoder>, _, _, _) = match kind {
            RendererKind::Ansi => (Box::new(AnsiStyle { truecolor }), "", "", Translations::default()),
            RendererKind::Bash => (
                Box::new(AnsiStyle { truecolor }),
                "\\[",
                "\\]",
                Translations::new(&[('$', "\\$"), ('`', "\\`"), ('\\', "\\\\")]),
            ),
            RendererKind::Zsh => (
                Box::new(AnsiStyle { truecolor }),
                "%{",
                "%}",
                Translations::new(&[('%', "%%")]),
            ),
            RendererKind::Tmux => (Box::new(TmuxStyle { truecolor }), "", "", Translations::new(&[('#', "##[]")])),
            RendererKind::Plain => (Box::new(PlainStyle), "", "", Translations::default()),
        };
        let passthrough = match kind {
            RendererKind::Tmux | RendererKind::Plain => None,
            _ => passthrough,
        };
        Self {
            kind,
            encoder,
            escape: EscapePolicy { start, end, passthrough },
            translations,
            ambiwidth: ambiwidth.max(1),
        }
    }

    /// `text` drawn in `highlight`.
    pub fn hl(&self, text: &str, highlight: Highlight) -> String {
        let prefix = self.escape.wrap(self.encoder.style_run(highlight.fg, highlight.bg, highlight.attrs));
        format!("{}{}", prefix, self.translations.apply(text))
    }

    pub fn reset(&self) -> String {
        self.escape.wrap(self.encoder.reset())
    }

    pub fn strwidth(&self, s: &str) -> usize {
        super::width::strwidth(s, self.ambiwidth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hl(fg: u8, bg: u8, attrs: Attrs) -> Highlight {
        Highlight {
            fg: Some(Color::from_cterm(fg)),
            bg: Some(Color::from_cterm(bg)),
            attrs,
        }
    }

    #[test]
    fn test_ansi_runs() {
        let ansi = AnsiStyle { truecolor: false };
        assert_eq!(
            ansi.style_run(Some(Color::from_cterm(231)), None, Attrs::BOLD),
            "\x1b[0;38;5;231;49;1m"
        );
        let truecolor = AnsiStyle { truecolor: true };
        assert_eq!(
            truecolor.style_run(Some(Color::from_cterm(196)), Some(Color::from_cterm(16)), Attrs::NONE),
            "\x1b[0;38;2;255;0;0;48;2;0;0;0m"
        );
    }

    #[test]
    fn test_tmux_runs() {
        let tmux = TmuxStyle { truecolor: false };
        assert_eq!(
            tmux.style_run(Some(Color::from_cterm(1)), None, Attrs::UNDERLINE),
            "#[fg=colour1,bg=default,nobold,noitalics,underscore]"
        );
        assert_eq!(tmux.reset(), "");
    }

    #[test]
    fn test_shell_escapes_and_translations() {
        let bash = Style::new(RendererKind::Bash, false, None, 1);
        let out = bash.hl("$HOME", hl(1, 2, Attrs::NONE));
        assert_eq!(out, "\\[\x1b[0;38;5;1;48;5;2m\\]\\$HOME");
        assert_eq!(bash.reset(), "\\[\x1b[0m\\]");

        let zsh = Style::new(RendererKind::Zsh, false, None, 1);
        assert!(zsh.hl("50%", hl(1, 2, Attrs::NONE)).ends_with("%}50%%"));

        let tmux = Style::new(RendererKind::Tmux, false, Some("tmux"), 1);
        assert!(tmux.hl("#1", hl(1, 2, Attrs::NONE)).ends_with("]##[]1"));
    }

    #[test]
    fn test_passthrough_doubles_escape() {
        let ansi = Style::new(RendererKind::Ansi, false, Some("tmux"), 1);
        assert_eq!(ansi.reset(), "\x1bPtmux;\x1b\x1b[0m\x1b\\");
        let plain = Style::new(RendererKind::Plain, false, Some("tmux"), 1);
        assert_eq!(plain.hl("x", hl(1, 2, Attrs::BOLD)), "x");
    }

    #[test]
    fn test_renderer_kind_names() {
        assert_eq!("shell".parse::<RendererKind>().unwrap(), RendererKind::Ansi);
        assert_eq!("zsh".parse::<RendererKind>().unwrap(), RendererKind::Zsh);
        assert!(matches!(
            "vim".parse::<RendererKind>(),
            Err(PowerlineError::UnknownRenderer(name)) if name == "vim"
        ));
    }
}
