use crate::config::*;

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            term_truecolor: false,
            ambiwidth: 1,
            interval: None,
            reload_config: true,
            watcher: "auto".to_string(),
            log_level: "WARNING".to_string(),
            default_top_theme: "powerline".to_string(),
            additional_escapes: None,
        }
    }
}

impl Default for ExtConfig {
    fn default() -> Self {
        Self {
            colorscheme: "default".to_string(),
            theme: "default".to_string(),
            top_theme: None,
        }
    }
}

impl Default for ThemeConfig {
    fn default() -> Self {
        Self {
            dividers: Dividers::default(),
            spaces: 1,
            outer_padding: 1,
            segments: ThemeSegments::default(),
            segment_data: HashMap::new(),
        }
    }
}

impl Default for Dividers {
    fn default() -> Self {
        Self {
            left: DividerPair {
                hard: "\u{e0b0}".to_string(),
                soft: "\u{e0b1}".to_string(),
            },
            right: DividerPair {
                hard: "\u{e0b2}".to_string(),
                soft: "\u{e0b3}".to_string(),
            },
        }
    }
}

/// Search-path directory holding the configuration shipped with the crate.
pub fn bundled_config_dir() -> std::path::PathBuf {
    std::env::var_os("POWERLINE_BUNDLED_CONFIG")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| {
            std::path::PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/config_files"))
        })
}
