use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PowerlineError {
    #[error("config file not found in search paths ({paths}): {name}")]
    ConfigNotFound { name: String, paths: String },

    #[error("failed to parse {path}: {message}")]
    ConfigParse { path: PathBuf, message: String },

    #[error("invalid {kind} configuration: {message}")]
    InvalidConfig { kind: &'static str, message: String },

    #[error("highlighting groups not found in colorscheme: {0}")]
    HighlightGroupNotFound(String),

    #[error("color or gradient not found in colors configuration: {0}")]
    ColorNotFound(String),

    #[error("unknown segment function: {0}")]
    UnknownSegment(String),

    #[error("invalid segment {name}: {message}")]
    InvalidSegment { name: String, message: String },

    #[error("unknown renderer: {0}")]
    UnknownRenderer(String),

    #[error("theme has no line {0}")]
    NoSuchLine(usize),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PowerlineError>;

impl PowerlineError {
    pub fn invalid(kind: &'static str, err: impl std::fmt::Display) -> Self {
        Self::InvalidConfig {
            kind,
            message: err.to_string(),
        }
    }

    /// True for errors that mean "the file is not there (yet)" rather than
    /// "the file is broken".
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::ConfigNotFound { .. } => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
