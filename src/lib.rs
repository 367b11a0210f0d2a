pub mod colorscheme;
pub mod config;
pub mod error;
pub mod powerline;
pub mod renderer;
pub mod segment;
pub mod segments;
pub mod theme;
pub mod utils;

pub use colorscheme::{Attrs, Color, Colorscheme, Highlight};
pub use error::{PowerlineError, Result};
pub use powerline::{Powerline, PowerlineOptions};
pub use renderer::{RenderOutput, RenderRequest, Renderer, RendererKind};
pub use segment::Side;
pub use segments::{SegmentInfo, SegmentRegistry};
pub use utils::{LogLevel, PowerlineLogger};
