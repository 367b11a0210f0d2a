pub mod context;
pub mod event;
pub mod logger;
pub mod task;

pub use context::*;
pub use event::*;
pub use logger::*;
pub use task::*;
