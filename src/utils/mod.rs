//! Utility functions shared across the crate
//!
//! Formatting, path helpers, platform detection and progress tracking.

mod format;
mod path;
mod progress;
mod system;

pub use format::*;
pub use path::*;
pub use progress::*;
pub use system::*;
