//! Process launching for remote compute agents.
//!
//! Provides:
//! - `TokioLauncher` - spawn process groups with merged output
//! - Executable resolution against the sandbox and `PATH`

pub mod launcher;
pub mod resolve;

pub use launcher::TokioLauncher;
pub use resolve::{merge_paths, resolve_executable};
