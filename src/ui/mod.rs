//! Operator-facing CLI output
//!
//! Commands describe what happened as a [`Report`] and hand it to
//! [`Report::print`], which uses `cliclack` log lines on an interactive
//! terminal and `[OK]`/`[WARN]` prefixed lines otherwise. Machine formats
//! (`--format json|plain`) bypass this module entirely.

mod context;
mod report;

pub use context::UiContext;
pub use report::{Line, Report, Tone};
