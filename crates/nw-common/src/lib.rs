//! Shared foundation for NodeWatch.
//!
//! This crate holds the pieces every other NodeWatch crate depends on:
//!
//! - [`error`]: the workspace error taxonomy with stable codes.
//! - [`document`]: the result document probes write into during a run.
//! - [`kvfile`]: the key=value definition-file parser used by probe
//!   configuration (process, log, package, certificate definitions).

pub mod document;
pub mod error;
pub mod kvfile;

pub use document::{Document, NodePath, Value, APPEND};
pub use error::{Error, ErrorCategory, Result};

/// Priority attached to an error entry. Valid range is `[0, 100]`;
/// higher is more urgent, 0 suppresses reporting.
pub type Priority = i32;

/// Highest priority an error entry may carry.
pub const MAX_PRIORITY: Priority = 100;
