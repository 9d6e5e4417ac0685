//! CLI module for Stackwright.
//!
//! This module provides the command-line interface for planning and
//! applying stack descriptions.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands};
pub use output::{MessageLevel, OutputFormatter};
