//! CLI module for the Stackwarden tool.
//!
//! This module provides the command-line interface for running passes
//! against a stack and inspecting its stored state.

mod commands;
mod output;

pub use commands::{Cli, Commands, LogFormat, OutputFormat, StateCommands};
pub use output::{ConsoleSink, MASK, OutputFormatter, mask_state};
