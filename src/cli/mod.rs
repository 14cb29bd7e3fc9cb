//! Command-line interface for lesson-forge.
//!
//! Provides commands for schema management, running the worker pool, and
//! operating on the queue and cache.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
