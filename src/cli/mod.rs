//! Command-line interface for workline.
//!
//! Provides the `demo` workload runner and the `config` inspector.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
