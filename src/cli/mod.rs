//! CLI module for diskjockey - command-line interface and subcommands.
//!
//! Provides the main entry point with subcommands for the managed processes,
//! the supervisor and the mount client.

pub mod commands;

pub use commands::Cli;
