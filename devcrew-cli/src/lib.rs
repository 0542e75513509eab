//! devcrew-cli: the command-line surface over the orchestration engine.
//!
//! Parses arguments, layers configuration, renders engine events for a
//! terminal, and writes the generated files to disk.

pub mod args;
pub mod output;
pub mod template;
pub mod workspace;
