//! Navis CLI library: command implementations and bundled definitions,
//! shared by the `navis` binary and its integration tests.

pub mod commands;
pub mod demos;
