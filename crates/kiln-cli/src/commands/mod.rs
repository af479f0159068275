//! `kiln` subcommands

pub mod batch;
pub mod compile;
pub mod config;
pub mod dump;
pub mod run;
