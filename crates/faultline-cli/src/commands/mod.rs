//! CLI command implementations.

pub mod config;
pub mod coverage;
pub mod run;
pub mod version;
