//! Subcommand implementations.

pub(crate) mod config;
pub(crate) mod configure;
pub(crate) mod create;
pub(crate) mod describe;
pub(crate) mod run;
pub(crate) mod show_config;
