//! Caravel Shell - Process and binding primitives.
//!
//! The lowest layer of the execution engine: spawning substrate
//! commands, materializing external workspaces, and the binding
//! algorithm that turns declared task parameters into volume mounts and
//! command-line arguments. Every substrate runner is built on this
//! crate; none of them touches a child process directly.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod mounts;
pub mod process;
pub mod sync;

pub use mounts::{generate_mounts, MountPlan};
pub use process::{format_command, run, run_and_capture, OnError};
pub use sync::sync_workspace;
