//! Caravel Runners - Substrate executors.
//!
//! A runner drives one execution substrate: it knows how to prepare it
//! (`configure`) and how to execute one task on it (`run`). The closed
//! built-in set is registered in the [`registry`] at engine start; each
//! runner kind publishes its default configuration document and the
//! hooks the configuration builder calls during the merge.
//!
//! All substrates are driven through operator command-line tools
//! (container CLI, `ssh`/`rsync`, `kubectl`, `gcloud`) via
//! `caravel-shell`; no runner talks to a child process directly.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod container;
pub mod gcp;
pub mod k8s;
pub mod registry;
pub mod ssh;

use async_trait::async_trait;
use caravel_core::CaravelResult;

pub use registry::{Registry, RunnerPlugin};

/// A substrate executor, bound to one effective configuration and at
/// most one task. Instances are single-use.
#[async_trait]
pub trait Runner: Send {
    /// Prepare the substrate: build or pull an image, create a remote
    /// VM, sync files to a remote host. Idempotent: repeating it with
    /// identical preconditions is a no-op or cheap revalidation.
    async fn configure(&mut self) -> CaravelResult<()>;

    /// Execute the bound task. May call `configure` implicitly when a
    /// precondition (missing image, missing VM) fails.
    async fn run(&mut self) -> CaravelResult<()>;
}
