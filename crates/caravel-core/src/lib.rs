//! Caravel Core - Shared data model for the Caravel engine.
//!
//! This crate holds the pieces every other Caravel crate agrees on:
//!
//! - The error taxonomy ([`CaravelError`]) with structured execution
//!   context preserved across the call stack
//! - The YAML configuration tree utilities ([`tree`]): dotted-path
//!   navigation, deep merge, and variable interpolation
//! - The package description model ([`package`]): tasks, parameters,
//!   and the type-inference rules applied before execution
//!
//! It has no dependencies on other internal caravel crates.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod error;
pub mod package;
pub mod tree;

pub use error::{CaravelError, CaravelResult, ExecContext};
pub use package::{
    AccessMode, HardwareExpectations, PackageDescription, ParamKind, ParamSet, Parameter, Task,
    DESCRIPTION_FILE,
};
