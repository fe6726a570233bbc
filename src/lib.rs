//! pkgjail - sandboxed execution of package build scripts
//!
//! This crate provides:
//! - Rootless Linux containers for every external command a build script runs
//! - A path-predicate filesystem for the script interpreter's own file access
//! - The exec-handler contracts and builtin dispatch the interpreter calls into

pub mod cli;
pub mod config;
pub mod error;
pub mod fs;
pub mod paths;
#[cfg(target_os = "linux")]
pub mod sandbox;
pub mod shell;

pub use config::Config;
pub use error::{SandboxError, SetupFailure, SetupStage};
