//! Rootless containers for build-script commands.
//!
//! Uses the argv[0] re-exec pattern: the binary re-executes itself as
//! `pkgjail-init` to create a container's namespaces and root filesystem, and
//! as `pkgjail-exec` to run each command inside them. Both helpers do their
//! namespace work in a clean, single-threaded process before exec'ing.
//!
//! One container lives for a whole build session ([`create_sandbox`]); every
//! external command of the session is exec'd into it by [`SandboxExecHandler`].

pub mod capabilities;
pub mod detect;
pub mod executor;
pub mod helper;
pub mod lifecycle;
mod mounts;
pub mod namespace;
pub mod runtime;
pub mod spec;

pub use capabilities::{SANDBOX_CAPABILITIES, apply_capabilities, default_capabilities};
pub use detect::{HostCapabilities, detect_capabilities};
pub use executor::SandboxExecHandler;
pub use helper::{EXEC_ARGV0, INIT_ARGV0};
pub use lifecycle::{Sandbox, SandboxOptions, create_sandbox, is_mount_error};
pub use namespace::NamespaceRuntime;
pub use runtime::{Container, ContainerRuntime, ProcessSpec, RuntimeConfig};
pub use spec::{ProcMode, Spec, SpecOptions, build_spec};
