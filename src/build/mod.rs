//! Isolated builds.
//!
//! - [`container`] - execution context contract and the docker implementation
//! - [`package`] - incremental package builds
//! - [`kernel`] - kernel configuration and build
//! - [`initrd`] - initrd script runner

pub mod container;
pub mod initrd;
pub mod kernel;
pub mod package;

pub use container::{ContainerInvocation, DockerContext, ExecutionContext, ImageBuild, Mount};
pub use initrd::{InitrdArtifact, InitrdBuilder};
pub use kernel::{ConfigOptionWarning, KernelArtifact, KernelBuilder};
pub use package::PackageBuilder;
