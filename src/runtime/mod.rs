//! Contract the container runtime must satisfy.
//!
//! The controller does not know how containers actually run; it is handed a
//! [`ContainerBootstrapper`] at construction and drives whatever handles it
//! produces. Deployments wire a compile-time choice (the in-tree
//! [`shell::ShellRuntime`] runs containers as host subprocesses); tests wire
//! scripted fakes.

pub mod shell;

use std::{collections::HashMap, sync::Arc};

use anyhow::Result;

pub use shell::ShellRuntime;

use crate::spec::RuntimeSpec;

/// A running (or runnable) container.
#[async_trait::async_trait]
pub trait ContainerHandle: Send + Sync {
    /// Launches the container process.
    async fn start(&self) -> Result<()>;

    /// Blocks until the container exits; a non-ok return means a non-zero
    /// exit status.
    async fn wait(&self) -> Result<()>;

    /// Delivers `signal` to the container.
    async fn kill(&self, signal: i32) -> Result<()>;

    /// Runs a program in the container's context and returns its exit code.
    async fn exec(&self, program: &str, args: &[String]) -> Result<i32>;
}

/// Turns a container spec into a handle.
#[async_trait::async_trait]
pub trait ContainerBootstrapper: Send + Sync {
    async fn bootstrap(
        &self,
        spec: &RuntimeSpec,
        metadata: &HashMap<String, String>,
    ) -> Result<Arc<dyn ContainerHandle>>;
}
