//! Host-subprocess runtime.
//!
//! Containers are plain processes built from the runtime spec's
//! `args`/`env`/`cwd`. Exec checks run as host commands. This is the
//! runtime a single-node deployment wires in; everything heavier (namespaces,
//! images, cgroups) belongs to an external bootstrapper.

use std::{collections::HashMap, os::unix::process::ExitStatusExt, sync::Arc};

use anyhow::{Context, Result, bail};
use nix::{sys::signal, unistd::Pid};
use tokio::process::{Child, Command};
use tracing::debug;

use crate::{
    runtime::{ContainerBootstrapper, ContainerHandle},
    spec::RuntimeSpec,
};

/// Bootstraps [`ShellContainer`]s. Only the process arguments matter; the
/// rest of the spec is passed through to the command builder.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellRuntime;

#[async_trait::async_trait]
impl ContainerBootstrapper for ShellRuntime {
    async fn bootstrap(
        &self,
        spec: &RuntimeSpec,
        _metadata: &HashMap<String, String>,
    ) -> Result<Arc<dyn ContainerHandle>> {
        if spec.args.is_empty() {
            bail!("runtime spec has no process arguments");
        }
        Ok(Arc::new(ShellContainer::new(spec.clone())))
    }
}

/// A container backed by one host subprocess.
pub struct ShellContainer {
    spec: RuntimeSpec,
    child: tokio::sync::Mutex<Option<Child>>,
    pid: std::sync::Mutex<Option<i32>>,
}

impl ShellContainer {
    fn new(spec: RuntimeSpec) -> Self {
        Self {
            spec,
            child: tokio::sync::Mutex::new(None),
            pid: std::sync::Mutex::new(None),
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.spec.args[0]);
        command.args(&self.spec.args[1..]);
        for entry in &self.spec.env {
            if let Some((name, value)) = entry.split_once('=') {
                command.env(name, value);
            }
        }
        if let Some(cwd) = &self.spec.cwd {
            command.current_dir(cwd);
        }
        command
    }
}

#[async_trait::async_trait]
impl ContainerHandle for ShellContainer {
    async fn start(&self) -> Result<()> {
        let mut guard = self.child.lock().await;
        if guard.is_some() {
            bail!("container already started");
        }
        let child = self
            .command()
            .spawn()
            .with_context(|| format!("failed to spawn {:?}", self.spec.args[0]))?;
        let pid = child.id().map(|pid| pid as i32);
        debug!(args = ?self.spec.args, pid, "[ShellRuntime] container process started");
        *self.pid.lock().unwrap_or_else(|err| err.into_inner()) = pid;
        *guard = Some(child);
        Ok(())
    }

    async fn wait(&self) -> Result<()> {
        let mut guard = self.child.lock().await;
        let child = guard.as_mut().context("container not started")?;
        let status = child.wait().await.context("failed to wait on container")?;
        if status.success() {
            return Ok(());
        }
        match (status.code(), status.signal()) {
            (Some(code), _) => bail!("container exited with status {code}"),
            (None, Some(signal)) => bail!("container terminated by signal {signal}"),
            (None, None) => bail!("container exited abnormally"),
        }
    }

    async fn kill(&self, signal: i32) -> Result<()> {
        let pid =
            (*self.pid.lock().unwrap_or_else(|err| err.into_inner())).context("container not started")?;
        let signal = signal::Signal::try_from(signal)
            .map_err(|err| anyhow::anyhow!("invalid signal {signal}: {err}"))?;
        signal::kill(Pid::from_raw(pid), signal)
            .with_context(|| format!("failed to send {signal} to pid {pid}"))?;
        Ok(())
    }

    async fn exec(&self, program: &str, args: &[String]) -> Result<i32> {
        let status = Command::new(program)
            .args(args)
            .status()
            .await
            .with_context(|| format!("failed to run {program}"))?;
        Ok(status.code().unwrap_or(-1))
    }
}
