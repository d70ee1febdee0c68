//! Per-container probe coordination.
//!
//! A [`ProbeSet`] owns the exit, liveness and readiness probes for one
//! container and sequences their startup: the exit probe starts first (that
//! is what actually launches the container process), and liveness/readiness
//! only start once the exit probe has entered its wait phase, so health
//! checks never fire against a container that is not up yet.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::task::JoinHandle;
use tracing::debug;

use crate::{
    check::CheckError,
    clock::Clock,
    probe::{ExitProbe, Probe},
};

/// Per-tick view of a container's probes, consumed by the watch loop.
#[derive(Debug, Clone)]
pub struct ProbeSnapshot {
    pub exit_healthy: bool,
    pub exit_error: Option<CheckError>,
    pub exit_running: bool,
    pub liveness_healthy: bool,
    pub liveness_error: Option<CheckError>,
    pub liveness_started: bool,
    pub liveness_running: bool,
}

impl ProbeSnapshot {
    /// The tick's probe errors, nils dropped.
    pub fn errors(&self) -> Vec<CheckError> {
        [self.exit_error.clone(), self.liveness_error.clone()]
            .into_iter()
            .flatten()
            .collect()
    }
}

pub struct ProbeSet {
    exit: Arc<ExitProbe>,
    liveness: Arc<dyn Probe>,
    readiness: Arc<dyn Probe>,
    clock: Arc<dyn Clock>,
    coordinator: Mutex<Option<JoinHandle<()>>>,
}

impl ProbeSet {
    pub fn new(
        exit: Arc<ExitProbe>,
        liveness: Arc<dyn Probe>,
        readiness: Arc<dyn Probe>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            exit,
            liveness,
            readiness,
            clock,
            coordinator: Mutex::new(None),
        }
    }

    /// Starts the exit probe immediately, then starts liveness and readiness
    /// from a background task once the container has reached its wait phase.
    /// If the exit probe finishes without ever reaching it (the container
    /// failed to start), liveness and readiness are never started.
    pub fn start(&self) {
        self.exit.start();

        let exit = self.exit.clone();
        let liveness = self.liveness.clone();
        let readiness = self.readiness.clone();
        let clock = self.clock.clone();
        let handle = tokio::spawn(async move {
            loop {
                if exit.waiting() {
                    liveness.start();
                    readiness.start();
                    return;
                }
                if !exit.running() {
                    debug!("[ProbeSet] container never reached wait; leaving probes unstarted");
                    return;
                }
                clock.sleep(Duration::from_secs(1)).await;
            }
        });
        *self.coordinator.lock().unwrap_or_else(|err| err.into_inner()) = Some(handle);
    }

    /// Stops every probe and the startup coordinator.
    pub fn stop(&self) {
        if let Some(handle) = self
            .coordinator
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .take()
        {
            handle.abort();
        }
        self.exit.stop();
        self.liveness.stop();
        self.readiness.stop();
    }

    pub fn exit(&self) -> &ExitProbe {
        &self.exit
    }

    pub fn snapshot(&self) -> ProbeSnapshot {
        let (exit_healthy, exit_error) = self.exit.healthy();
        let (liveness_healthy, liveness_error) = self.liveness.healthy();
        ProbeSnapshot {
            exit_healthy,
            exit_error,
            exit_running: self.exit.running(),
            liveness_healthy,
            liveness_error,
            liveness_started: self.liveness.started(),
            liveness_running: self.liveness.running(),
        }
    }
}
