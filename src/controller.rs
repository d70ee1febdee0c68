//! Pod controller.
//!
//! The controller keeps track of the states of the containers it manages. It
//! mostly only needs the set of probes that match each container: a watch
//! loop aggregates the probe bits into a single state per container, and a
//! second pass aggregates the container states into the pod's single healthy
//! bit, which an external scheduler uses to decide whether to reschedule.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result, bail};
use dashmap::DashMap;
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    check::{Check, ExecCheck, ExitCheck, HealthyCheck, HttpCheck},
    clock::Clock,
    probe::{ExitProbe, LongLivedProbe, ProbeSet, ProbeSnapshot},
    runtime::{ContainerBootstrapper, ContainerHandle},
    spec::{PodSpec, ProbeSpec},
    status::{ContainerState, ContainerStatus, ContainerStatusReport, ProbeError},
};

/// Supervises one pod: runs init containers to completion in order, launches
/// main containers with their probes, and aggregates per-container health
/// every second.
pub struct PodController {
    inner: Arc<Inner>,
    started: AtomicBool,
    watch_handle: Mutex<Option<JoinHandle<()>>>,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
}

struct Inner {
    spec: PodSpec,
    bootstrapper: Arc<dyn ContainerBootstrapper>,
    clock: Arc<dyn Clock>,
    /// Main container names in spec order, for deterministic iteration.
    container_names: Vec<String>,
    statuses: DashMap<String, Arc<ContainerStatus>>,
    probes: DashMap<String, ProbeSet>,
    handles: DashMap<String, Arc<dyn ContainerHandle>>,
}

impl PodController {
    pub fn new(
        spec: PodSpec,
        bootstrapper: Arc<dyn ContainerBootstrapper>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let mut container_names = Vec::with_capacity(spec.containers.len());
        for container in &spec.containers {
            if container.name.is_empty() {
                bail!("container name cannot be empty");
            }
            if container_names.contains(&container.name) {
                bail!("duplicate container name {:?}", container.name);
            }
            container_names.push(container.name.clone());
        }

        Ok(Self {
            inner: Arc::new(Inner {
                spec,
                bootstrapper,
                clock,
                container_names,
                statuses: DashMap::new(),
                probes: DashMap::new(),
                handles: DashMap::new(),
            }),
            started: AtomicBool::new(false),
            watch_handle: Mutex::new(None),
            stop_tx: Mutex::new(None),
        })
    }

    /// Runs init containers in order, materializes main containers with
    /// their probe sets, then spawns the watch loop.
    ///
    /// Any error before the watch loop begins is fatal and returned to the
    /// caller; after that, errors only ever mutate container status.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            bail!("controller already started");
        }
        let inner = &self.inner;

        // Init containers run in sequence and are not health-checked.
        for init in &inner.spec.init_containers {
            info!(container = %init.name, "[Controller] running init container");
            let handle = inner
                .bootstrapper
                .bootstrap(&init.runtime_spec, &init.metadata)
                .await
                .with_context(|| format!("failed to bootstrap init container {}", init.name))?;
            handle
                .start()
                .await
                .with_context(|| format!("failed to start init container {}", init.name))?;
            handle
                .wait()
                .await
                .with_context(|| format!("init container {} failed", init.name))?;
            debug!(container = %init.name, "[Controller] init container finished");
        }

        // Materialize every main container: a status, a handle and the
        // probes tied to it. The exit probes launch the containers once the
        // watch loop starts the probe sets.
        for container in &inner.spec.containers {
            let handle = inner
                .bootstrapper
                .bootstrap(&container.runtime_spec, &container.metadata)
                .await
                .with_context(|| format!("failed to bootstrap container {}", container.name))?;

            let exit = Arc::new(ExitProbe::new(Arc::new(ExitCheck::new(handle.clone()))));
            let liveness = Arc::new(LongLivedProbe::liveness(
                build_check(&container.liveness_probe, &handle),
                inner.clock.clone(),
                container.liveness_probe.timing(),
            ));
            let readiness = Arc::new(LongLivedProbe::readiness(
                build_check(&container.readiness_probe, &handle),
                inner.clock.clone(),
                container.readiness_probe.timing(),
            ));

            inner.statuses.insert(
                container.name.clone(),
                Arc::new(ContainerStatus::new(container.name.clone())),
            );
            inner.probes.insert(
                container.name.clone(),
                ProbeSet::new(exit, liveness, readiness, inner.clock.clone()),
            );
            inner.handles.insert(container.name.clone(), handle);
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let watch_inner = inner.clone();
        let handle = tokio::spawn(async move {
            watch(watch_inner, stop_rx).await;
        });
        *self.stop_tx.lock().unwrap_or_else(|err| err.into_inner()) = Some(stop_tx);
        *self.watch_handle.lock().unwrap_or_else(|err| err.into_inner()) = Some(handle);
        info!(
            containers = inner.container_names.len(),
            "[Controller] watch loop started"
        );

        Ok(())
    }

    /// True iff every main container's status is still live. Relies on the
    /// eventual consistency of the watch loop: readers see the last
    /// completed tick's world.
    pub fn healthy(&self) -> bool {
        self.inner
            .container_names
            .iter()
            .all(|name| match self.inner.statuses.get(name) {
                Some(status) => status.healthy(),
                None => true,
            })
    }

    /// Status reports for every main container, in spec order.
    pub fn status(&self) -> Vec<ContainerStatusReport> {
        self.inner
            .container_names
            .iter()
            .filter_map(|name| self.inner.statuses.get(name).map(|status| status.report()))
            .collect()
    }

    /// Delivers `signal` to every main container. Errors are recorded on the
    /// affected container's status and returned; they never abort the sweep.
    pub async fn kill(&self, signal: i32) -> Vec<ProbeError> {
        let mut errors = Vec::new();
        for name in &self.inner.container_names {
            let Some(handle) = self.inner.handles.get(name).map(|handle| Arc::clone(&handle)) else {
                continue;
            };
            if let Err(err) = handle.kill(signal).await {
                warn!(container = %name, error = %err, "[Controller] failed to kill container");
                let probe_error = ProbeError {
                    message: format!("kill failed: {err:#}"),
                    timestamp: self.inner.clock.timestamp(),
                };
                if let Some(status) = self.inner.statuses.get(name) {
                    status.add_error(probe_error.message.clone(), probe_error.timestamp);
                }
                errors.push(probe_error);
            }
        }
        errors
    }

    /// Stops the watch loop and every probe. Idempotent.
    pub fn stop(&self) {
        if let Some(stop_tx) = self
            .stop_tx
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .take()
        {
            let _ = stop_tx.send(());
        }
        if let Some(handle) = self
            .watch_handle
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .take()
        {
            handle.abort();
        }
        for name in &self.inner.container_names {
            if let Some(set) = self.inner.probes.get(name) {
                set.stop();
            }
        }
    }
}

impl Drop for PodController {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Builds the check backing a liveness or readiness probe. Exec actions run
/// through the container handle's exec API; with no action configured the
/// probe always succeeds.
fn build_check(spec: &ProbeSpec, container: &Arc<dyn ContainerHandle>) -> Arc<dyn Check> {
    if let Some(exec) = &spec.exec {
        return Arc::new(ExecCheck::new(container.clone(), &exec.command));
    }
    if let Some(http) = &spec.http_get {
        let mut check = HttpCheck::new(http.host.clone(), http.port, http.path.clone());
        if let Some(scheme) = &http.scheme {
            check = check.with_scheme(scheme.clone());
        }
        return Arc::new(check);
    }
    Arc::new(HealthyCheck)
}

/// Starts every probe set, then advances each container's state machine once
/// per second until stopped.
async fn watch(inner: Arc<Inner>, mut stop_rx: oneshot::Receiver<()>) {
    for name in &inner.container_names {
        if let Some(set) = inner.probes.get(name) {
            set.start();
        }
    }

    loop {
        tick(&inner);
        tokio::select! {
            _ = inner.clock.sleep(Duration::from_secs(1)) => {}
            _ = &mut stop_rx => {
                debug!("[Controller] watch loop received stop signal");
                return;
            }
        }
    }
}

/// One aggregation pass: per container, snapshot the probes, advance the
/// state machine and record this tick's errors.
fn tick(inner: &Inner) {
    for name in &inner.container_names {
        let Some(snapshot) = inner.probes.get(name).map(|set| set.snapshot()) else {
            continue;
        };
        let Some(status) = inner.statuses.get(name).map(|status| Arc::clone(&status)) else {
            continue;
        };

        let current = status.last_state();
        let (next, must_restart) = next_state(current, &snapshot);
        if next != current {
            debug!(container = %name, ?current, ?next, "[Controller] state transition");
        }
        status.add_state(next);

        let now = inner.clock.timestamp();
        for err in snapshot.errors() {
            status.add_error(err.to_string(), now);
        }
        if must_restart {
            status.record_restart();
        }
    }
}

/// Computes the next state for a container from its probe snapshot, and
/// whether it must be restarted. Restart currently stays a counter-only
/// signal: no transition requests one.
fn next_state(current: ContainerState, snapshot: &ProbeSnapshot) -> (ContainerState, bool) {
    if current.is_absorbing() {
        return (current, false);
    }

    // Process termination dominates everything else.
    if !snapshot.exit_running {
        if snapshot.exit_healthy {
            return (ContainerState::Finished, false);
        }
        return (ContainerState::Failed, false);
    }

    // The probe set is still gating liveness on container startup.
    if !snapshot.liveness_started {
        return (ContainerState::Started, false);
    }

    // The liveness probe gave up.
    if !snapshot.liveness_running {
        return (ContainerState::Terminal, false);
    }

    if snapshot.liveness_healthy {
        (ContainerState::Healthy, false)
    } else {
        (ContainerState::Failing, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{check::CheckError, clock::MockClock, spec::ContainerSpec, spec::RuntimeSpec};
    use std::collections::HashMap;

    fn snapshot() -> ProbeSnapshot {
        ProbeSnapshot {
            exit_healthy: true,
            exit_error: None,
            exit_running: true,
            liveness_healthy: true,
            liveness_error: None,
            liveness_started: true,
            liveness_running: true,
        }
    }

    #[test]
    fn next_state_absorbing_states_stick() {
        for state in [
            ContainerState::Failed,
            ContainerState::Finished,
            ContainerState::Terminal,
        ] {
            let (next, restart) = next_state(state, &snapshot());
            assert_eq!(next, state);
            assert!(!restart);
        }
    }

    #[test]
    fn next_state_exit_dominates() {
        let mut snap = snapshot();
        snap.exit_running = false;
        snap.exit_healthy = true;
        assert_eq!(
            next_state(ContainerState::Healthy, &snap).0,
            ContainerState::Finished
        );

        snap.exit_healthy = false;
        snap.exit_error = Some(CheckError::other("container exited with status 1"));
        assert_eq!(
            next_state(ContainerState::Started, &snap).0,
            ContainerState::Failed
        );
    }

    #[test]
    fn next_state_waits_for_liveness_startup() {
        let mut snap = snapshot();
        snap.liveness_started = false;
        assert_eq!(
            next_state(ContainerState::Started, &snap).0,
            ContainerState::Started
        );
    }

    #[test]
    fn next_state_terminal_when_liveness_gave_up() {
        let mut snap = snapshot();
        snap.liveness_running = false;
        snap.liveness_healthy = false;
        assert_eq!(
            next_state(ContainerState::Failing, &snap).0,
            ContainerState::Terminal
        );
    }

    #[test]
    fn next_state_follows_liveness_bit() {
        let mut snap = snapshot();
        assert_eq!(
            next_state(ContainerState::Started, &snap).0,
            ContainerState::Healthy
        );
        snap.liveness_healthy = false;
        assert_eq!(
            next_state(ContainerState::Healthy, &snap).0,
            ContainerState::Failing
        );
    }

    struct RefusingRuntime;

    #[async_trait::async_trait]
    impl ContainerBootstrapper for RefusingRuntime {
        async fn bootstrap(
            &self,
            _spec: &RuntimeSpec,
            _metadata: &HashMap<String, String>,
        ) -> Result<Arc<dyn ContainerHandle>> {
            bail!("no runtime available")
        }
    }

    fn container(name: &str) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
            runtime_spec: RuntimeSpec {
                args: vec!["sleep".to_string(), "1000".to_string()],
                env: Vec::new(),
                cwd: None,
            },
            liveness_probe: ProbeSpec::default(),
            readiness_probe: ProbeSpec::default(),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn new_rejects_duplicate_container_names() {
        let spec = PodSpec {
            init_containers: Vec::new(),
            containers: vec![container("app"), container("app")],
        };
        let result = PodController::new(
            spec,
            Arc::new(RefusingRuntime),
            Arc::new(MockClock::new()),
        );
        assert!(result.is_err());
    }

    #[test]
    fn new_rejects_empty_container_name() {
        let spec = PodSpec {
            init_containers: Vec::new(),
            containers: vec![container("")],
        };
        assert!(
            PodController::new(
                spec,
                Arc::new(RefusingRuntime),
                Arc::new(MockClock::new())
            )
            .is_err()
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn bootstrap_failure_aborts_start() {
        let spec = PodSpec {
            init_containers: Vec::new(),
            containers: vec![container("app")],
        };
        let controller = PodController::new(
            spec,
            Arc::new(RefusingRuntime),
            Arc::new(MockClock::new()),
        )
        .expect("new");
        let err = controller.start().await.expect_err("must fail");
        assert!(err.to_string().contains("app"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn start_twice_errors() {
        let spec = PodSpec::default();
        let controller = PodController::new(
            spec,
            Arc::new(RefusingRuntime),
            Arc::new(MockClock::new()),
        )
        .expect("new");
        controller.start().await.expect("first start");
        assert!(controller.start().await.is_err());
        controller.stop();
    }

    #[tokio::test(flavor = "current_thread")]
    async fn empty_pod_is_healthy() {
        let controller = PodController::new(
            PodSpec::default(),
            Arc::new(RefusingRuntime),
            Arc::new(MockClock::new()),
        )
        .expect("new");
        assert!(controller.healthy());
        assert!(controller.status().is_empty());
    }
}
