//! Per-container state history.
//!
//! A [`ContainerStatus`] is shared between the controller's watch loop, the
//! probes and status readers, so every operation locks internally and the
//! lock is never held across an await.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Mutex;

/// Health state of one main container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ContainerState {
    /// Initial; probes have not yet concluded anything.
    Started,
    /// Liveness currently passing.
    Healthy,
    /// Liveness failed last tick but the failure threshold is not yet hit.
    Failing,
    /// Liveness gave up (failure threshold reached).
    Terminal,
    /// Container exited with success.
    Finished,
    /// Container exited with non-success.
    Failed,
}

impl ContainerState {
    /// Absorbing states admit no outgoing transitions.
    pub fn is_absorbing(self) -> bool {
        matches!(self, Self::Terminal | Self::Finished | Self::Failed)
    }
}

/// An error observed by a probe, stamped with clock time.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeError {
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Serializable snapshot of a container's history, for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerStatusReport {
    pub name: String,
    pub states: Vec<ContainerState>,
    pub errors: Vec<ProbeError>,
    pub restarts: u32,
}

struct StatusInner {
    states: Vec<ContainerState>,
    errors: Vec<ProbeError>,
    restarts: u32,
}

/// Thread-safe history of states and probe errors for one container.
pub struct ContainerStatus {
    name: String,
    inner: Mutex<StatusInner>,
}

impl ContainerStatus {
    /// New status history, starting in [`ContainerState::Started`].
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(StatusInner {
                states: vec![ContainerState::Started],
                errors: Vec::new(),
                restarts: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn last_state(&self) -> ContainerState {
        let inner = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        *inner.states.last().expect("states is never empty")
    }

    pub fn latest_error(&self) -> Option<ProbeError> {
        let inner = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        inner.errors.last().cloned()
    }

    /// Appends `state` unless it repeats the last entry or the history has
    /// already reached an absorbing state.
    pub fn add_state(&self, state: ContainerState) {
        let mut inner = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        let last = *inner.states.last().expect("states is never empty");
        if last.is_absorbing() || last == state {
            return;
        }
        inner.states.push(state);
    }

    /// Records a probe error. A repeat of the previous message only refreshes
    /// its timestamp, so a probe failing with the same cause every tick does
    /// not grow the history.
    pub fn add_error(&self, message: impl Into<String>, timestamp: DateTime<Utc>) {
        let message = message.into();
        let mut inner = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        if let Some(last) = inner.errors.last_mut() {
            if last.message == message {
                last.timestamp = timestamp;
                return;
            }
        }
        inner.errors.push(ProbeError { message, timestamp });
    }

    pub fn record_restart(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        inner.restarts += 1;
    }

    /// True iff the last state is one of Started, Healthy, Failing.
    ///
    /// Failing means the liveness probe has failed but not yet reached its
    /// failure threshold: the container is still in a valid state, most
    /// likely transitioning into a failed one if the probe keeps failing.
    pub fn healthy(&self) -> bool {
        matches!(
            self.last_state(),
            ContainerState::Started | ContainerState::Healthy | ContainerState::Failing
        )
    }

    pub fn report(&self) -> ContainerStatusReport {
        let inner = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        ContainerStatusReport {
            name: self.name.clone(),
            states: inner.states.clone(),
            errors: inner.errors.clone(),
            restarts: inner.restarts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::UNIX_EPOCH + chrono::Duration::seconds(secs)
    }

    #[test]
    fn starts_in_started() {
        let status = ContainerStatus::new("app");
        assert_eq!(status.last_state(), ContainerState::Started);
        assert!(status.healthy());
        assert!(status.latest_error().is_none());
    }

    #[test]
    fn add_state_skips_repeats() {
        let status = ContainerStatus::new("app");
        status.add_state(ContainerState::Healthy);
        status.add_state(ContainerState::Healthy);
        status.add_state(ContainerState::Failing);
        let report = status.report();
        assert_eq!(
            report.states,
            vec![
                ContainerState::Started,
                ContainerState::Healthy,
                ContainerState::Failing
            ]
        );
    }

    #[test]
    fn absorbing_states_admit_no_transitions() {
        for absorbing in [
            ContainerState::Terminal,
            ContainerState::Finished,
            ContainerState::Failed,
        ] {
            let status = ContainerStatus::new("app");
            status.add_state(absorbing);
            status.add_state(ContainerState::Healthy);
            status.add_state(ContainerState::Started);
            assert_eq!(status.last_state(), absorbing);
            assert_eq!(status.report().states.len(), 2);
            assert!(!status.healthy());
        }
    }

    #[test]
    fn healthy_iff_last_state_is_live() {
        let status = ContainerStatus::new("app");
        status.add_state(ContainerState::Healthy);
        assert!(status.healthy());
        status.add_state(ContainerState::Failing);
        assert!(status.healthy());
        status.add_state(ContainerState::Terminal);
        assert!(!status.healthy());
    }

    #[test]
    fn repeated_errors_refresh_timestamp_only() {
        let status = ContainerStatus::new("app");
        status.add_error("command exited with status 1", ts(1));
        status.add_error("command exited with status 1", ts(2));
        status.add_error("command exited with status 1", ts(3));
        let report = status.report();
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].timestamp, ts(3));

        status.add_error("bad status code: 400", ts(4));
        status.add_error("command exited with status 1", ts(5));
        let report = status.report();
        assert_eq!(report.errors.len(), 3);
        assert_eq!(
            status.latest_error().expect("latest").message,
            "command exited with status 1"
        );
    }

    #[test]
    fn record_restart_increments_counter() {
        let status = ContainerStatus::new("app");
        status.record_restart();
        status.record_restart();
        assert_eq!(status.report().restarts, 2);
    }

    #[test]
    fn report_serializes_states_as_names() {
        let status = ContainerStatus::new("app");
        status.add_state(ContainerState::Healthy);
        status.add_error("boom", ts(7));
        let json = serde_json::to_value(status.report()).expect("serialize");
        assert_eq!(json["name"], "app");
        assert_eq!(json["states"][0], "Started");
        assert_eq!(json["states"][1], "Healthy");
        assert_eq!(json["errors"][0]["message"], "boom");
        assert_eq!(json["restarts"], 0);
    }
}
