//! Pod spec model and on-disk parsing.
//!
//! Field names mirror the usual pod-manifest conventions (camelCase on the
//! wire). Spec files may be JSON or YAML; loading attempts JSON first and
//! falls back to YAML, reporting both failures when neither parses.

use std::{collections::HashMap, fs, path::Path, time::Duration};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::probe::ProbeTiming;

/// A pod: init containers run to completion in order, then main containers
/// run for the pod's lifetime under health checks.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PodSpec {
    #[serde(rename = "initContainers", default)]
    pub init_containers: Vec<InitContainerSpec>,
    #[serde(default)]
    pub containers: Vec<ContainerSpec>,
}

/// A container run to completion before main containers start. Init
/// containers are not health-checked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitContainerSpec {
    pub name: String,
    #[serde(rename = "runtimeSpec")]
    pub runtime_spec: RuntimeSpec,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// A health-checked main container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    #[serde(rename = "runtimeSpec")]
    pub runtime_spec: RuntimeSpec,
    #[serde(rename = "livenessProbe", default)]
    pub liveness_probe: ProbeSpec,
    #[serde(rename = "readinessProbe", default)]
    pub readiness_probe: ProbeSpec,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// What the runtime needs to launch the container process. Opaque to the
/// controller; interpreted by the bootstrapper.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuntimeSpec {
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub cwd: Option<String>,
}

/// Probe configuration: one action plus timing and thresholds. With no
/// action configured the probe always succeeds.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProbeSpec {
    #[serde(default)]
    pub exec: Option<ExecAction>,
    #[serde(rename = "httpGet", default)]
    pub http_get: Option<HttpGetAction>,
    #[serde(rename = "initialDelaySeconds", default)]
    pub initial_delay_seconds: Option<u64>,
    #[serde(rename = "periodSeconds", default)]
    pub period_seconds: Option<u64>,
    #[serde(rename = "timeoutSeconds", default)]
    pub timeout_seconds: Option<u64>,
    #[serde(rename = "successThreshold", default)]
    pub success_threshold: Option<u32>,
    #[serde(rename = "failureThreshold", default)]
    pub failure_threshold: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecAction {
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpGetAction {
    #[serde(default)]
    pub scheme: Option<String>,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl ProbeSpec {
    /// Timing with defaults filled in: period 5s (clamped to at least 1s),
    /// timeout 1s, thresholds 1, no initial delay.
    pub fn timing(&self) -> ProbeTiming {
        ProbeTiming {
            initial_delay: Duration::from_secs(self.initial_delay_seconds.unwrap_or(0)),
            period: Duration::from_secs(self.period_seconds.unwrap_or(5).max(1)),
            timeout: Duration::from_secs(self.timeout_seconds.unwrap_or(1)),
            success_threshold: self.success_threshold.unwrap_or(1),
            failure_threshold: self.failure_threshold.unwrap_or(1),
        }
    }
}

impl PodSpec {
    /// Reads a pod spec from disk, auto-detecting JSON or YAML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read spec file {}", path.display()))?;
        Self::parse(&contents)
    }

    /// Parses a pod spec, attempting JSON first then YAML.
    pub fn parse(contents: &str) -> Result<Self> {
        let json_err = match serde_json::from_str(contents) {
            Ok(spec) => return Ok(spec),
            Err(err) => err,
        };
        let yaml_err = match serde_yaml::from_str(contents) {
            Ok(spec) => return Ok(spec),
            Err(err) => err,
        };
        Err(anyhow!(
            "spec is neither valid JSON ({json_err}) nor valid YAML ({yaml_err})"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_json() {
        let spec = PodSpec::parse(
            r#"{
                "initContainers": [
                    {"name": "setup", "runtimeSpec": {"args": ["true"]}}
                ],
                "containers": [
                    {
                        "name": "app",
                        "runtimeSpec": {"args": ["sleep", "1000"], "env": ["A=1"]},
                        "livenessProbe": {
                            "exec": {"command": ["true"]},
                            "periodSeconds": 5,
                            "failureThreshold": 3
                        }
                    }
                ]
            }"#,
        )
        .expect("parse json");

        assert_eq!(spec.init_containers.len(), 1);
        assert_eq!(spec.init_containers[0].name, "setup");
        assert_eq!(spec.containers.len(), 1);
        let app = &spec.containers[0];
        assert_eq!(app.runtime_spec.args, vec!["sleep", "1000"]);
        assert_eq!(app.runtime_spec.env, vec!["A=1"]);
        let timing = app.liveness_probe.timing();
        assert_eq!(timing.period, Duration::from_secs(5));
        assert_eq!(timing.failure_threshold, 3);
        // readiness left unspecified: default action, default timing
        assert!(app.readiness_probe.exec.is_none());
        assert!(app.readiness_probe.http_get.is_none());
    }

    #[test]
    fn parses_yaml() {
        let spec = PodSpec::parse(
            r#"
containers:
  - name: web
    runtimeSpec:
      args: ["./serve"]
    livenessProbe:
      httpGet:
        host: 127.0.0.1
        port: 8080
        path: /health
      initialDelaySeconds: 2
      timeoutSeconds: 3
"#,
        )
        .expect("parse yaml");

        let probe = &spec.containers[0].liveness_probe;
        let http = probe.http_get.as_ref().expect("httpGet");
        assert_eq!(http.host, "127.0.0.1");
        assert_eq!(http.port, 8080);
        assert_eq!(http.path, "/health");
        assert!(http.scheme.is_none());
        let timing = probe.timing();
        assert_eq!(timing.initial_delay, Duration::from_secs(2));
        assert_eq!(timing.timeout, Duration::from_secs(3));
    }

    #[test]
    fn garbage_reports_both_failures() {
        let err = PodSpec::parse(":::: not a spec {").expect_err("must fail");
        let message = err.to_string();
        assert!(message.contains("JSON"));
        assert!(message.contains("YAML"));
    }

    #[test]
    fn timing_defaults_match_the_contract() {
        let timing = ProbeSpec::default().timing();
        assert_eq!(timing.initial_delay, Duration::ZERO);
        assert_eq!(timing.period, Duration::from_secs(5));
        assert_eq!(timing.timeout, Duration::from_secs(1));
        assert_eq!(timing.success_threshold, 1);
        assert_eq!(timing.failure_threshold, 1);
    }

    #[test]
    fn zero_period_is_clamped_to_one_second() {
        let spec = ProbeSpec {
            period_seconds: Some(0),
            ..Default::default()
        };
        assert_eq!(spec.timing().period, Duration::from_secs(1));
    }

    #[test]
    fn load_reads_a_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(
            file,
            r#"{{"containers": [{{"name": "app", "runtimeSpec": {{"args": ["true"]}}}}]}}"#
        )
        .expect("write");

        let spec = PodSpec::load(file.path()).expect("load");
        assert_eq!(spec.containers[0].name, "app");
    }

    #[test]
    fn load_missing_file_errors() {
        assert!(PodSpec::load("/definitely/missing/spec.json").is_err());
    }
}
