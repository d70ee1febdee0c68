//! Probe actions.
//!
//! A [`Check`] is the single operation a probe supervises: run once, report
//! `(success, error)`. Checks stay stupid simple; retry logic, thresholds and
//! timeouts all live in the probes. Supported checks are:
//! - Exec: runs a program through the container handle's exec API
//! - HTTP GET: judges the response status code against a configured set
//! - Runner: calls a closure (mostly used by tests)
//! - Healthy: always succeeds
//! - Exit: starts a container then waits for it to terminate

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use thiserror::Error;
use tracing::debug;

use crate::runtime::ContainerHandle;

/// Failure cause reported by a check.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CheckError {
    /// The HTTP response status was not in the configured success set.
    #[error("bad status code: {0}")]
    BadStatusCode(u16),
    /// An exec-style check exited with a non-zero status.
    #[error("command exited with status {0}")]
    NonZeroExit(i32),
    /// Any other failure (transport errors, spawn failures, runtime errors).
    #[error("{0}")]
    Other(String),
}

impl CheckError {
    pub fn other(err: impl std::fmt::Display) -> Self {
        Self::Other(err.to_string())
    }
}

/// Outcome of a single check run.
///
/// `success=true, error=None` means healthy; any other combination is a
/// failing tick.
#[derive(Debug, Clone, Default)]
pub struct CheckResult {
    pub success: bool,
    pub error: Option<CheckError>,
}

impl CheckResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn fail(error: Option<CheckError>) -> Self {
        Self {
            success: false,
            error,
        }
    }
}

/// A single probe action. Timeout behavior is applied by the caller.
#[async_trait::async_trait]
pub trait Check: Send + Sync {
    async fn run(&self) -> CheckResult;
}

/// Always reports healthy. Used when a probe spec carries no action.
#[derive(Debug, Default, Clone, Copy)]
pub struct HealthyCheck;

#[async_trait::async_trait]
impl Check for HealthyCheck {
    async fn run(&self) -> CheckResult {
        CheckResult::ok()
    }
}

/// Calls a closure; a non-ok return is a failing tick.
pub struct RunnerCheck {
    runner: Arc<dyn Fn() -> Result<(), CheckError> + Send + Sync>,
}

impl RunnerCheck {
    pub fn new(runner: impl Fn() -> Result<(), CheckError> + Send + Sync + 'static) -> Self {
        Self {
            runner: Arc::new(runner),
        }
    }
}

#[async_trait::async_trait]
impl Check for RunnerCheck {
    async fn run(&self) -> CheckResult {
        match (self.runner)() {
            Ok(()) => CheckResult::ok(),
            Err(err) => CheckResult::fail(Some(err)),
        }
    }
}

/// Runs a program through the container handle's exec API; non-zero exit is
/// a failing tick.
pub struct ExecCheck {
    container: Arc<dyn ContainerHandle>,
    program: String,
    args: Vec<String>,
}

impl ExecCheck {
    pub fn new(container: Arc<dyn ContainerHandle>, command: &[String]) -> Self {
        let (program, args) = match command.split_first() {
            Some((program, args)) => (program.clone(), args.to_vec()),
            None => (String::new(), Vec::new()),
        };
        Self {
            container,
            program,
            args,
        }
    }
}

#[async_trait::async_trait]
impl Check for ExecCheck {
    async fn run(&self) -> CheckResult {
        if self.program.is_empty() {
            return CheckResult::fail(Some(CheckError::Other(
                "exec check command cannot be empty".to_string(),
            )));
        }
        match self.container.exec(&self.program, &self.args).await {
            Ok(0) => CheckResult::ok(),
            Ok(code) => CheckResult::fail(Some(CheckError::NonZeroExit(code))),
            Err(err) => CheckResult::fail(Some(CheckError::other(format!("{err:#}")))),
        }
    }
}

/// Request header attached to an HTTP check.
#[derive(Debug, Clone)]
pub struct HttpHeader {
    pub name: String,
    pub value: String,
}

/// Transport seam for [`HttpCheck`], so tests can script responses without a
/// listener. Returns the response status code.
#[async_trait::async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(&self, url: &str, headers: &[HttpHeader]) -> Result<u16, CheckError>;
}

/// Production transport backed by a shared reqwest client.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, url: &str, headers: &[HttpHeader]) -> Result<u16, CheckError> {
        let mut request = self.client.get(url);
        for header in headers {
            request = request.header(&header.name, &header.value);
        }
        let response = request.send().await.map_err(CheckError::other)?;
        Ok(response.status().as_u16())
    }
}

/// Sends a GET to `scheme://host:port/path` and succeeds iff the response
/// status is in the configured set (default `{200}`).
pub struct HttpCheck {
    scheme: String,
    host: String,
    port: u16,
    path: String,
    headers: Vec<HttpHeader>,
    success_codes: Vec<u16>,
    transport: Arc<dyn HttpTransport>,
}

impl HttpCheck {
    pub fn new(host: impl Into<String>, port: u16, path: impl Into<String>) -> Self {
        Self {
            scheme: "http".to_string(),
            host: host.into(),
            port,
            path: path.into(),
            headers: Vec::new(),
            success_codes: vec![200],
            transport: Arc::new(ReqwestTransport::default()),
        }
    }

    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    pub fn with_success_codes(mut self, codes: Vec<u16>) -> Self {
        self.success_codes = codes;
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push(HttpHeader {
            name: name.into(),
            value: value.into(),
        });
    }

    fn url(&self) -> String {
        format!(
            "{}://{}:{}{}",
            self.scheme, self.host, self.port, self.path
        )
    }
}

#[async_trait::async_trait]
impl Check for HttpCheck {
    async fn run(&self) -> CheckResult {
        let url = self.url();
        match self.transport.get(&url, &self.headers).await {
            Ok(code) if self.success_codes.contains(&code) => CheckResult::ok(),
            Ok(code) => {
                debug!(url, code, "[Check] http check got non-success status");
                CheckResult::fail(Some(CheckError::BadStatusCode(code)))
            }
            Err(err) => CheckResult::fail(Some(err)),
        }
    }
}

/// Starts a container then waits for it to terminate.
///
/// The `waiting` flag flips once `start()` has returned Ok and before
/// `wait()` is awaited; the probe set uses it to gate liveness and readiness
/// startup on the container actually being up.
pub struct ExitCheck {
    container: Arc<dyn ContainerHandle>,
    waiting: AtomicBool,
}

impl ExitCheck {
    pub fn new(container: Arc<dyn ContainerHandle>) -> Self {
        Self {
            container,
            waiting: AtomicBool::new(false),
        }
    }

    /// True once the wait phase has been entered.
    pub fn waiting(&self) -> bool {
        self.waiting.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Check for ExitCheck {
    async fn run(&self) -> CheckResult {
        if let Err(err) = self.container.start().await {
            return CheckResult::fail(Some(CheckError::other(format!("{err:#}"))));
        }
        self.waiting.store(true, Ordering::SeqCst);
        match self.container.wait().await {
            Ok(()) => CheckResult::ok(),
            Err(err) => CheckResult::fail(Some(CheckError::other(format!("{err:#}")))),
        }
    }
}
