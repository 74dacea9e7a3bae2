use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::process::{Child, Stdio};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::config::ConfigReport;
use crate::error::{ForgeError, ForgeResult};
use crate::freeze::{BUNDLE_MANIFEST_FILE, BundleManifest, LAUNCHER_NAME, count_files};
use crate::matrix::VersionMatrix;
use crate::pipeline::{PipelineContext, PipelineState, Stage};
use crate::platform::{CommandRunner, HostPlatform, Invocation};
use crate::runtime::{CONFIG_FILE, DATABASE_FILE, HOME_ENV};

/// Black-box checks run against a finished bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationPlan {
    /// Launcher stem relative to the bundle root; the host suffix is added.
    pub executable: String,
    pub required_paths: Vec<PathBuf>,
    pub min_file_counts: Vec<FileCountCheck>,
    pub diagnostic_args: Vec<String>,
    pub init: InitCheck,
    pub server: ServerCheck,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCountCheck {
    pub path: PathBuf,
    pub min: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InitCheck {
    pub args: Vec<String>,
    /// Files the command must leave in the scratch home directory.
    pub expected_files: Vec<PathBuf>,
}

impl Default for InitCheck {
    fn default() -> Self {
        Self {
            args: vec!["init".into()],
            expected_files: vec![PathBuf::from(CONFIG_FILE), PathBuf::from(DATABASE_FILE)],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerCheck {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub attempts: u32,
    pub interval_ms: u64,
    pub health_path: String,
    pub release_timeout_ms: u64,
}

impl Default for ServerCheck {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".into(),
            port: 19088,
            attempts: 30,
            interval_ms: 1_000,
            health_path: "/health".into(),
            release_timeout_ms: 5_000,
        }
    }
}

impl ServerCheck {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn release_timeout(&self) -> Duration {
        Duration::from_millis(self.release_timeout_ms)
    }

    pub fn args(&self) -> Vec<String> {
        vec![
            "run".into(),
            "--host".into(),
            self.host.clone(),
            "--port".into(),
            self.port.to_string(),
            "--no-init".into(),
        ]
    }
}

impl Default for ValidationPlan {
    fn default() -> Self {
        let resources = Path::new("engine").join("_internal").join("superset");
        Self {
            executable: LAUNCHER_NAME.into(),
            required_paths: vec![
                PathBuf::from(BUNDLE_MANIFEST_FILE),
                resources.join("migrations"),
                resources.join("templates"),
                resources.join("static").join("assets"),
            ],
            min_file_counts: vec![FileCountCheck {
                path: resources.join("migrations").join("versions"),
                min: 100,
            }],
            diagnostic_args: vec!["doctor".into()],
            init: InitCheck::default(),
            server: ServerCheck::default(),
        }
    }
}

impl ValidationPlan {
    pub fn check(&self) -> ConfigReport {
        let mut report = ConfigReport::default();
        if self.executable.trim().is_empty() {
            report.errors.push("validation.executable cannot be empty".into());
        }
        for count in &self.min_file_counts {
            if count.min == 0 {
                report.errors.push(format!(
                    "validation.min_file_counts entry '{}' has a zero threshold",
                    count.path.display()
                ));
            }
        }
        if self.server.enabled {
            if self.server.port == 0 {
                report.errors.push("validation.server.port cannot be 0".into());
            }
            if self.server.attempts == 0 {
                report.errors.push("validation.server.attempts must be at least 1".into());
            }
        } else {
            report
                .warnings
                .push("Server start check disabled; port binding is not validated".into());
        }
        report
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

impl CheckResult {
    pub fn pass(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            detail: detail.into(),
        }
    }

    pub fn fail(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: false,
            detail: detail.into(),
        }
    }

    pub fn exists(name: impl Into<String>, path: &Path) -> Self {
        if path.exists() {
            Self::pass(name, format!("{} exists", path.display()))
        } else {
            Self::fail(name, format!("{} is missing", path.display()))
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub checks: Vec<CheckResult>,
    pub failure_count: usize,
}

impl ValidationReport {
    pub fn push(&mut self, check: CheckResult) {
        if check.passed {
            info!(check = check.name.as_str(), detail = check.detail.as_str(), "Check passed");
        } else {
            warn!(check = check.name.as_str(), detail = check.detail.as_str(), "Check failed");
            self.failure_count += 1;
        }
        self.checks.push(check);
    }

    pub fn passed(&self) -> bool {
        self.failure_count == 0
    }

    pub fn into_result(self) -> ForgeResult<Self> {
        if self.passed() {
            return Ok(self);
        }
        Err(ForgeError::ValidationFailure {
            failures: self.failure_count,
            checks: self
                .checks
                .iter()
                .filter(|c| !c.passed)
                .map(|c| format!("{}: {}", c.name, c.detail))
                .collect(),
        })
    }
}

/// File count check for one bundle-relative directory.
pub fn check_file_count(bundle_root: &Path, check: &FileCountCheck) -> CheckResult {
    let name = format!("file-count:{}", check.path.display());
    let path = bundle_root.join(&check.path);
    if !path.is_dir() {
        return CheckResult::fail(name, format!("{} is missing", path.display()));
    }
    let count = count_files(&path);
    if count >= check.min {
        CheckResult::pass(name, format!("{count} files (minimum {})", check.min))
    } else {
        CheckResult::fail(
            name,
            format!("count mismatch: found {count} files, expected at least {}", check.min),
        )
    }
}

/// How the server was seen to be up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    Health,
    Socket,
}

fn socket_addr(host: &str, port: u16) -> Option<SocketAddr> {
    (host, port).to_socket_addrs().ok()?.next()
}

/// Poll until the health endpoint answers or, failing that, the port accepts
/// a connection. `exited` is consulted between attempts so a crashed server
/// ends the wait early.
pub fn wait_for_server(
    check: &ServerCheck,
    mut exited: impl FnMut() -> Option<String>,
) -> Result<Probe, String> {
    let Some(addr) = socket_addr(&check.host, check.port) else {
        return Err(format!("cannot resolve {}:{}", check.host, check.port));
    };
    let client = reqwest::blocking::Client::builder()
        .no_proxy()
        .connect_timeout(Duration::from_secs(2))
        .timeout(Duration::from_secs(5))
        .build()
        .ok();
    let url = format!("http://{}:{}{}", check.host, check.port, check.health_path);

    for attempt in 1..=check.attempts {
        if let Some(status) = exited() {
            return Err(format!("server exited before binding ({status})"));
        }
        if let Some(client) = &client
            && let Ok(response) = client.get(&url).send()
            && response.status().is_success()
        {
            return Ok(Probe::Health);
        }
        if TcpStream::connect_timeout(&addr, Duration::from_secs(1)).is_ok() {
            return Ok(Probe::Socket);
        }
        debug!(attempt, "Server not reachable yet");
        std::thread::sleep(check.interval());
    }
    Err(format!(
        "{addr} not reachable after {} attempts",
        check.attempts
    ))
}

/// Wait until the port can be bound again.
pub fn wait_for_release(host: &str, port: u16, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if TcpListener::bind((host, port)).is_ok() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

/// Kills the background server however the check ends.
struct ServerGuard {
    child: Child,
}

impl ServerGuard {
    fn exit_status(&mut self) -> Option<String> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            _ => None,
        }
    }
}

impl Drop for ServerGuard {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
    }
}

pub struct ArtifactValidator<'a> {
    runner: &'a dyn CommandRunner,
    plan: &'a ValidationPlan,
    bundle_root: PathBuf,
    scratch_home: PathBuf,
    matrix: Option<&'a VersionMatrix>,
}

impl<'a> ArtifactValidator<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        plan: &'a ValidationPlan,
        bundle_root: PathBuf,
        scratch_home: PathBuf,
    ) -> Self {
        Self {
            runner,
            plan,
            bundle_root,
            scratch_home,
            matrix: None,
        }
    }

    pub fn with_matrix(mut self, matrix: Option<&'a VersionMatrix>) -> Self {
        self.matrix = matrix;
        self
    }

    pub fn executable(&self) -> PathBuf {
        self.bundle_root
            .join(HostPlatform::current().executable_name(&self.plan.executable))
    }

    /// Every check runs regardless of earlier failures.
    #[instrument(skip_all, fields(bundle = %self.bundle_root.display()))]
    pub fn validate(&self) -> ValidationReport {
        let mut report = ValidationReport::default();

        report.push(CheckResult::exists("executable", &self.executable()));
        for path in &self.plan.required_paths {
            report.push(CheckResult::exists(
                format!("exists:{}", path.display()),
                &self.bundle_root.join(path),
            ));
        }
        for count in &self.plan.min_file_counts {
            report.push(check_file_count(&self.bundle_root, count));
        }
        if let Some(matrix) = self.matrix {
            report.push(self.check_bundle_revision(matrix));
        }

        if let Err(err) = self.reset_scratch_home() {
            report.push(CheckResult::fail("scratch-home", err.to_string()));
            return report;
        }
        report.push(self.run_command("diagnostic", &self.plan.diagnostic_args));
        report.push(self.check_init());
        if self.plan.server.enabled {
            for check in self.check_server() {
                report.push(check);
            }
        }

        info!(
            checks = report.checks.len(),
            failures = report.failure_count,
            "Validation finished"
        );
        report
    }

    fn reset_scratch_home(&self) -> ForgeResult<()> {
        if self.scratch_home.exists() {
            std::fs::remove_dir_all(&self.scratch_home).map_err(|err| {
                ForgeError::io(format!("failed to clear {}", self.scratch_home.display()), err)
            })?;
        }
        std::fs::create_dir_all(&self.scratch_home).map_err(|err| {
            ForgeError::io(format!("failed to create {}", self.scratch_home.display()), err)
        })
    }

    fn invocation(&self, args: &[String]) -> Invocation {
        Invocation::new(self.executable().to_string_lossy(), args.iter().cloned())
            .current_dir(&self.scratch_home)
            .env(HOME_ENV, self.scratch_home.to_string_lossy())
    }

    fn run_command(&self, name: &str, args: &[String]) -> CheckResult {
        let invocation = self.invocation(args);
        match self.runner.run_checked(&invocation) {
            Ok(_) => CheckResult::pass(name, format!("`{invocation}` exited 0")),
            Err(err) => CheckResult::fail(name, err.to_string()),
        }
    }

    fn check_init(&self) -> CheckResult {
        let result = self.run_command("init", &self.plan.init.args);
        if !result.passed {
            return result;
        }
        let missing: Vec<String> = self
            .plan
            .init
            .expected_files
            .iter()
            .filter(|file| !self.scratch_home.join(file).exists())
            .map(|file| file.display().to_string())
            .collect();
        if missing.is_empty() {
            result
        } else {
            CheckResult::fail(
                "init",
                format!("exited 0 but did not create {}", missing.join(", ")),
            )
        }
    }

    fn check_bundle_revision(&self, matrix: &VersionMatrix) -> CheckResult {
        match BundleManifest::load(&self.bundle_root) {
            Ok(Some(bundle)) if bundle.resolved_id == matrix.resolved_id() => CheckResult::pass(
                "bundle-revision",
                format!("bundle built from {}", bundle.resolved_id),
            ),
            Ok(Some(bundle)) => CheckResult::fail(
                "bundle-revision",
                format!(
                    "bundle built from {}, version matrix records {}",
                    bundle.resolved_id,
                    matrix.resolved_id()
                ),
            ),
            Ok(None) => CheckResult::fail("bundle-revision", "bundle manifest is missing"),
            Err(err) => CheckResult::fail("bundle-revision", err.to_string()),
        }
    }

    fn check_server(&self) -> Vec<CheckResult> {
        let server = &self.plan.server;
        if TcpListener::bind((server.host.as_str(), server.port)).is_err() {
            return vec![CheckResult::fail(
                "server-start",
                format!(
                    "port {} already in use on {}; launcher not started",
                    server.port, server.host
                ),
            )];
        }
        let invocation = self.invocation(&server.args());
        let mut command = invocation.to_command();
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let mut guard = match command.spawn() {
            Ok(child) => ServerGuard { child },
            Err(err) => {
                return vec![CheckResult::fail(
                    "server-start",
                    format!("failed to spawn `{invocation}`: {err}"),
                )];
            }
        };
        info!(port = server.port, "Waiting for server");
        let started = Instant::now();
        let outcome = wait_for_server(server, || guard.exit_status());
        drop(guard);

        let start = match outcome {
            Ok(probe) => CheckResult::pass(
                "server-start",
                format!(
                    "{}:{} answered via {:?} probe after {:.1}s",
                    server.host,
                    server.port,
                    probe,
                    started.elapsed().as_secs_f64()
                ),
            ),
            Err(detail) => CheckResult::fail("server-start", detail),
        };
        let release = if wait_for_release(&server.host, server.port, server.release_timeout()) {
            CheckResult::pass("port-release", format!("port {} free after shutdown", server.port))
        } else {
            CheckResult::fail(
                "port-release",
                format!(
                    "port {} still bound {}ms after shutdown",
                    server.port, server.release_timeout_ms
                ),
            )
        };
        vec![start, release]
    }
}

pub struct ValidateStage;

impl Stage for ValidateStage {
    fn name(&self) -> &'static str {
        "validate"
    }

    fn state(&self) -> PipelineState {
        PipelineState::Validate
    }

    fn run(&self, ctx: &mut PipelineContext<'_>) -> ForgeResult<()> {
        let config = ctx.config;
        let bundle_root = config.freeze.bundle_root(config);
        let scratch = config.resolve(&config.freeze.output).join("validate-home");
        let report = ArtifactValidator::new(ctx.runner, &config.validation, bundle_root, scratch)
            .with_matrix(ctx.matrix.as_ref())
            .validate();
        ctx.validation = Some(report.clone());
        report.into_result().map(|_| ())
    }
}
