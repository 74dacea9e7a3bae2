use std::collections::BTreeMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde::Serialize;
use tracing::debug;

use crate::error::{ForgeError, ForgeResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tool {
    Git,
    Node,
    Npm,
    Python,
    Uv,
    Freezer,
}

impl Tool {
    pub fn name(&self) -> &'static str {
        match self {
            Tool::Git => "git",
            Tool::Node => "node",
            Tool::Npm => "npm",
            Tool::Python => "python",
            Tool::Uv => "uv",
            Tool::Freezer => "pyinstaller",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPlatform {
    Windows,
    Unix,
}

impl HostPlatform {
    pub fn current() -> Self {
        if cfg!(windows) {
            HostPlatform::Windows
        } else {
            HostPlatform::Unix
        }
    }

    pub fn executable_name(&self, stem: &str) -> String {
        match self {
            HostPlatform::Windows => format!("{stem}.exe"),
            HostPlatform::Unix => stem.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSpec {
    pub program: String,
    pub prefix: Vec<String>,
}

impl ToolSpec {
    fn plain(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            prefix: Vec::new(),
        }
    }

    fn with_prefix(program: impl Into<String>, prefix: &[&str]) -> Self {
        Self {
            program: program.into(),
            prefix: prefix.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// How each external tool is invoked on this host. Built once per run and
/// consulted by every stage instead of special-casing call sites.
#[derive(Debug, Clone)]
pub struct ToolTable {
    host: HostPlatform,
    entries: BTreeMap<Tool, ToolSpec>,
}

impl ToolTable {
    pub fn detect(workspace: &Path) -> Self {
        let host = HostPlatform::current();
        let python = std::env::var("REPORTFORGE_PYTHON")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| venv_python(workspace, host));
        Self::for_host(host, python)
    }

    pub fn for_host(host: HostPlatform, python: impl Into<String>) -> Self {
        let python = python.into();
        let mut entries = BTreeMap::new();
        entries.insert(Tool::Git, ToolSpec::plain("git"));
        entries.insert(Tool::Uv, ToolSpec::plain("uv"));
        // npm and node ship as .cmd shims on Windows and need the shell.
        match host {
            HostPlatform::Windows => {
                entries.insert(Tool::Node, ToolSpec::with_prefix("cmd", &["/C", "node"]));
                entries.insert(Tool::Npm, ToolSpec::with_prefix("cmd", &["/C", "npm"]));
            }
            HostPlatform::Unix => {
                entries.insert(Tool::Node, ToolSpec::plain("node"));
                entries.insert(Tool::Npm, ToolSpec::plain("npm"));
            }
        }
        entries.insert(Tool::Python, ToolSpec::plain(python.clone()));
        entries.insert(
            Tool::Freezer,
            ToolSpec::with_prefix(python, &["-m", "PyInstaller"]),
        );
        Self { host, entries }
    }

    pub fn host(&self) -> HostPlatform {
        self.host
    }

    pub fn spec(&self, tool: Tool) -> &ToolSpec {
        // Every variant is inserted by `for_host`.
        &self.entries[&tool]
    }

    pub fn invocation<I, S>(&self, tool: Tool, args: I) -> Invocation
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let spec = self.spec(tool);
        let mut all_args = spec.prefix.clone();
        all_args.extend(args.into_iter().map(Into::into));
        Invocation {
            tool: Some(tool),
            program: spec.program.clone(),
            args: all_args,
            cwd: None,
            env: Vec::new(),
            capture: true,
        }
    }

    /// Probe `<tool> --version`, returning the trimmed version string.
    pub fn probe_version(&self, tool: Tool, runner: &dyn CommandRunner) -> ForgeResult<String> {
        let output = runner.run(&self.invocation(tool, ["--version"]))?;
        if !output.success() {
            return Err(ForgeError::BuildToolMissing {
                tool: tool.name().to_string(),
                detail: format!("`--version` exited with {:?}", output.status),
            });
        }
        let text = if output.stdout.trim().is_empty() {
            output.stderr.trim()
        } else {
            output.stdout.trim()
        };
        Ok(text
            .trim_start_matches("Python ")
            .trim_start_matches("git version ")
            .lines()
            .next()
            .unwrap_or_default()
            .to_string())
    }

    pub fn is_available(&self, tool: Tool, runner: &dyn CommandRunner) -> bool {
        self.probe_version(tool, runner).is_ok()
    }
}

fn venv_python(workspace: &Path, host: HostPlatform) -> String {
    let candidate: PathBuf = match host {
        HostPlatform::Windows => workspace.join(".venv").join("Scripts").join("python.exe"),
        HostPlatform::Unix => workspace.join(".venv").join("bin").join("python"),
    };
    if candidate.is_file() {
        candidate.to_string_lossy().to_string()
    } else if host == HostPlatform::Windows {
        "python".to_string()
    } else {
        "python3".to_string()
    }
}

#[derive(Debug, Clone)]
pub struct Invocation {
    pub tool: Option<Tool>,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub capture: bool,
}

impl Invocation {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tool: None,
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
            env: Vec::new(),
            capture: true,
        }
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn inherit_output(mut self) -> Self {
        self.capture = false;
        self
    }

    pub fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        if let Some(dir) = &self.cwd {
            command.current_dir(dir);
        }
        for (key, value) in &self.env {
            command.env(key, value);
        }
        command
    }

    /// Arguments after the tool prefix, used by fakes to match calls.
    pub fn args_after_prefix(&self, table: &ToolTable) -> &[String] {
        match self.tool {
            Some(tool) => {
                let skip = table.spec(tool).prefix.len().min(self.args.len());
                &self.args[skip..]
            }
            None => &self.args,
        }
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.contains(' ') {
                write!(f, " \"{arg}\"")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Turn a non-zero exit into `CommandFailed`, keeping the tail of stderr.
    pub fn into_checked(self, invocation: &Invocation) -> ForgeResult<Self> {
        if self.success() {
            return Ok(self);
        }
        Err(ForgeError::CommandFailed {
            command: invocation.to_string(),
            status: self.status,
            stderr: tail(&self.stderr, 20),
        })
    }
}

fn tail(text: &str, lines: usize) -> String {
    let collected: Vec<&str> = text.lines().collect();
    let start = collected.len().saturating_sub(lines);
    collected[start..].join("\n")
}

pub trait CommandRunner: Send + Sync {
    fn run(&self, invocation: &Invocation) -> ForgeResult<CommandOutput>;

    fn run_checked(&self, invocation: &Invocation) -> ForgeResult<CommandOutput> {
        self.run(invocation)?.into_checked(invocation)
    }

    /// Hand the foreground over to a long-running service. Returns once the
    /// service ends; a non-zero exit is `CommandFailed`.
    fn serve(&self, invocation: &Invocation) -> ForgeResult<()> {
        self.run_checked(invocation).map(|_| ())
    }
}

fn spawn_error(invocation: &Invocation, err: std::io::Error) -> ForgeError {
    if err.kind() == ErrorKind::NotFound {
        ForgeError::BuildToolMissing {
            tool: invocation
                .tool
                .map(|tool| tool.name().to_string())
                .unwrap_or_else(|| invocation.program.clone()),
            detail: format!("`{}` not found on PATH", invocation.program),
        }
    } else {
        ForgeError::io(format!("failed to spawn `{invocation}`"), err)
    }
}

/// Runs invocations as blocking child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, invocation: &Invocation) -> ForgeResult<CommandOutput> {
        debug!(command = %invocation, "Spawning");
        let mut command = invocation.to_command();

        if invocation.capture {
            let output = command
                .stdin(Stdio::null())
                .output()
                .map_err(|err| spawn_error(invocation, err))?;
            Ok(CommandOutput {
                status: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            })
        } else {
            let status = command
                .status()
                .map_err(|err| spawn_error(invocation, err))?;
            Ok(CommandOutput {
                status: status.code(),
                ..CommandOutput::default()
            })
        }
    }

    /// On unix the service replaces this process, so signalling our pid
    /// reaches the service itself and nothing is left holding its port.
    #[cfg(unix)]
    fn serve(&self, invocation: &Invocation) -> ForgeResult<()> {
        use std::os::unix::process::CommandExt;

        debug!(command = %invocation, "Replacing process");
        let err = invocation.to_command().exec();
        Err(spawn_error(invocation, err))
    }
}
