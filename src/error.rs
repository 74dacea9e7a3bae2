use std::path::PathBuf;

use thiserror::Error;

/// Stable process exit codes. Release tooling keys off these, so they must
/// not be renumbered.
pub mod exit_codes {
    pub const OK: i32 = 0;
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const RESOLUTION: i32 = 3;
    pub const DRIFT: i32 = 4;
    pub const BUILD: i32 = 5;
    pub const PACKAGING: i32 = 6;
    pub const VALIDATION: i32 = 7;
    pub const RUNTIME: i32 = 8;
}

#[derive(Error, Debug)]
pub enum ForgeError {
    #[error("could not resolve reference '{reference}': {detail}")]
    Resolution { reference: String, detail: String },

    #[error("remote '{remote}' is unreachable: {detail}")]
    Network { remote: String, detail: String },

    #[error(
        "checkout {} has uncommitted modifications that would be discarded: {}",
        .checkout.display(),
        .files.join(", ")
    )]
    DirtyCheckout { checkout: PathBuf, files: Vec<String> },

    #[error(
        "checkout {} drifted: recorded {expected}, found {actual}",
        .checkout.display()
    )]
    Drift {
        expected: String,
        actual: String,
        checkout: PathBuf,
    },

    #[error("build tool '{tool}' is not available: {detail}")]
    BuildToolMissing { tool: String, detail: String },

    #[error("source tree {} is invalid: expected {expected}", .root.display())]
    SourceTreeInvalid { root: PathBuf, expected: String },

    #[error("resource '{logical_name}' missing at {}: {detail}", .path.display())]
    ResourceMissing {
        logical_name: String,
        path: PathBuf,
        detail: String,
    },

    #[error("command `{command}` failed with {}: {stderr}", status_label(.status))]
    CommandFailed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("validation failed: {failures} check(s) failed ({})", .checks.join(", "))]
    ValidationFailure { failures: usize, checks: Vec<String> },

    #[error("invalid configuration {}: {detail}", .path.display())]
    Config { path: PathBuf, detail: String },

    #[error("runtime failure: {0}")]
    Runtime(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

fn status_label(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!("exit code {code}"),
        None => "a signal".to_string(),
    }
}

impl ForgeError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        ForgeError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            ForgeError::Resolution { .. }
            | ForgeError::Network { .. }
            | ForgeError::DirtyCheckout { .. } => exit_codes::RESOLUTION,
            ForgeError::Drift { .. } => exit_codes::DRIFT,
            ForgeError::BuildToolMissing { .. }
            | ForgeError::SourceTreeInvalid { .. }
            | ForgeError::CommandFailed { .. } => exit_codes::BUILD,
            ForgeError::ResourceMissing { .. } => exit_codes::PACKAGING,
            ForgeError::ValidationFailure { .. } => exit_codes::VALIDATION,
            ForgeError::Runtime(_) => exit_codes::RUNTIME,
            ForgeError::Config { .. } | ForgeError::Io { .. } => exit_codes::GENERAL,
        }
    }
}

pub type ForgeResult<T> = std::result::Result<T, ForgeError>;

/// Map an `anyhow` chain back onto a stable exit code.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<ForgeError>())
        .map(ForgeError::exit_code)
        .unwrap_or(exit_codes::GENERAL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn failure_classes_have_distinct_codes() {
        let resolution = ForgeError::Resolution {
            reference: "9.9.9".into(),
            detail: "no such tag".into(),
        };
        let validation = ForgeError::ValidationFailure {
            failures: 1,
            checks: vec!["server-bind".into()],
        };
        let runtime = ForgeError::Runtime("engine exited".into());
        let codes = [
            resolution.exit_code(),
            validation.exit_code(),
            runtime.exit_code(),
        ];
        assert_eq!(codes, [3, 7, 8]);
    }

    #[test]
    fn exit_code_survives_anyhow_context() {
        let err = Err::<(), _>(ForgeError::Drift {
            expected: "a".repeat(40),
            actual: "b".repeat(40),
            checkout: PathBuf::from("superset-src"),
        })
        .context("verify-sha")
        .unwrap_err();
        assert_eq!(exit_code_for(&err), exit_codes::DRIFT);

        let plain = anyhow::anyhow!("something else");
        assert_eq!(exit_code_for(&plain), exit_codes::GENERAL);
    }

    #[test]
    fn command_failure_names_the_command() {
        let err = ForgeError::CommandFailed {
            command: "npm ci".into(),
            status: Some(1),
            stderr: "ERESOLVE".into(),
        };
        let message = err.to_string();
        assert!(message.contains("npm ci"));
        assert!(message.contains("exit code 1"));
    }
}
