use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::error::{ForgeError, ForgeResult};
use crate::platform::{CommandRunner, Tool, ToolTable};

/// Tools whose versions are recorded in the version matrix.
pub const RECORDED_TOOLS: [Tool; 5] = [Tool::Python, Tool::Node, Tool::Npm, Tool::Git, Tool::Uv];

#[derive(Debug, Clone, Default)]
pub struct PreflightReport {
    pub versions: BTreeMap<String, String>,
    pub missing: Vec<Tool>,
}

/// Probe every recorded tool, failing only when one of `required` is absent.
pub fn run_preflight(
    tools: &ToolTable,
    runner: &dyn CommandRunner,
    required: &[Tool],
) -> ForgeResult<PreflightReport> {
    let mut report = PreflightReport::default();

    for tool in RECORDED_TOOLS {
        match tools.probe_version(tool, runner) {
            Ok(version) => {
                info!(tool = tool.name(), %version, "Tool available");
                report.versions.insert(tool.name().to_string(), version);
            }
            Err(err) => {
                if required.contains(&tool) {
                    return Err(match err {
                        ForgeError::BuildToolMissing { .. } => err,
                        other => ForgeError::BuildToolMissing {
                            tool: tool.name().to_string(),
                            detail: other.to_string(),
                        },
                    });
                }
                warn!(tool = tool.name(), "Optional tool unavailable");
                report.missing.push(tool);
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{CommandOutput, HostPlatform, Invocation};

    struct OnlyGitAndPython;

    impl CommandRunner for OnlyGitAndPython {
        fn run(&self, invocation: &Invocation) -> ForgeResult<CommandOutput> {
            match invocation.program.as_str() {
                "git" => Ok(CommandOutput::ok("git version 2.43.0\n")),
                "python3" => Ok(CommandOutput::ok("Python 3.11.9\n")),
                other => Err(ForgeError::BuildToolMissing {
                    tool: other.to_string(),
                    detail: "not found".into(),
                }),
            }
        }
    }

    #[test]
    fn records_versions_and_tolerates_optional_gaps() {
        let tools = ToolTable::for_host(HostPlatform::Unix, "python3");
        let report = run_preflight(&tools, &OnlyGitAndPython, &[Tool::Git]).unwrap();
        assert_eq!(report.versions.get("git").map(String::as_str), Some("2.43.0"));
        assert_eq!(report.versions.get("python").map(String::as_str), Some("3.11.9"));
        assert!(report.missing.contains(&Tool::Npm));
        assert!(!report.versions.contains_key("uv"));
    }

    #[test]
    fn required_tool_absence_is_fatal() {
        let tools = ToolTable::for_host(HostPlatform::Unix, "python3");
        let err = run_preflight(&tools, &OnlyGitAndPython, &[Tool::Npm]).unwrap_err();
        assert!(matches!(err, ForgeError::BuildToolMissing { ref tool, .. } if tool == "npm"));
    }
}
