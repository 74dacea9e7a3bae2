use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::ForgeConfig;
use crate::error::{ForgeError, ForgeResult};
use crate::pipeline::{PipelineContext, PipelineState, Stage};
use crate::platform::{CommandRunner, Tool, ToolTable};
use crate::security::write_checksums;

pub const CHECKSUM_FILE: &str = "SHA256SUMS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    LibraryDistribution,
    FrozenExecutable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceEntry {
    pub logical_name: String,
    pub path: PathBuf,
    pub present: bool,
    pub count: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackagedArtifact {
    pub kind: ArtifactKind,
    pub location: PathBuf,
    #[serde(default)]
    pub bundled_resource_manifest: Vec<ResourceEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistTarget {
    External,
    Wrapper,
    #[default]
    Both,
}

impl DistTarget {
    pub fn from_flags(external_only: bool, wrapper_only: bool) -> Self {
        match (external_only, wrapper_only) {
            (true, false) => DistTarget::External,
            (false, true) => DistTarget::Wrapper,
            _ => DistTarget::Both,
        }
    }

    pub fn includes_external(&self) -> bool {
        matches!(self, DistTarget::External | DistTarget::Both)
    }

    pub fn includes_wrapper(&self) -> bool {
        matches!(self, DistTarget::Wrapper | DistTarget::Both)
    }
}

const BUILD_DESCRIPTORS: [&str; 2] = ["pyproject.toml", "setup.py"];

pub fn has_build_descriptor(project: &Path) -> bool {
    BUILD_DESCRIPTORS
        .iter()
        .any(|name| project.join(name).is_file())
}

pub struct DistributionPackager<'a> {
    tools: &'a ToolTable,
    runner: &'a dyn CommandRunner,
    output: PathBuf,
}

impl<'a> DistributionPackager<'a> {
    pub fn new(tools: &'a ToolTable, runner: &'a dyn CommandRunner, output: PathBuf) -> Self {
        Self {
            tools,
            runner,
            output,
        }
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Build the requested distributions into the output directory and
    /// refresh its checksum listing. Returns only wheels produced by this call.
    pub fn package(
        &self,
        config: &ForgeConfig,
        target: DistTarget,
    ) -> ForgeResult<Vec<PackagedArtifact>> {
        std::fs::create_dir_all(&self.output).map_err(|err| {
            ForgeError::io(format!("failed to create {}", self.output.display()), err)
        })?;
        let before = self.list_wheels()?;

        if target.includes_external() {
            let checkout = config.checkout_dir();
            self.build_project(&checkout)?;
            for sub in &config.external.sub_packages {
                let dir = checkout.join(&sub.dir);
                if has_build_descriptor(&dir) {
                    self.build_project(&dir)?;
                } else {
                    info!(package = %sub.name, "Sub-package not present in checkout; skipping");
                }
            }
        }

        if target.includes_wrapper() {
            self.build_project(&config.resolve(&config.wrapper.source_dir))?;
        }

        let after = self.list_wheels()?;
        let produced: Vec<PathBuf> = after
            .iter()
            .filter(|(path, modified)| before.get(*path) != Some(*modified))
            .map(|(path, _)| path.clone())
            .collect();
        if produced.is_empty() {
            return Err(ForgeError::SourceTreeInvalid {
                root: self.output.clone(),
                expected: "at least one wheel produced by the build".into(),
            });
        }

        let all: Vec<PathBuf> = after.into_keys().collect();
        write_checksums(&all, &self.output.join(CHECKSUM_FILE))?;

        for wheel in &produced {
            info!(wheel = %wheel.display(), "Built distribution");
        }
        Ok(produced
            .into_iter()
            .map(|location| PackagedArtifact {
                kind: ArtifactKind::LibraryDistribution,
                location,
                bundled_resource_manifest: Vec::new(),
            })
            .collect())
    }

    fn list_wheels(&self) -> ForgeResult<BTreeMap<PathBuf, SystemTime>> {
        let pattern = format!(
            "{}/*.whl",
            glob::Pattern::escape(&self.output.to_string_lossy())
        );
        let mut wheels = BTreeMap::new();
        let entries = glob::glob(&pattern).map_err(|err| ForgeError::Config {
            path: self.output.clone(),
            detail: format!("invalid output directory pattern: {err}"),
        })?;
        for path in entries.flatten() {
            let modified = std::fs::metadata(&path)
                .and_then(|meta| meta.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            wheels.insert(path, modified);
        }
        Ok(wheels)
    }

    fn build_project(&self, project: &Path) -> ForgeResult<()> {
        if !has_build_descriptor(project) {
            return Err(ForgeError::SourceTreeInvalid {
                root: project.to_path_buf(),
                expected: "pyproject.toml or setup.py".into(),
            });
        }
        self.clean_project(project)?;

        let project_arg = project.to_string_lossy().to_string();
        let output_arg = self.output.to_string_lossy().to_string();
        let invocation = if self.tools.is_available(Tool::Uv, self.runner) {
            self.tools.invocation(
                Tool::Uv,
                ["build", "--wheel", "--out-dir", output_arg.as_str(), project_arg.as_str()],
            )
        } else if self.python_build_available() {
            self.tools.invocation(
                Tool::Python,
                ["-m", "build", "--wheel", "--outdir", output_arg.as_str(), project_arg.as_str()],
            )
        } else {
            return Err(ForgeError::BuildToolMissing {
                tool: "build".into(),
                detail: "neither `uv` nor `python -m build` is available".into(),
            });
        };

        info!(project = %project.display(), command = %invocation, "Building wheel");
        self.runner.run_checked(&invocation.inherit_output())?;
        Ok(())
    }

    fn python_build_available(&self) -> bool {
        let probe = self
            .tools
            .invocation(Tool::Python, ["-m", "build", "--version"]);
        matches!(self.runner.run(&probe), Ok(output) if output.success())
    }

    /// Remove leftovers from earlier builds. `dist/` is kept when the wheel
    /// output lives inside it.
    fn clean_project(&self, project: &Path) -> ForgeResult<()> {
        let mut stale = vec![project.join("build")];
        let dist = project.join("dist");
        if !self.output.starts_with(&dist) {
            stale.push(dist);
        }
        let egg_pattern = format!(
            "{}/*.egg-info",
            glob::Pattern::escape(&project.to_string_lossy())
        );
        if let Ok(paths) = glob::glob(&egg_pattern) {
            stale.extend(paths.flatten());
        }
        for path in stale.into_iter().filter(|p| p.is_dir()) {
            debug!(path = %path.display(), "Removing stale build output");
            std::fs::remove_dir_all(&path).map_err(|err| {
                ForgeError::io(format!("failed to remove {}", path.display()), err)
            })?;
        }
        Ok(())
    }
}

pub struct DistributionStage;

impl Stage for DistributionStage {
    fn name(&self) -> &'static str {
        "package-distributions"
    }

    fn state(&self) -> PipelineState {
        PipelineState::PackageDistributions
    }

    fn requires_pinned_checkout(&self, ctx: &PipelineContext<'_>) -> bool {
        ctx.dist_target.includes_external()
    }

    fn run(&self, ctx: &mut PipelineContext<'_>) -> ForgeResult<()> {
        let packager = DistributionPackager::new(
            ctx.tools,
            ctx.runner,
            ctx.config.resolve(&ctx.config.dist.output),
        );
        let artifacts = packager.package(ctx.config, ctx.dist_target)?;
        ctx.artifacts.extend(artifacts);
        Ok(())
    }
}
