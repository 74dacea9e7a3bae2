use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{error, info, instrument};

use crate::config::ForgeConfig;
use crate::dist::{DistTarget, DistributionStage, PackagedArtifact};
use crate::error::{ForgeError, ForgeResult};
use crate::freeze::FreezeStage;
use crate::matrix::{self, MatrixRecorder, VersionMatrix};
use crate::observability::{MetricsCollector, MetricsSnapshot, StageOutcome};
use crate::pin::{PinRequest, PinStage};
use crate::platform::{CommandRunner, Tool, ToolTable};
use crate::stages::{AssetStage, LibraryStage};
use crate::validation::{ValidateStage, ValidationReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Pin,
    BuildAssets,
    BuildLibrary,
    PackageDistributions,
    PackageExecutable,
    Validate,
    Done,
    Failed,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PipelineState::Pin => "pin",
            PipelineState::BuildAssets => "build-assets",
            PipelineState::BuildLibrary => "build-library",
            PipelineState::PackageDistributions => "package-distributions",
            PipelineState::PackageExecutable => "package-executable",
            PipelineState::Validate => "validate",
            PipelineState::Done => "done",
            PipelineState::Failed => "failed",
        })
    }
}

/// Independent per-stage skip switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SkipFlags {
    pub pin: bool,
    pub frontend: bool,
    pub backend: bool,
    pub wheels: bool,
    pub exe: bool,
    pub verify: bool,
}

impl SkipFlags {
    pub fn skips(&self, state: PipelineState) -> bool {
        match state {
            PipelineState::Pin => self.pin,
            PipelineState::BuildAssets => self.frontend,
            PipelineState::BuildLibrary => self.backend,
            PipelineState::PackageDistributions => self.wheels,
            PipelineState::PackageExecutable => self.exe,
            PipelineState::Validate => self.verify,
            PipelineState::Done | PipelineState::Failed => false,
        }
    }

    /// Tools whose absence makes the enabled stages impossible. Wrapper-only
    /// wheels never read the checkout and so do not need git.
    pub fn required_tools(&self, target: DistTarget) -> Vec<Tool> {
        let mut tools = Vec::new();
        if !self.pin || !self.exe || (!self.wheels && target.includes_external()) {
            tools.push(Tool::Git);
        }
        if !self.frontend {
            tools.extend([Tool::Node, Tool::Npm]);
        }
        if !self.backend || !self.wheels || !self.exe {
            tools.push(Tool::Python);
        }
        tools
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildStageResult {
    pub stage_name: String,
    pub skipped: bool,
    pub succeeded: bool,
    pub duration: Duration,
    pub error_detail: Option<String>,
}

impl BuildStageResult {
    fn skipped(name: &str) -> Self {
        Self {
            stage_name: name.to_string(),
            skipped: true,
            succeeded: false,
            duration: Duration::ZERO,
            error_detail: None,
        }
    }
}

/// Everything a stage may read or update. Only the checkout on disk and the
/// version matrix outlive a run.
pub struct PipelineContext<'a> {
    pub config: &'a ForgeConfig,
    pub tools: &'a ToolTable,
    pub runner: &'a dyn CommandRunner,
    pub recorder: MatrixRecorder,
    pub pin_request: PinRequest,
    pub dist_target: DistTarget,
    pub toolchain_versions: BTreeMap<String, String>,
    pub matrix: Option<VersionMatrix>,
    pub artifacts: Vec<PackagedArtifact>,
    pub validation: Option<ValidationReport>,
}

impl<'a> PipelineContext<'a> {
    pub fn new(
        config: &'a ForgeConfig,
        tools: &'a ToolTable,
        runner: &'a dyn CommandRunner,
    ) -> ForgeResult<Self> {
        let recorder = MatrixRecorder::from_config(config);
        let matrix = recorder.load()?;
        Ok(Self {
            config,
            tools,
            runner,
            recorder,
            pin_request: PinRequest::branch(None),
            dist_target: DistTarget::Both,
            toolchain_versions: BTreeMap::new(),
            matrix,
            artifacts: Vec::new(),
            validation: None,
        })
    }

    pub fn with_pin_request(mut self, request: PinRequest) -> Self {
        self.pin_request = request;
        self
    }

    pub fn with_dist_target(mut self, target: DistTarget) -> Self {
        self.dist_target = target;
        self
    }

    pub fn with_toolchain_versions(mut self, versions: BTreeMap<String, String>) -> Self {
        self.toolchain_versions = versions;
        self
    }

    pub fn checkout(&self) -> PathBuf {
        self.config.checkout_dir()
    }

    pub fn require_matrix(&self) -> ForgeResult<&VersionMatrix> {
        self.matrix.as_ref().ok_or_else(|| ForgeError::Config {
            path: self.recorder.path().to_path_buf(),
            detail: "no version matrix recorded; run the pin stage first".into(),
        })
    }

    /// Fail with `Drift` unless the checkout is still at the recorded revision.
    pub fn verify_checkout(&self) -> ForgeResult<()> {
        matrix::verify(
            self.require_matrix()?,
            &self.checkout(),
            self.tools,
            self.runner,
        )
    }

    /// Record a toolchain version a stage actually used, re-writing the
    /// matrix only when the value changed.
    pub fn note_toolchain(&mut self, name: &str, version: &str) -> ForgeResult<()> {
        self.toolchain_versions
            .insert(name.to_string(), version.to_string());
        if let Some(matrix) = self.matrix.as_mut()
            && matrix.toolchain_versions.get(name).map(String::as_str) != Some(version)
        {
            matrix
                .toolchain_versions
                .insert(name.to_string(), version.to_string());
            self.recorder.record(matrix)?;
        }
        Ok(())
    }
}

pub trait Stage {
    fn name(&self) -> &'static str;
    fn state(&self) -> PipelineState;

    /// Stages that consume the checkout verify it has not drifted first.
    fn requires_pinned_checkout(&self, _ctx: &PipelineContext<'_>) -> bool {
        false
    }

    fn run(&self, ctx: &mut PipelineContext<'_>) -> ForgeResult<()>;
}

pub fn standard_stages() -> Vec<Box<dyn Stage>> {
    vec![
        Box::new(PinStage),
        Box::new(AssetStage),
        Box::new(LibraryStage),
        Box::new(DistributionStage),
        Box::new(FreezeStage),
        Box::new(ValidateStage),
    ]
}

#[derive(Debug)]
pub struct PipelineReport {
    pub results: Vec<BuildStageResult>,
    pub final_state: PipelineState,
    pub error: Option<ForgeError>,
    pub metrics: MetricsSnapshot,
}

impl PipelineReport {
    pub fn succeeded(&self) -> bool {
        self.final_state == PipelineState::Done
    }

    pub fn failed_stage(&self) -> Option<&BuildStageResult> {
        self.results
            .iter()
            .find(|result| !result.skipped && !result.succeeded)
    }
}

pub struct PipelineExecutor {
    stages: Vec<Box<dyn Stage>>,
    skips: SkipFlags,
    metrics: MetricsCollector,
}

impl PipelineExecutor {
    pub fn new(stages: Vec<Box<dyn Stage>>, skips: SkipFlags) -> Self {
        Self {
            stages,
            skips,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn standard(skips: SkipFlags) -> Self {
        Self::new(standard_stages(), skips)
    }

    /// Run stages in order, stopping at the first failure.
    #[instrument(skip_all)]
    pub fn execute(&self, ctx: &mut PipelineContext<'_>) -> PipelineReport {
        self.metrics.reset();
        let total_start = Instant::now();
        let mut results = Vec::with_capacity(self.stages.len());
        let mut failure = None;

        for stage in &self.stages {
            if self.skips.skips(stage.state()) {
                info!(stage = stage.name(), "Stage skipped");
                self.metrics.record_skipped(stage.name());
                results.push(BuildStageResult::skipped(stage.name()));
                continue;
            }

            let span = tracing::span!(tracing::Level::INFO, "stage", stage = stage.name());
            let _span_guard = span.enter();
            info!("Stage started");
            let timer = self.metrics.start_stage(stage.name());

            match run_stage(stage.as_ref(), ctx) {
                Ok(()) => {
                    let duration = timer.finish(StageOutcome::Succeeded);
                    info!(duration_ms = duration.as_millis() as u64, "Stage succeeded");
                    results.push(BuildStageResult {
                        stage_name: stage.name().to_string(),
                        skipped: false,
                        succeeded: true,
                        duration,
                        error_detail: None,
                    });
                }
                Err(err) => {
                    let duration = timer.finish(StageOutcome::Failed);
                    error!(error = %err, "Stage failed");
                    results.push(BuildStageResult {
                        stage_name: stage.name().to_string(),
                        skipped: false,
                        succeeded: false,
                        duration,
                        error_detail: Some(err.to_string()),
                    });
                    failure = Some(err);
                    break;
                }
            }
        }

        self.metrics.record_total_duration(total_start.elapsed());
        let final_state = if failure.is_some() {
            PipelineState::Failed
        } else {
            PipelineState::Done
        };
        PipelineReport {
            results,
            final_state,
            error: failure,
            metrics: self.metrics.snapshot(),
        }
    }
}

fn run_stage(stage: &dyn Stage, ctx: &mut PipelineContext<'_>) -> ForgeResult<()> {
    if stage.requires_pinned_checkout(ctx) {
        ctx.verify_checkout()?;
    }
    stage.run(ctx)
}
