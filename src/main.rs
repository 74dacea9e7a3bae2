use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand, ValueHint};
use reportforge::config::{DEFAULT_CONFIG_FILE, ForgeConfig};
use reportforge::dist::{ArtifactKind, DistTarget, DistributionStage, PackagedArtifact};
use reportforge::error::{ForgeError, exit_code_for};
use reportforge::freeze::{FreezeStage, count_files};
use reportforge::matrix::{self, MatrixRecorder};
use reportforge::observability::{log_snapshot, write_snapshot};
use reportforge::pin::{PinRequest, PinStage};
use reportforge::pipeline::{
    PipelineContext, PipelineExecutor, PipelineReport, SkipFlags, Stage,
};
use reportforge::platform::{SystemRunner, Tool, ToolTable};
use reportforge::preflight::run_preflight;
use reportforge::validation::{ArtifactValidator, ValidateStage};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

fn main() {
    let cli = Cli::parse();
    if let Err(err) = configure_tracing() {
        eprintln!("warning: {err}");
    }

    if let Err(err) = run(cli) {
        error!(error = %format!("{err:#}"), "Command failed");
        eprintln!("error: {err:#}");
        std::process::exit(exit_code_for(&err));
    }
}

fn configure_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|err| anyhow!(err.to_string()))
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli.config)?;
    match cli.command {
        Commands::Build(args) => build(&config, args),
        Commands::Pin { reference } => {
            let run = StageRun::new(vec![Box::new(PinStage)], &[Tool::Git])
                .pin_request(reference.request());
            let (report, _) = run.execute(&config)?;
            finish(report)
        }
        Commands::VerifySha => verify_sha(&config),
        Commands::Wheels { target } => {
            let target = target.target();
            let wheels_only = SkipFlags {
                pin: true,
                frontend: true,
                backend: true,
                wheels: false,
                exe: true,
                verify: true,
            };
            let run = StageRun::new(
                vec![Box::new(DistributionStage)],
                &wheels_only.required_tools(target),
            )
            .dist_target(target);
            let (report, artifacts) = run.execute(&config)?;
            print_artifacts(&artifacts);
            finish(report)
        }
        Commands::Freeze => {
            let run = StageRun::new(vec![Box::new(FreezeStage)], &[Tool::Git, Tool::Python]);
            let (report, artifacts) = run.execute(&config)?;
            print_artifacts(&artifacts);
            finish(report)
        }
        Commands::Validate { bundle } => validate(&config, bundle),
        Commands::CheckConfig => {
            // load_config already rejected errors.
            info!(file = %cli.config.display(), "Configuration is valid");
            Ok(())
        }
    }
}

fn load_config(path: &Path) -> Result<ForgeConfig> {
    let config = ForgeConfig::load_or_default(path)?;
    if !path.exists() {
        warn!(file = %path.display(), "Config file not found; using built-in defaults");
    }
    let report = config.validate();
    for warning in &report.warnings {
        warn!(file = %path.display(), "{warning}");
    }
    if report.is_ok() {
        return Ok(config);
    }
    for error_msg in &report.errors {
        error!(file = %path.display(), "{error_msg}");
    }
    Err(ForgeError::Config {
        path: path.to_path_buf(),
        detail: format!("{} error(s): {}", report.errors.len(), report.errors.join("; ")),
    }
    .into())
}

/// A fixed stage list run outside `build`, with its own preflight.
struct StageRun {
    stages: Vec<Box<dyn Stage>>,
    required: Vec<Tool>,
    pin_request: PinRequest,
    dist_target: DistTarget,
}

impl StageRun {
    fn new(stages: Vec<Box<dyn Stage>>, required: &[Tool]) -> Self {
        Self {
            stages,
            required: required.to_vec(),
            pin_request: PinRequest::branch(None),
            dist_target: DistTarget::Both,
        }
    }

    fn pin_request(mut self, request: PinRequest) -> Self {
        self.pin_request = request;
        self
    }

    fn dist_target(mut self, target: DistTarget) -> Self {
        self.dist_target = target;
        self
    }

    fn execute(self, config: &ForgeConfig) -> Result<(PipelineReport, Vec<PackagedArtifact>)> {
        let tools = ToolTable::detect(&config.root);
        let runner = SystemRunner;
        let preflight = run_preflight(&tools, &runner, &self.required)?;
        let mut ctx = PipelineContext::new(config, &tools, &runner)?
            .with_pin_request(self.pin_request)
            .with_dist_target(self.dist_target)
            .with_toolchain_versions(preflight.versions);
        let report = PipelineExecutor::new(self.stages, SkipFlags::default()).execute(&mut ctx);
        Ok((report, std::mem::take(&mut ctx.artifacts)))
    }
}

fn build(config: &ForgeConfig, args: BuildArgs) -> Result<()> {
    let skips = args.skips();
    let tools = ToolTable::detect(&config.root);
    let runner = SystemRunner;
    let target = args.target.target();
    let preflight = run_preflight(&tools, &runner, &skips.required_tools(target))?;

    let mut ctx = PipelineContext::new(config, &tools, &runner)?
        .with_pin_request(args.reference.request())
        .with_dist_target(target)
        .with_toolchain_versions(preflight.versions);
    let executor = PipelineExecutor::standard(skips);
    let report = executor.execute(&mut ctx);

    log_snapshot(&report.metrics);
    if let Some(path) = &args.metrics_json {
        write_snapshot(&report.metrics, path)
            .with_context(|| format!("Failed to write metrics JSON: {}", path.display()))?;
        info!(metrics = %path.display(), "Metrics JSON written");
    }

    println!();
    println!("Build summary:");
    for result in &report.results {
        let status = if result.skipped {
            "skipped"
        } else if result.succeeded {
            "ok"
        } else {
            "FAILED"
        };
        println!(
            "  {:<22} {:<8} {:>8.1}s",
            result.stage_name,
            status,
            result.duration.as_secs_f64()
        );
    }
    print_artifacts(&ctx.artifacts);
    if let Some(matrix) = &ctx.matrix {
        println!(
            "  pinned {} ({})",
            matrix.pinned_revision.resolved_display_name,
            matrix.resolved_id()
        );
    }
    if report.succeeded() {
        println!();
        println!("Next steps:");
        println!("  install wheels:  pip install {}/*.whl", config.dist.output.display());
        println!(
            "  run the bundle:  {}/reportgui run",
            config.freeze.bundle_root(config).display()
        );
    }

    finish(report)
}

fn finish(report: PipelineReport) -> Result<()> {
    let stage = report
        .failed_stage()
        .map(|r| r.stage_name.clone())
        .unwrap_or_else(|| "pipeline".into());
    match report.error {
        Some(err) => Err(anyhow::Error::new(err).context(format!("stage '{stage}' failed"))),
        None => Ok(()),
    }
}

fn print_artifacts(artifacts: &[PackagedArtifact]) {
    for artifact in artifacts {
        match artifact.kind {
            ArtifactKind::LibraryDistribution => {
                let size = std::fs::metadata(&artifact.location)
                    .map(|m| m.len())
                    .unwrap_or(0);
                println!(
                    "  wheel   {} ({:.1} MiB)",
                    artifact.location.display(),
                    size as f64 / (1024.0 * 1024.0)
                );
            }
            ArtifactKind::FrozenExecutable => {
                println!(
                    "  bundle  {} ({} files, {} bundled resources)",
                    artifact.location.display(),
                    count_files(&artifact.location),
                    artifact.bundled_resource_manifest.len()
                );
            }
        }
    }
}

fn verify_sha(config: &ForgeConfig) -> Result<()> {
    let tools = ToolTable::detect(&config.root);
    let runner = SystemRunner;
    let recorder = MatrixRecorder::from_config(config);
    let recorded = recorder.require()?;
    let checkout = config.checkout_dir();
    matrix::verify(&recorded, &checkout, &tools, &runner)?;
    println!(
        "{} is at {} ({})",
        checkout.display(),
        recorded.resolved_id(),
        recorded.pinned_revision.resolved_display_name
    );
    Ok(())
}

fn validate(config: &ForgeConfig, bundle: Option<PathBuf>) -> Result<()> {
    let Some(bundle) = bundle else {
        let (report, _) = StageRun::new(vec![Box::new(ValidateStage)], &[]).execute(config)?;
        return finish(report);
    };

    let runner = SystemRunner;
    let matrix = MatrixRecorder::from_config(config).load()?;
    let scratch = bundle
        .parent()
        .map(|parent| parent.join("validate-home"))
        .unwrap_or_else(|| PathBuf::from("validate-home"));
    let report = ArtifactValidator::new(&runner, &config.validation, bundle, scratch)
        .with_matrix(matrix.as_ref())
        .validate();
    for check in &report.checks {
        let mark = if check.passed { "ok  " } else { "FAIL" };
        println!("  {mark} {:<40} {}", check.name, check.detail);
    }
    report.into_result()?;
    Ok(())
}

#[derive(Parser)]
#[command(
    name = "reportforge",
    version,
    about = "Reproducible build pipeline for the pyPASreporterGUI analytics bundle"
)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "REPORTFORGE_CONFIG",
        default_value = DEFAULT_CONFIG_FILE,
        value_hint = ValueHint::FilePath
    )]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline.
    Build(BuildArgs),
    /// Pin the external checkout and record the version matrix.
    Pin {
        #[command(flatten)]
        reference: ReferenceArgs,
    },
    /// Check the checkout still matches the recorded version matrix.
    VerifySha,
    /// Build wheel distributions.
    Wheels {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Package the frozen executable bundle.
    Freeze,
    /// Run the artifact checks against a bundle.
    Validate {
        #[arg(long, value_hint = ValueHint::DirPath)]
        bundle: Option<PathBuf>,
    },
    /// Report configuration problems.
    CheckConfig,
}

#[derive(Args)]
struct BuildArgs {
    #[arg(long)]
    skip_pin: bool,
    #[arg(long)]
    skip_frontend: bool,
    #[arg(long)]
    skip_backend: bool,
    #[arg(long)]
    skip_wheels: bool,
    #[arg(long)]
    skip_exe: bool,
    #[arg(long)]
    skip_verify: bool,
    #[command(flatten)]
    reference: ReferenceArgs,
    #[command(flatten)]
    target: TargetArgs,
    #[arg(long = "metrics-json")]
    metrics_json: Option<PathBuf>,
}

impl BuildArgs {
    fn skips(&self) -> SkipFlags {
        SkipFlags {
            pin: self.skip_pin,
            frontend: self.skip_frontend,
            backend: self.skip_backend,
            wheels: self.skip_wheels,
            exe: self.skip_exe,
            verify: self.skip_verify,
        }
    }
}

#[derive(Args)]
struct ReferenceArgs {
    /// Pin the highest release tag.
    #[arg(long, conflicts_with_all = ["sha", "branch"])]
    latest_tag: bool,
    /// Pin an explicit commit id.
    #[arg(long, conflicts_with = "branch")]
    sha: Option<String>,
    /// Pin the tip of a branch (default branch when omitted).
    #[arg(long)]
    branch: Option<String>,
}

impl ReferenceArgs {
    fn request(&self) -> PinRequest {
        PinRequest::from_flags(self.latest_tag, self.sha.clone(), self.branch.clone())
    }
}

#[derive(Args)]
struct TargetArgs {
    #[arg(long, conflicts_with = "wrapper_only")]
    external_only: bool,
    #[arg(long)]
    wrapper_only: bool,
}

impl TargetArgs {
    fn target(&self) -> DistTarget {
        DistTarget::from_flags(self.external_only, self.wrapper_only)
    }
}
