mod common;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use common::{ScriptedRunner, git_args, unix_tools};
use reportforge::config::ForgeConfig;
use reportforge::dist::DistributionStage;
use reportforge::error::{ForgeError, ForgeResult, exit_codes};
use reportforge::freeze::FreezeStage;
use reportforge::matrix::{MatrixRecorder, VersionMatrix};
use reportforge::pin::{PinnedRevision, ReferenceKind};
use reportforge::pipeline::{
    PipelineContext, PipelineExecutor, PipelineState, SkipFlags, Stage,
};
use reportforge::platform::CommandOutput;
use tempfile::tempdir;

type Journal = Arc<Mutex<Vec<&'static str>>>;

struct Recording {
    name: &'static str,
    state: PipelineState,
    fail: bool,
    journal: Journal,
}

impl Stage for Recording {
    fn name(&self) -> &'static str {
        self.name
    }

    fn state(&self) -> PipelineState {
        self.state
    }

    fn run(&self, _ctx: &mut PipelineContext<'_>) -> ForgeResult<()> {
        self.journal.lock().unwrap().push(self.name);
        if self.fail {
            return Err(ForgeError::SourceTreeInvalid {
                root: "superset-frontend".into(),
                expected: "package.json".into(),
            });
        }
        Ok(())
    }
}

fn stages(journal: &Journal, failing: Option<PipelineState>) -> Vec<Box<dyn Stage>> {
    [
        ("pin", PipelineState::Pin),
        ("build-assets", PipelineState::BuildAssets),
        ("build-library", PipelineState::BuildLibrary),
        ("package-distributions", PipelineState::PackageDistributions),
        ("package-executable", PipelineState::PackageExecutable),
        ("validate", PipelineState::Validate),
    ]
    .into_iter()
    .map(|(name, state)| {
        Box::new(Recording {
            name,
            state,
            fail: failing == Some(state),
            journal: journal.clone(),
        }) as Box<dyn Stage>
    })
    .collect()
}

fn config_in(root: &std::path::Path) -> ForgeConfig {
    ForgeConfig {
        root: root.to_path_buf(),
        ..ForgeConfig::default()
    }
}

fn head_runner(head: &'static str) -> ScriptedRunner {
    ScriptedRunner::new(move |invocation| match git_args(invocation).as_slice() {
        ["rev-parse", "HEAD"] => CommandOutput::ok(format!("{head}\n")),
        other => CommandOutput::failed(1, format!("unexpected call: {other:?}")),
    })
}

fn record_matrix(config: &ForgeConfig, id: &str) {
    let matrix = VersionMatrix::new(
        PinnedRevision {
            reference_kind: ReferenceKind::ExplicitId,
            requested_value: id.to_string(),
            resolved_id: id.to_string(),
            resolved_display_name: id[..12].to_string(),
        },
        "4.1.1",
        BTreeMap::new(),
        "0.1.0",
    );
    MatrixRecorder::from_config(config).record(&matrix).unwrap();
}

#[test]
fn skipped_stages_are_never_reported_as_succeeded() {
    let temp = tempdir().unwrap();
    let config = config_in(temp.path());
    let tools = unix_tools();
    let runner = head_runner("unused");
    let journal = Journal::default();
    let skips = SkipFlags {
        frontend: true,
        exe: true,
        ..SkipFlags::default()
    };

    let mut ctx = PipelineContext::new(&config, &tools, &runner).unwrap();
    let report = PipelineExecutor::new(stages(&journal, None), skips).execute(&mut ctx);

    assert!(report.succeeded());
    assert!(report.error.is_none());
    assert!(report.failed_stage().is_none());
    for result in &report.results {
        if result.skipped {
            assert!(!result.succeeded, "{} skipped but succeeded", result.stage_name);
        }
    }
    assert_eq!(
        *journal.lock().unwrap(),
        vec!["pin", "build-library", "package-distributions", "validate"]
    );
    assert_eq!(report.metrics.stages_skipped, 2);
    assert_eq!(report.metrics.stages_succeeded, 4);
}

#[test]
fn a_failing_stage_stops_the_pipeline() {
    let temp = tempdir().unwrap();
    let config = config_in(temp.path());
    let tools = unix_tools();
    let runner = head_runner("unused");
    let journal = Journal::default();

    let mut ctx = PipelineContext::new(&config, &tools, &runner).unwrap();
    let report = PipelineExecutor::new(
        stages(&journal, Some(PipelineState::BuildAssets)),
        SkipFlags::default(),
    )
    .execute(&mut ctx);

    assert_eq!(report.final_state, PipelineState::Failed);
    assert_eq!(*journal.lock().unwrap(), vec!["pin", "build-assets"]);
    assert_eq!(report.results.len(), 2);
    let failed = report.failed_stage().unwrap();
    assert_eq!(failed.stage_name, "build-assets");
    assert!(failed.error_detail.as_deref().unwrap().contains("package.json"));
    assert_eq!(
        report.error.as_ref().map(ForgeError::exit_code),
        Some(exit_codes::BUILD)
    );
}

#[test]
fn drift_blocks_distribution_packaging() {
    let temp = tempdir().unwrap();
    let config = config_in(temp.path());
    record_matrix(&config, "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
    let tools = unix_tools();
    let runner = head_runner("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb");

    let mut ctx = PipelineContext::new(&config, &tools, &runner).unwrap();
    let report = PipelineExecutor::new(
        vec![Box::new(DistributionStage), Box::new(FreezeStage)],
        SkipFlags::default(),
    )
    .execute(&mut ctx);

    assert!(matches!(report.error, Some(ForgeError::Drift { .. })));
    assert_eq!(
        report.error.as_ref().map(ForgeError::exit_code),
        Some(exit_codes::DRIFT)
    );
    assert_eq!(report.results.len(), 1);
    // Only the HEAD lookup ran; nothing was built.
    assert_eq!(runner.calls().len(), 1);
}

#[test]
fn packaging_without_a_recorded_matrix_fails() {
    let temp = tempdir().unwrap();
    let config = config_in(temp.path());
    let tools = unix_tools();
    let runner = head_runner("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");

    let mut ctx = PipelineContext::new(&config, &tools, &runner).unwrap();
    let report =
        PipelineExecutor::new(vec![Box::new(FreezeStage)], SkipFlags::default()).execute(&mut ctx);

    assert!(matches!(report.error, Some(ForgeError::Config { .. })));
    assert!(runner.calls().is_empty());
}

#[test]
fn toolchain_notes_rewrite_the_matrix_only_on_change() {
    let temp = tempdir().unwrap();
    let config = config_in(temp.path());
    record_matrix(&config, "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
    let tools = unix_tools();
    let runner = head_runner("unused");

    let mut ctx = PipelineContext::new(&config, &tools, &runner).unwrap();
    ctx.note_toolchain("node", "v20.11.1").unwrap();

    let reloaded = MatrixRecorder::from_config(&config).require().unwrap();
    assert_eq!(
        reloaded.toolchain_versions.get("node").map(String::as_str),
        Some("v20.11.1")
    );
    assert!(temp.path().join("docs").join("VERSION_MATRIX.md").is_file());
}
