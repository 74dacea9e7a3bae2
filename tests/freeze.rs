mod common;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use common::{ScriptedRunner, unix_tools};
use reportforge::error::{ForgeError, exit_codes};
use reportforge::freeze::{BundleManifest, FreezeManifest, FrozenPackager, ResourceSpec};
use reportforge::matrix::VersionMatrix;
use reportforge::pin::{PinnedRevision, ReferenceKind};
use reportforge::platform::{CommandOutput, Tool};
use reportforge::runtime::{ExecutionMode, RuntimeContext, RuntimeOverrides};
use tempfile::{TempDir, tempdir};

const ID: &str = "0123456789abcdef0123456789abcdef01234567";

fn resource(name: &str, subdir: &str, min_files: usize) -> ResourceSpec {
    ResourceSpec {
        logical_name: name.into(),
        module: "superset".into(),
        subdir: PathBuf::from(subdir),
        dest: Path::new("superset").join(subdir),
        min_files,
    }
}

fn fill(dir: &Path, files: usize) {
    fs::create_dir_all(dir).unwrap();
    for idx in 0..files {
        fs::write(dir.join(format!("{idx:03}.py")), "").unwrap();
    }
}

struct Fixture {
    temp: TempDir,
    manifest: FreezeManifest,
}

impl Fixture {
    fn new(migrations: usize) -> Self {
        let temp = tempdir().unwrap();
        let installed = temp.path().join("site-packages/superset");
        fill(&installed.join("migrations/versions"), migrations);
        fill(&installed.join("templates/superset"), 2);
        let launcher = temp.path().join("reportgui-built");
        fs::write(&launcher, "#!/bin/sh\n").unwrap();

        let manifest = FreezeManifest {
            launcher: Some(launcher),
            resources: vec![
                resource("migration-scripts", "migrations/versions", 3),
                resource("templates", "templates", 1),
            ],
            ..FreezeManifest::default()
        };
        Self { temp, manifest }
    }

    fn bundle_root(&self) -> PathBuf {
        self.temp.path().join("dist/exe/pyPASreporterGUI")
    }

    fn site(&self) -> PathBuf {
        self.temp.path().join("site-packages")
    }
}

/// Answers module lookups from the fixture's site-packages and fakes the
/// freeze tool by dropping an engine binary into `--distpath`.
fn fake_python(site: PathBuf) -> ScriptedRunner {
    ScriptedRunner::new(move |invocation| {
        let args: Vec<&str> = invocation.args.iter().map(String::as_str).collect();
        match invocation.tool {
            Some(Tool::Python) if args.first() == Some(&"-c") => {
                let module = args.last().unwrap();
                let path = site.join(module);
                if path.is_dir() {
                    CommandOutput::ok(format!("{}\n", path.display()))
                } else {
                    CommandOutput::ok("\n")
                }
            }
            Some(Tool::Freezer) => {
                let dist = args
                    .windows(2)
                    .find(|pair| pair[0] == "--distpath")
                    .map(|pair| PathBuf::from(pair[1]))
                    .unwrap();
                fs::create_dir_all(dist.join("engine")).unwrap();
                fs::write(dist.join("engine/engine"), "").unwrap();
                CommandOutput::ok("")
            }
            _ => CommandOutput::failed(1, "unexpected"),
        }
    })
}

fn matrix() -> VersionMatrix {
    VersionMatrix::new(
        PinnedRevision {
            reference_kind: ReferenceKind::LatestTag,
            requested_value: String::new(),
            resolved_id: ID.into(),
            resolved_display_name: "4.1.1".into(),
        },
        "4.1.1",
        BTreeMap::new(),
        "0.1.0",
    )
}

#[test]
fn bundle_carries_resources_and_manifest() {
    let fixture = Fixture::new(5);
    let runner = fake_python(fixture.site());
    let tools = unix_tools();
    let packager = FrozenPackager::new(
        &tools,
        &runner,
        &fixture.manifest,
        fixture.bundle_root(),
        fixture.temp.path().join("dist/exe/build"),
    );

    let artifact = packager.package(&matrix()).unwrap();

    let root = fixture.bundle_root();
    assert_eq!(artifact.location, root);
    assert!(root.join("reportgui").is_file());
    assert!(root.join("engine/engine").is_file());
    let versions = root.join("engine/_internal/superset/migrations/versions");
    assert_eq!(fs::read_dir(&versions).unwrap().count(), 5);

    let bundle = BundleManifest::load(&root).unwrap().unwrap();
    assert_eq!(bundle.resolved_id, ID);
    assert_eq!(bundle.resources, artifact.bundled_resource_manifest);
    let scripts = &bundle.resources[0];
    assert_eq!(scripts.logical_name, "migration-scripts");
    assert!(scripts.present);
    assert_eq!(scripts.count, Some(5));

    let freeze_call = runner
        .calls()
        .into_iter()
        .find(|call| call.contains("PyInstaller"))
        .unwrap();
    assert!(freeze_call.contains("--hidden-import superset.migrations"));
    assert!(freeze_call.contains("--copy-metadata duckdb-engine"));

    let context = RuntimeContext::resolve(&RuntimeOverrides {
        bundle_root: Some(root.clone()),
        home: Some(fixture.temp.path().join("home")),
        ..RuntimeOverrides::default()
    })
    .unwrap();
    assert_eq!(context.execution_mode, ExecutionMode::Frozen);
    assert_eq!(context.base_resource_root, root.join("engine/_internal"));
}

#[test]
fn missing_installed_directory_fails_before_freezing() {
    let fixture = Fixture::new(5);
    fs::remove_dir_all(fixture.site().join("superset/templates")).unwrap();
    let runner = fake_python(fixture.site());
    let tools = unix_tools();

    let err = FrozenPackager::new(
        &tools,
        &runner,
        &fixture.manifest,
        fixture.bundle_root(),
        fixture.temp.path().join("build"),
    )
    .package(&matrix())
    .unwrap_err();

    match &err {
        ForgeError::ResourceMissing { logical_name, .. } => assert_eq!(logical_name, "templates"),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.exit_code(), exit_codes::PACKAGING);
    assert_eq!(runner.count_matching("PyInstaller"), 0);
    assert!(!fixture.bundle_root().exists());
}

#[test]
fn too_few_migration_scripts_is_a_packaging_error() {
    let fixture = Fixture::new(2);
    let runner = fake_python(fixture.site());
    let tools = unix_tools();

    let err = FrozenPackager::new(
        &tools,
        &runner,
        &fixture.manifest,
        fixture.bundle_root(),
        fixture.temp.path().join("build"),
    )
    .package(&matrix())
    .unwrap_err();

    match err {
        ForgeError::ResourceMissing {
            logical_name,
            detail,
            ..
        } => {
            assert_eq!(logical_name, "migration-scripts");
            assert!(detail.contains("found 2 files"), "{detail}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn uninstalled_module_is_reported_by_name() {
    let fixture = Fixture::new(5);
    let runner = fake_python(fixture.temp.path().join("empty-site"));
    let tools = unix_tools();

    let err = FrozenPackager::new(
        &tools,
        &runner,
        &fixture.manifest,
        fixture.bundle_root(),
        fixture.temp.path().join("build"),
    )
    .package(&matrix())
    .unwrap_err();
    assert!(err.to_string().contains("module 'superset' is not installed"), "{err}");
}
