use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::config::{ConfigReport, ForgeConfig};
use crate::dist::{ArtifactKind, PackagedArtifact, ResourceEntry};
use crate::error::{ForgeError, ForgeResult};
use crate::matrix::VersionMatrix;
use crate::pipeline::{PipelineContext, PipelineState, Stage};
use crate::platform::{CommandRunner, HostPlatform, Tool, ToolTable};
use crate::security::write_atomic;

/// Marker written at the bundle root. Its presence next to the launcher is
/// what makes the runtime treat the process as frozen.
pub const BUNDLE_MANIFEST_FILE: &str = "reportforge-bundle.json";
pub const MANIFEST_VERSION: u32 = 1;
pub const ENGINE_NAME: &str = "engine";
pub const LAUNCHER_NAME: &str = "reportgui";

/// Modules and resource directories the freeze tool cannot discover on its
/// own. Every entry here is something that works unfrozen and breaks frozen
/// when missing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FreezeManifest {
    pub manifest_version: u32,
    pub name: String,
    /// `module:callable` frozen as the engine executable.
    pub engine_entry: String,
    pub launcher: Option<PathBuf>,
    pub output: PathBuf,
    /// Bundle-relative directory resources are copied under.
    pub resource_root: PathBuf,
    pub hidden_imports: Vec<String>,
    pub metadata_distributions: Vec<String>,
    pub resources: Vec<ResourceSpec>,
}

impl Default for FreezeManifest {
    fn default() -> Self {
        let superset = |logical: &str, subdir: &str, min_files: usize| ResourceSpec {
            logical_name: logical.into(),
            module: "superset".into(),
            subdir: PathBuf::from(subdir),
            dest: Path::new("superset").join(subdir),
            min_files,
        };
        Self {
            manifest_version: MANIFEST_VERSION,
            name: "pyPASreporterGUI".into(),
            engine_entry: "superset.cli.main:superset".into(),
            launcher: None,
            output: PathBuf::from("dist/exe"),
            resource_root: Path::new(ENGINE_NAME).join("_internal"),
            hidden_imports: [
                "superset.cli.main",
                "superset.app",
                "superset.migrations",
                "alembic",
                "alembic.runtime.migration",
                "flask_migrate",
                "flask_appbuilder",
                "flask_limiter",
                "jinja2.ext",
                "sqlalchemy.dialects.sqlite",
                "duckdb",
                "duckdb_engine",
                "pypasreportergui",
                "pypasreportergui.branding.blueprint",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            metadata_distributions: ["apache-superset", "duckdb-engine", "SQLAlchemy"]
                .into_iter()
                .map(String::from)
                .collect(),
            resources: vec![
                superset("migrations", "migrations", 1),
                superset("migration-scripts", "migrations/versions", 100),
                superset("templates", "templates", 1),
                superset("static-assets", "static/assets", 1),
                superset("translations", "translations", 1),
                ResourceSpec {
                    logical_name: "branding".into(),
                    module: "pypasreportergui".into(),
                    subdir: PathBuf::from("branding/static"),
                    dest: PathBuf::from("pypasreportergui/branding/static"),
                    min_files: 1,
                },
            ],
        }
    }
}

impl FreezeManifest {
    pub fn check(&self) -> ConfigReport {
        let mut report = ConfigReport::default();
        if self.manifest_version != MANIFEST_VERSION {
            report.errors.push(format!(
                "freeze.manifest_version {} is not supported (expected {MANIFEST_VERSION})",
                self.manifest_version
            ));
        }
        if self.hidden_imports.is_empty() {
            report
                .errors
                .push("freeze.hidden_imports is empty; dynamically loaded modules would be dropped".into());
        }
        if !self.engine_entry.contains(':') {
            report.errors.push(format!(
                "freeze.engine_entry '{}' must be written as module:callable",
                self.engine_entry
            ));
        }
        if self.resource_root.is_absolute() {
            report
                .errors
                .push("freeze.resource_root must be relative to the bundle root".into());
        }
        if self.resources.is_empty() {
            report
                .warnings
                .push("freeze.resources is empty; no data files will be bundled".into());
        }
        let mut destinations = BTreeSet::new();
        for resource in &self.resources {
            if !destinations.insert(resource.dest.clone()) {
                report.errors.push(format!(
                    "freeze.resources has more than one entry targeting {}",
                    resource.dest.display()
                ));
            }
            if resource.dest.is_absolute() {
                report.errors.push(format!(
                    "freeze resource '{}' must use a relative destination",
                    resource.logical_name
                ));
            }
        }
        report
    }

    pub fn bundle_root(&self, config: &ForgeConfig) -> PathBuf {
        config.resolve(&self.output).join(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub logical_name: String,
    /// Installed module whose location anchors `subdir`.
    pub module: String,
    pub subdir: PathBuf,
    pub dest: PathBuf,
    #[serde(default)]
    pub min_files: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleManifest {
    pub manifest_version: u32,
    pub app_name: String,
    pub app_version: String,
    pub resolved_id: String,
    pub external_version: String,
    pub engine: PathBuf,
    pub resource_root: PathBuf,
    pub hidden_imports: Vec<String>,
    pub resources: Vec<ResourceEntry>,
    pub generated_at: DateTime<Utc>,
}

impl BundleManifest {
    pub fn path(bundle_root: &Path) -> PathBuf {
        bundle_root.join(BUNDLE_MANIFEST_FILE)
    }

    pub fn load(bundle_root: &Path) -> ForgeResult<Option<Self>> {
        let path = Self::path(bundle_root);
        if !path.is_file() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .map_err(|err| ForgeError::io(format!("failed to read {}", path.display()), err))?;
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|err| ForgeError::Config {
                path,
                detail: format!("malformed bundle manifest: {err}"),
            })
    }

    pub fn write(&self, bundle_root: &Path) -> ForgeResult<()> {
        let path = Self::path(bundle_root);
        let json = serde_json::to_vec_pretty(self).map_err(|err| ForgeError::Config {
            path: path.clone(),
            detail: format!("failed to serialise bundle manifest: {err}"),
        })?;
        write_atomic(&path, &json)
    }
}

/// Number of regular files under `dir`, recursively.
pub fn count_files(dir: &Path) -> usize {
    walk_files(dir).len()
}

fn walk_files(dir: &Path) -> Vec<PathBuf> {
    let pattern = format!("{}/**/*", glob::Pattern::escape(&dir.to_string_lossy()));
    match glob::glob(&pattern) {
        Ok(paths) => paths.flatten().filter(|p| p.is_file()).collect(),
        Err(_) => Vec::new(),
    }
}

fn copy_tree(src: &Path, dest: &Path) -> ForgeResult<usize> {
    let mut copied = 0;
    for file in walk_files(src) {
        let Ok(relative) = file.strip_prefix(src) else {
            continue;
        };
        let target = dest.join(relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|err| {
                ForgeError::io(format!("failed to create {}", parent.display()), err)
            })?;
        }
        std::fs::copy(&file, &target).map_err(|err| {
            ForgeError::io(
                format!("failed to copy {} to {}", file.display(), target.display()),
                err,
            )
        })?;
        copied += 1;
    }
    Ok(copied)
}

const LOCATE_MODULE: &str = "import importlib.util, os, sys\n\
spec = importlib.util.find_spec(sys.argv[1])\n\
print(os.path.dirname(spec.origin) if spec and spec.origin else '')";

const METADATA_HOOK: &str = r#"# Generated by reportforge. Puts the bundle root on the metadata search
# path so entry points such as SQLAlchemy dialects resolve when frozen.
import os
import sys

if getattr(sys, "frozen", False):
    _base = getattr(sys, "_MEIPASS", os.path.dirname(sys.executable))
    if _base not in sys.path:
        sys.path.insert(0, _base)
    try:
        import importlib.metadata as _metadata

        _original = _metadata.distributions

        def _distributions(**kwargs):
            if _base not in sys.path:
                sys.path.insert(0, _base)
            return _original(**kwargs)

        _metadata.distributions = _distributions
    except ImportError:
        pass
"#;

struct LocatedResource<'m> {
    spec: &'m ResourceSpec,
    source: PathBuf,
}

pub struct FrozenPackager<'a> {
    tools: &'a ToolTable,
    runner: &'a dyn CommandRunner,
    manifest: &'a FreezeManifest,
    bundle_root: PathBuf,
    work_dir: PathBuf,
}

impl<'a> FrozenPackager<'a> {
    pub fn new(
        tools: &'a ToolTable,
        runner: &'a dyn CommandRunner,
        manifest: &'a FreezeManifest,
        bundle_root: PathBuf,
        work_dir: PathBuf,
    ) -> Self {
        Self {
            tools,
            runner,
            manifest,
            bundle_root,
            work_dir,
        }
    }

    pub fn from_config(
        tools: &'a ToolTable,
        runner: &'a dyn CommandRunner,
        config: &'a ForgeConfig,
    ) -> Self {
        let manifest = &config.freeze;
        Self::new(
            tools,
            runner,
            manifest,
            manifest.bundle_root(config),
            config.resolve(&manifest.output).join("build"),
        )
    }

    pub fn bundle_root(&self) -> &Path {
        &self.bundle_root
    }

    #[instrument(skip_all, fields(bundle = %self.bundle_root.display()))]
    pub fn package(&self, matrix: &VersionMatrix) -> ForgeResult<PackagedArtifact> {
        // Layout problems surface before the slow freeze step runs.
        let located = self.locate_resources()?;
        let launcher = self.locate_launcher()?;

        std::fs::create_dir_all(&self.work_dir).map_err(|err| {
            ForgeError::io(format!("failed to create {}", self.work_dir.display()), err)
        })?;
        if self.bundle_root.exists() {
            std::fs::remove_dir_all(&self.bundle_root).map_err(|err| {
                ForgeError::io(
                    format!("failed to clear {}", self.bundle_root.display()),
                    err,
                )
            })?;
        }

        self.freeze_engine()?;

        let host = self.tools.host();
        let engine = Path::new(ENGINE_NAME).join(host.executable_name(ENGINE_NAME));
        if !self.bundle_root.join(&engine).is_file() {
            return Err(ForgeError::ResourceMissing {
                logical_name: "engine executable".into(),
                path: self.bundle_root.join(&engine),
                detail: "the freeze tool finished without producing the engine".into(),
            });
        }

        let mut entries = Vec::with_capacity(located.len());
        for resource in &located {
            let relative = self.manifest.resource_root.join(&resource.spec.dest);
            let target = self.bundle_root.join(&relative);
            let copied = copy_tree(&resource.source, &target)?;
            info!(
                resource = %resource.spec.logical_name,
                files = copied,
                "Bundled resource"
            );
            entries.push(ResourceEntry {
                logical_name: resource.spec.logical_name.clone(),
                path: relative,
                present: target.is_dir(),
                count: Some(count_files(&target)),
            });
        }

        let launcher_target = self.bundle_root.join(host.executable_name(LAUNCHER_NAME));
        std::fs::copy(&launcher, &launcher_target).map_err(|err| {
            ForgeError::io(
                format!("failed to copy launcher {}", launcher.display()),
                err,
            )
        })?;

        self.verify_entries(&entries)?;

        let bundle = BundleManifest {
            manifest_version: MANIFEST_VERSION,
            app_name: self.manifest.name.clone(),
            app_version: matrix.app_version.clone(),
            resolved_id: matrix.resolved_id().to_string(),
            external_version: matrix.external_version.clone(),
            engine,
            resource_root: self.manifest.resource_root.clone(),
            hidden_imports: self.manifest.hidden_imports.clone(),
            resources: entries.clone(),
            generated_at: Utc::now(),
        };
        bundle.write(&self.bundle_root)?;

        info!(resources = entries.len(), "Frozen bundle written");
        Ok(PackagedArtifact {
            kind: ArtifactKind::FrozenExecutable,
            location: self.bundle_root.clone(),
            bundled_resource_manifest: entries,
        })
    }

    /// Resolve every manifest resource against the installed distributions.
    /// Any gap is a hard error here rather than a runtime surprise.
    fn locate_resources(&self) -> ForgeResult<Vec<LocatedResource<'a>>> {
        let manifest: &'a FreezeManifest = self.manifest;
        let mut module_roots: BTreeMap<&str, PathBuf> = BTreeMap::new();
        let mut located = Vec::with_capacity(manifest.resources.len());

        for spec in &manifest.resources {
            let root = match module_roots.get(spec.module.as_str()) {
                Some(root) => root.clone(),
                None => {
                    let root = self.locate_module(spec)?;
                    module_roots.insert(spec.module.as_str(), root.clone());
                    root
                }
            };
            let source = root.join(&spec.subdir);
            if !source.is_dir() {
                return Err(ForgeError::ResourceMissing {
                    logical_name: spec.logical_name.clone(),
                    path: source,
                    detail: format!(
                        "installed '{}' has no {} directory; update the freeze manifest",
                        spec.module,
                        spec.subdir.display()
                    ),
                });
            }
            let count = count_files(&source);
            if count < spec.min_files {
                return Err(ForgeError::ResourceMissing {
                    logical_name: spec.logical_name.clone(),
                    path: source,
                    detail: format!("found {count} files, expected at least {}", spec.min_files),
                });
            }
            located.push(LocatedResource { spec, source });
        }
        Ok(located)
    }

    fn locate_module(&self, spec: &ResourceSpec) -> ForgeResult<PathBuf> {
        let invocation = self.tools.invocation(
            Tool::Python,
            ["-c", LOCATE_MODULE, spec.module.as_str()],
        );
        let output = self.runner.run(&invocation)?;
        let location = output.stdout.trim();
        if !output.success() || location.is_empty() {
            return Err(ForgeError::ResourceMissing {
                logical_name: spec.logical_name.clone(),
                path: PathBuf::from(&spec.module),
                detail: format!("module '{}' is not installed", spec.module),
            });
        }
        Ok(PathBuf::from(location))
    }

    fn locate_launcher(&self) -> ForgeResult<PathBuf> {
        let candidate = match &self.manifest.launcher {
            Some(path) => path.clone(),
            None => {
                let exe = std::env::current_exe()
                    .map_err(|err| ForgeError::io("failed to locate current executable", err))?;
                exe.with_file_name(HostPlatform::current().executable_name(LAUNCHER_NAME))
            }
        };
        if !candidate.is_file() {
            return Err(ForgeError::ResourceMissing {
                logical_name: "launcher".into(),
                path: candidate,
                detail: "build the reportgui binary or set freeze.launcher".into(),
            });
        }
        Ok(candidate)
    }

    fn freeze_engine(&self) -> ForgeResult<()> {
        let entry_script = self.work_dir.join("engine_entry.py");
        let hook = self.work_dir.join("rth_metadata.py");
        write_atomic(&entry_script, entry_script_source(&self.manifest.engine_entry).as_bytes())?;
        write_atomic(&hook, METADATA_HOOK.as_bytes())?;

        let mut args: Vec<String> = vec![
            "--noconfirm".into(),
            "--onedir".into(),
            "--clean".into(),
            "--name".into(),
            ENGINE_NAME.into(),
            "--distpath".into(),
            self.bundle_root.to_string_lossy().to_string(),
            "--workpath".into(),
            self.work_dir.join("pyinstaller").to_string_lossy().to_string(),
            "--specpath".into(),
            self.work_dir.to_string_lossy().to_string(),
            "--runtime-hook".into(),
            hook.to_string_lossy().to_string(),
        ];
        for module in &self.manifest.hidden_imports {
            args.push("--hidden-import".into());
            args.push(module.clone());
        }
        for dist in &self.manifest.metadata_distributions {
            args.push("--copy-metadata".into());
            args.push(dist.clone());
        }
        args.push(entry_script.to_string_lossy().to_string());

        let invocation = self.tools.invocation(Tool::Freezer, args);
        info!(command = %invocation, "Freezing engine");
        self.runner.run_checked(&invocation.inherit_output())?;
        Ok(())
    }

    fn verify_entries(&self, entries: &[ResourceEntry]) -> ForgeResult<()> {
        for (entry, spec) in entries.iter().zip(&self.manifest.resources) {
            let count = entry.count.unwrap_or(0);
            if !entry.present || count < spec.min_files {
                warn!(resource = %entry.logical_name, count, "Bundled resource incomplete");
                return Err(ForgeError::ResourceMissing {
                    logical_name: entry.logical_name.clone(),
                    path: self.bundle_root.join(&entry.path),
                    detail: format!(
                        "bundle holds {count} files, expected at least {}",
                        spec.min_files
                    ),
                });
            }
        }
        Ok(())
    }
}

fn entry_script_source(engine_entry: &str) -> String {
    let (module, callable) = engine_entry
        .split_once(':')
        .unwrap_or((engine_entry, "main"));
    format!(
        "# Generated by reportforge.\nimport sys\n\nfrom {module} import {callable} as _entry\n\n\
if __name__ == \"__main__\":\n    sys.exit(_entry())\n"
    )
}

pub struct FreezeStage;

impl Stage for FreezeStage {
    fn name(&self) -> &'static str {
        "package-executable"
    }

    fn state(&self) -> PipelineState {
        PipelineState::PackageExecutable
    }

    fn requires_pinned_checkout(&self, _ctx: &PipelineContext<'_>) -> bool {
        true
    }

    fn run(&self, ctx: &mut PipelineContext<'_>) -> ForgeResult<()> {
        let matrix = ctx.require_matrix()?.clone();
        let packager = FrozenPackager::from_config(ctx.tools, ctx.runner, ctx.config);
        let artifact = packager.package(&matrix)?;
        ctx.artifacts.push(artifact);
        Ok(())
    }
}
