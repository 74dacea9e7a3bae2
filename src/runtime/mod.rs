//! Artifact-side resolution: where resources live, where user state lives,
//! and the single process-wide application instance built from them.

pub mod commands;
pub mod config;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use once_cell::sync::OnceCell;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{ForgeError, ForgeResult};
use crate::freeze::{BUNDLE_MANIFEST_FILE, BundleManifest, ENGINE_NAME};
use crate::platform::{HostPlatform, Invocation};

pub const HOME_ENV: &str = "REPORTFORGE_HOME";
pub const RESOURCE_ROOT_ENV: &str = "REPORTFORGE_RESOURCE_ROOT";
pub const BUNDLE_ROOT_ENV: &str = "REPORTFORGE_BUNDLE_ROOT";
pub const ENGINE_ENV: &str = "REPORTFORGE_ENGINE";
pub const PYTHON_ENV: &str = "REPORTFORGE_PYTHON";

pub const CONFIG_FILE: &str = "superset_config.py";
pub const DATABASE_FILE: &str = "superset.db";
const ENGINE_MODULE: &str = "superset.cli.main";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Frozen,
    Normal,
}

/// Explicit inputs to resolution. `from_env` reads the process environment;
/// tests build one directly.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub home: Option<PathBuf>,
    pub resource_root: Option<PathBuf>,
    pub bundle_root: Option<PathBuf>,
    pub engine: Option<PathBuf>,
    pub python: Option<String>,
    /// Directory probed for the bundle marker; defaults to the executable's.
    pub exe_dir: Option<PathBuf>,
}

impl RuntimeOverrides {
    pub fn from_env() -> Self {
        let path = |key: &str| {
            std::env::var_os(key)
                .filter(|value| !value.is_empty())
                .map(PathBuf::from)
        };
        Self {
            home: path(HOME_ENV),
            resource_root: path(RESOURCE_ROOT_ENV),
            bundle_root: path(BUNDLE_ROOT_ENV),
            engine: path(ENGINE_ENV),
            python: std::env::var(PYTHON_ENV).ok().filter(|v| !v.trim().is_empty()),
            exe_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RuntimeContext {
    pub execution_mode: ExecutionMode,
    pub base_resource_root: PathBuf,
    pub config_path: PathBuf,
    pub home_directory: PathBuf,
    pub bundle_root: Option<PathBuf>,
    #[serde(skip)]
    pub bundle: Option<BundleManifest>,
}

impl RuntimeContext {
    pub fn resolve(overrides: &RuntimeOverrides) -> ForgeResult<Self> {
        let exe_dir = match &overrides.exe_dir {
            Some(dir) => Some(dir.clone()),
            None => std::env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(Path::to_path_buf)),
        };

        let bundle_root = overrides.bundle_root.clone().or_else(|| {
            exe_dir
                .as_ref()
                .filter(|dir| dir.join(BUNDLE_MANIFEST_FILE).is_file())
                .cloned()
        });

        let (execution_mode, base_resource_root, bundle) = match &bundle_root {
            Some(root) => {
                let bundle = BundleManifest::load(root)?;
                let resource_root = bundle
                    .as_ref()
                    .map(|b| b.resource_root.clone())
                    .unwrap_or_else(|| Path::new(ENGINE_NAME).join("_internal"));
                (ExecutionMode::Frozen, root.join(resource_root), bundle)
            }
            None => {
                let root = overrides
                    .resource_root
                    .clone()
                    .or_else(|| exe_dir.clone())
                    .unwrap_or_else(|| PathBuf::from("."));
                (ExecutionMode::Normal, root, None)
            }
        };

        let home_directory = match &overrides.home {
            Some(home) => home.clone(),
            None => default_home()?,
        };

        Ok(Self {
            execution_mode,
            base_resource_root,
            config_path: home_directory.join(CONFIG_FILE),
            home_directory,
            bundle_root,
            bundle,
        })
    }

    pub fn is_frozen(&self) -> bool {
        self.execution_mode == ExecutionMode::Frozen
    }

    pub fn database_path(&self) -> PathBuf {
        self.home_directory.join(DATABASE_FILE)
    }

    /// Directory served under the branding static prefix.
    pub fn branding_static_dir(&self) -> PathBuf {
        self.base_resource_root
            .join("pypasreportergui")
            .join("branding")
            .join("static")
    }
}

fn default_home() -> ForgeResult<PathBuf> {
    let base = directories::BaseDirs::new()
        .ok_or_else(|| ForgeError::Runtime("could not resolve the user home directory".into()))?;
    Ok(base.home_dir().join(".reportforge"))
}

/// How the wrapped engine's CLI is launched in this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCommand {
    pub program: PathBuf,
    pub prefix: Vec<String>,
}

impl EngineCommand {
    pub fn resolve(context: &RuntimeContext, overrides: &RuntimeOverrides) -> Self {
        if let Some(engine) = &overrides.engine {
            return Self {
                program: engine.clone(),
                prefix: Vec::new(),
            };
        }
        if let (Some(root), ExecutionMode::Frozen) = (&context.bundle_root, context.execution_mode) {
            let relative = context
                .bundle
                .as_ref()
                .map(|b| b.engine.clone())
                .unwrap_or_else(|| {
                    Path::new(ENGINE_NAME)
                        .join(HostPlatform::current().executable_name(ENGINE_NAME))
                });
            return Self {
                program: root.join(relative),
                prefix: Vec::new(),
            };
        }
        let python = overrides.python.clone().unwrap_or_else(|| {
            match HostPlatform::current() {
                HostPlatform::Windows => "python".to_string(),
                HostPlatform::Unix => "python3".to_string(),
            }
        });
        Self {
            program: PathBuf::from(python),
            prefix: vec!["-m".into(), ENGINE_MODULE.into()],
        }
    }
}

/// The one application instance per process. Constructing a second one
/// would re-run engine registration against shared state, so it is only
/// reachable through [`app_instance`] and [`app_instance_with`].
#[derive(Debug)]
pub struct AppInstance {
    context: RuntimeContext,
    engine: EngineCommand,
    environment: Vec<(String, String)>,
}

static INSTANCE: OnceCell<AppInstance> = OnceCell::new();
static CONSTRUCTIONS: AtomicUsize = AtomicUsize::new(0);

pub fn app_instance() -> ForgeResult<&'static AppInstance> {
    app_instance_with(&RuntimeOverrides::from_env())
}

/// The first successful call decides the instance; later overrides are ignored.
pub fn app_instance_with(overrides: &RuntimeOverrides) -> ForgeResult<&'static AppInstance> {
    INSTANCE.get_or_try_init(|| AppInstance::construct(overrides))
}

/// How many instances this process has constructed.
pub fn construction_count() -> usize {
    CONSTRUCTIONS.load(Ordering::SeqCst)
}

impl AppInstance {
    fn construct(overrides: &RuntimeOverrides) -> ForgeResult<Self> {
        let context = RuntimeContext::resolve(overrides)?;
        std::fs::create_dir_all(&context.home_directory).map_err(|err| {
            ForgeError::io(
                format!("failed to create {}", context.home_directory.display()),
                err,
            )
        })?;
        config::ensure_config(&context, false)?;

        let engine = EngineCommand::resolve(&context, overrides);
        let environment = engine_environment(&context);
        CONSTRUCTIONS.fetch_add(1, Ordering::SeqCst);
        info!(
            mode = ?context.execution_mode,
            home = %context.home_directory.display(),
            resources = %context.base_resource_root.display(),
            "Application instance constructed"
        );
        Ok(Self {
            context,
            engine,
            environment,
        })
    }

    pub fn context(&self) -> &RuntimeContext {
        &self.context
    }

    pub fn engine(&self) -> &EngineCommand {
        &self.engine
    }

    pub fn environment(&self) -> &[(String, String)] {
        &self.environment
    }

    /// Engine CLI invocation carrying the runtime environment.
    pub fn engine_invocation<I, S>(&self, args: I) -> Invocation
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut all_args = self.engine.prefix.clone();
        all_args.extend(args.into_iter().map(Into::into));
        let mut invocation = Invocation::new(self.engine.program.to_string_lossy(), all_args)
            .current_dir(&self.context.home_directory);
        for (key, value) in &self.environment {
            invocation = invocation.env(key.clone(), value.clone());
        }
        debug!(command = %invocation, "Engine invocation prepared");
        invocation
    }
}

fn engine_environment(context: &RuntimeContext) -> Vec<(String, String)> {
    let path = |p: &Path| p.to_string_lossy().to_string();
    let mut env = vec![
        ("SUPERSET_CONFIG_PATH".to_string(), path(&context.config_path)),
        ("SUPERSET_HOME".to_string(), path(&context.home_directory)),
        (HOME_ENV.to_string(), path(&context.home_directory)),
        (RESOURCE_ROOT_ENV.to_string(), path(&context.base_resource_root)),
    ];
    if std::env::var_os("FLASK_ENV").is_none() {
        env.push(("FLASK_ENV".to_string(), "production".to_string()));
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn marker_next_to_executable_selects_frozen_mode() {
        let temp = tempdir().unwrap();
        let bundle = temp.path().join("bundle");
        std::fs::create_dir_all(&bundle).unwrap();
        std::fs::write(bundle.join(BUNDLE_MANIFEST_FILE), "{").unwrap();

        // A malformed marker is reported, never silently treated as normal mode.
        let overrides = RuntimeOverrides {
            home: Some(temp.path().join("home")),
            exe_dir: Some(bundle.clone()),
            ..RuntimeOverrides::default()
        };
        assert!(RuntimeContext::resolve(&overrides).is_err());
    }

    #[test]
    fn explicit_bundle_root_without_manifest_uses_default_layout() {
        let temp = tempdir().unwrap();
        let overrides = RuntimeOverrides {
            home: Some(temp.path().join("home")),
            bundle_root: Some(temp.path().join("bundle")),
            exe_dir: Some(temp.path().to_path_buf()),
            ..RuntimeOverrides::default()
        };
        let context = RuntimeContext::resolve(&overrides).unwrap();
        assert_eq!(context.execution_mode, ExecutionMode::Frozen);
        assert_eq!(
            context.base_resource_root,
            temp.path().join("bundle").join("engine").join("_internal")
        );

        let engine = EngineCommand::resolve(&context, &overrides);
        assert!(engine.program.starts_with(temp.path().join("bundle").join("engine")));
        assert!(engine.prefix.is_empty());
    }

    #[test]
    fn normal_mode_runs_engine_module_through_python() {
        let temp = tempdir().unwrap();
        let overrides = RuntimeOverrides {
            home: Some(temp.path().join("home")),
            resource_root: Some(temp.path().join("share")),
            python: Some("/opt/venv/bin/python".into()),
            exe_dir: Some(temp.path().to_path_buf()),
            ..RuntimeOverrides::default()
        };
        let context = RuntimeContext::resolve(&overrides).unwrap();
        assert_eq!(context.execution_mode, ExecutionMode::Normal);
        assert_eq!(context.base_resource_root, temp.path().join("share"));
        assert_eq!(context.config_path, temp.path().join("home").join(CONFIG_FILE));

        let engine = EngineCommand::resolve(&context, &overrides);
        assert_eq!(engine.program, PathBuf::from("/opt/venv/bin/python"));
        assert_eq!(engine.prefix, vec!["-m", "superset.cli.main"]);
    }
}
