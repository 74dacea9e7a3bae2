use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::error::{ForgeError, ForgeResult};
use crate::freeze::count_files;
use crate::platform::CommandRunner;
use crate::runtime::{AppInstance, config};
use crate::validation::CheckResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminAccount {
    pub username: String,
    pub password: String,
    pub email: String,
    pub firstname: String,
    pub lastname: String,
}

impl Default for AdminAccount {
    fn default() -> Self {
        Self {
            username: "admin".into(),
            password: "admin".into(),
            email: "admin@pypasreportergui.local".into(),
            firstname: "pyPASreporterGUI".into(),
            lastname: "Admin".into(),
        }
    }
}

impl AdminAccount {
    /// `SUPERSET_ADMIN_*` variables win over whatever was passed in.
    pub fn with_env_overrides(mut self) -> Self {
        let read = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());
        if let Some(username) = read("SUPERSET_ADMIN_USERNAME") {
            self.username = username;
        }
        if let Some(password) = read("SUPERSET_ADMIN_PASSWORD") {
            self.password = password;
        }
        if let Some(email) = read("SUPERSET_ADMIN_EMAIL") {
            self.email = email;
        }
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    pub admin: AdminAccount,
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitOutcome {
    Initialized { database: PathBuf, admin_created: bool },
    AlreadyInitialized { database: PathBuf },
}

/// Run migrations and create the admin account. An existing database is left
/// untouched unless `force` is set.
#[instrument(skip_all, fields(force = opts.force))]
pub fn init(
    app: &AppInstance,
    runner: &dyn CommandRunner,
    opts: &InitOptions,
) -> ForgeResult<InitOutcome> {
    let ctx = app.context();
    let database = ctx.database_path();
    if database.exists() && !opts.force {
        info!(path = %database.display(), "Database already initialized; pass --force to redo");
        return Ok(InitOutcome::AlreadyInitialized { database });
    }
    if opts.force {
        config::ensure_config(ctx, true)?;
    }

    for args in [vec!["db", "upgrade"], vec!["init"]] {
        let invocation = app.engine_invocation(args).inherit_output();
        info!(command = %invocation, "Running engine command");
        runner
            .run_checked(&invocation)
            .map_err(|err| ForgeError::Runtime(format!("initialization failed: {err}")))?;
    }

    let admin_created = create_admin(app, runner, &opts.admin);
    Ok(InitOutcome::Initialized {
        database,
        admin_created,
    })
}

/// A failure here usually means the account exists already, so it is logged
/// and the caller carries on.
fn create_admin(app: &AppInstance, runner: &dyn CommandRunner, admin: &AdminAccount) -> bool {
    let invocation = app.engine_invocation([
        "fab",
        "create-admin",
        "--username",
        admin.username.as_str(),
        "--firstname",
        admin.firstname.as_str(),
        "--lastname",
        admin.lastname.as_str(),
        "--email",
        admin.email.as_str(),
        "--password",
        admin.password.as_str(),
    ]);
    match runner.run_checked(&invocation) {
        Ok(_) => {
            info!(username = admin.username.as_str(), "Admin account created");
            true
        }
        Err(err) => {
            warn!(error = %err, "Admin account may already exist or creation failed; continuing");
            false
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub host: String,
    pub port: u16,
    pub reload: bool,
    pub debug: bool,
    pub no_init: bool,
    pub admin: AdminAccount,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8088,
            reload: false,
            debug: false,
            no_init: false,
            admin: AdminAccount::default(),
        }
    }
}

/// Initialize if needed, then hand the foreground over to the engine's server.
#[instrument(skip_all, fields(host = opts.host.as_str(), port = opts.port))]
pub fn run(app: &AppInstance, runner: &dyn CommandRunner, opts: &RunOptions) -> ForgeResult<()> {
    if !opts.no_init {
        init(
            app,
            runner,
            &InitOptions {
                admin: opts.admin.clone(),
                force: false,
            },
        )?;
    }

    let port = opts.port.to_string();
    let mut args = vec![
        "run",
        "-h",
        opts.host.as_str(),
        "-p",
        port.as_str(),
        "--with-threads",
    ];
    if opts.reload {
        if app.context().is_frozen() {
            warn!("Auto-reload is unavailable in a frozen bundle; ignoring --reload");
        } else {
            args.push("--reload");
        }
    }
    if opts.debug {
        args.push("--debugger");
    }

    let mut invocation = app.engine_invocation(args).inherit_output();
    if opts.debug {
        invocation = invocation
            .env("FLASK_ENV", "development")
            .env("FLASK_DEBUG", "1");
    }
    info!(url = %format!("http://{}:{}", opts.host, opts.port), "Server starting");
    runner
        .serve(&invocation)
        .map_err(|err| ForgeError::Runtime(format!("server exited: {err}")))
}

#[derive(Debug, Clone, Serialize)]
pub struct DoctorReport {
    pub app_version: String,
    pub execution_mode: String,
    pub executable: Option<PathBuf>,
    pub bundle_root: Option<PathBuf>,
    pub home_directory: PathBuf,
    pub config_path: PathBuf,
    pub database_path: PathBuf,
    pub resolved_id: Option<String>,
    pub external_version: Option<String>,
    pub engine: String,
    pub checks: Vec<CheckResult>,
}

impl DoctorReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|check| check.passed)
    }

    pub fn into_result(self) -> ForgeResult<Self> {
        let failed: Vec<&str> = self
            .checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| c.name.as_str())
            .collect();
        if failed.is_empty() {
            return Ok(self);
        }
        Err(ForgeError::Runtime(format!(
            "doctor found {} failing check(s): {}",
            failed.len(),
            failed.join(", ")
        )))
    }
}

pub fn doctor(app: &AppInstance, runner: &dyn CommandRunner) -> DoctorReport {
    let ctx = app.context();
    let mut checks = vec![
        CheckResult::exists("home-directory", &ctx.home_directory),
        CheckResult::exists("config-file", &ctx.config_path),
    ];

    if ctx.is_frozen() {
        match (&ctx.bundle_root, &ctx.bundle) {
            (Some(root), Some(bundle)) => {
                for entry in &bundle.resources {
                    checks.push(resource_check(root, &entry.logical_name, &entry.path, entry.count));
                }
            }
            (Some(root), None) => checks.push(CheckResult::fail(
                "bundle-manifest",
                format!("no bundle manifest under {}", root.display()),
            )),
            _ => {}
        }
    }
    checks.push(CheckResult::exists(
        "branding-static",
        &ctx.branding_static_dir(),
    ));

    let probe = app.engine_invocation(["version"]);
    checks.push(match runner.run_checked(&probe) {
        Ok(_) => CheckResult::pass("engine", format!("`{probe}` exited 0")),
        Err(err) => CheckResult::fail("engine", err.to_string()),
    });

    DoctorReport {
        app_version: env!("CARGO_PKG_VERSION").to_string(),
        execution_mode: format!("{:?}", ctx.execution_mode).to_lowercase(),
        executable: std::env::current_exe().ok(),
        bundle_root: ctx.bundle_root.clone(),
        home_directory: ctx.home_directory.clone(),
        config_path: ctx.config_path.clone(),
        database_path: ctx.database_path(),
        resolved_id: ctx.bundle.as_ref().map(|b| b.resolved_id.clone()),
        external_version: ctx.bundle.as_ref().map(|b| b.external_version.clone()),
        engine: app.engine().program.display().to_string(),
        checks,
    }
}

fn resource_check(root: &Path, name: &str, relative: &Path, recorded: Option<usize>) -> CheckResult {
    let path = root.join(relative);
    if !path.exists() {
        return CheckResult::fail(name, format!("{} is missing", path.display()));
    }
    let count = count_files(&path);
    match recorded {
        Some(expected) if count < expected => CheckResult::fail(
            name,
            format!("{} holds {count} files, bundle recorded {expected}", path.display()),
        ),
        _ => CheckResult::pass(name, format!("{} ({count} files)", path.display())),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DuckDbRegistration {
    pub name: String,
    pub path: PathBuf,
    pub uri: String,
    pub exists: bool,
    pub registered: bool,
}

pub fn duckdb_uri(path: &Path, read_only: bool) -> String {
    let path = path.to_string_lossy().replace('\\', "/");
    if read_only {
        format!("duckdb:///{path}?read_only=true")
    } else {
        format!("duckdb:///{path}")
    }
}

/// Build the connection URI and register it with the engine when the local
/// database has been initialized. Registration failures leave the manual
/// route open and are not fatal.
pub fn add_duckdb(
    app: &AppInstance,
    runner: &dyn CommandRunner,
    path: &Path,
    name: Option<&str>,
    read_only: bool,
) -> ForgeResult<DuckDbRegistration> {
    let path = std::path::absolute(path)
        .map_err(|err| ForgeError::io(format!("failed to resolve {}", path.display()), err))?;
    let exists = path.exists();
    if !exists {
        warn!(path = %path.display(), "DuckDB file does not exist yet; it is created on first write");
    }
    let name = name
        .map(str::to_string)
        .or_else(|| path.file_stem().map(|s| s.to_string_lossy().to_string()))
        .unwrap_or_else(|| "duckdb".to_string());
    let uri = duckdb_uri(&path, read_only);

    let mut registered = false;
    if app.context().database_path().exists() {
        let invocation =
            app.engine_invocation(["set-database-uri", "-d", name.as_str(), "-u", uri.as_str()]);
        match runner.run_checked(&invocation) {
            Ok(_) => {
                info!(name = name.as_str(), "DuckDB database registered");
                registered = true;
            }
            Err(err) => warn!(error = %err, "Could not register database; add it through the UI"),
        }
    } else {
        info!("Engine database not initialized; run `reportgui init` first");
    }

    Ok(DuckDbRegistration {
        name,
        path,
        uri,
        exists,
        registered,
    })
}
