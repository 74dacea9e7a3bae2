use std::path::PathBuf;

use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand, ValueHint};
use reportforge::error::exit_code_for;
use reportforge::platform::SystemRunner;
use reportforge::runtime::commands::{
    self, AdminAccount, InitOptions, InitOutcome, RunOptions,
};
use reportforge::runtime::{app_instance, config::APP_NAME};
use tracing::error;
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
    let app = app_instance()?;
    let runner = SystemRunner;

    match cli.command {
        Commands::Run {
            port,
            host,
            reload,
            debug,
            no_init,
        } => {
            let ctx = app.context();
            println!("Starting {APP_NAME} at http://{host}:{port}");
            println!("  config: {}", ctx.config_path.display());
            println!("  home:   {}", ctx.home_directory.display());
            let opts = RunOptions {
                host,
                port,
                reload,
                debug,
                no_init,
                admin: AdminAccount::default().with_env_overrides(),
            };
            commands::run(app, &runner, &opts)?;
        }
        Commands::Init {
            admin_username,
            admin_password,
            admin_email,
            force,
        } => {
            let admin = AdminAccount {
                username: admin_username,
                password: admin_password,
                email: admin_email,
                ..AdminAccount::default()
            }
            .with_env_overrides();
            let outcome = commands::init(app, &runner, &InitOptions { admin, force })?;
            match outcome {
                InitOutcome::Initialized {
                    database,
                    admin_created,
                } => {
                    println!("{APP_NAME} initialized");
                    println!("  config:   {}", app.context().config_path.display());
                    println!("  database: {}", database.display());
                    if !admin_created {
                        println!("  admin account was not created (it may already exist)");
                    }
                }
                InitOutcome::AlreadyInitialized { database } => {
                    println!(
                        "{APP_NAME} already initialized at {}; use --force to re-run",
                        database.display()
                    );
                }
            }
        }
        Commands::Doctor { json } => {
            let report = commands::doctor(app, &runner);
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{APP_NAME} {} doctor", report.app_version);
                println!("  execution mode: {}", report.execution_mode);
                if let Some(exe) = &report.executable {
                    println!("  executable:     {}", exe.display());
                }
                if let Some(root) = &report.bundle_root {
                    println!("  bundle root:    {}", root.display());
                }
                println!("  home:           {}", report.home_directory.display());
                println!("  config:         {}", report.config_path.display());
                println!("  database:       {}", report.database_path.display());
                if let Some(id) = &report.resolved_id {
                    println!(
                        "  built from:     {id} ({})",
                        report.external_version.as_deref().unwrap_or("unknown")
                    );
                }
                println!("  engine:         {}", report.engine);
                println!();
                for check in &report.checks {
                    let mark = if check.passed { "ok  " } else { "FAIL" };
                    println!("  {mark} {:<28} {}", check.name, check.detail);
                }
            }
            report.into_result()?;
        }
        Commands::AddDuckdb {
            path,
            name,
            read_only,
        } => {
            let registration =
                commands::add_duckdb(app, &runner, &path, name.as_deref(), read_only)?;
            println!("Name: {}", registration.name);
            println!("Path: {}", registration.path.display());
            println!("SQLAlchemy URI:");
            println!("  {}", registration.uri);
            if registration.registered {
                println!("Database '{}' registered.", registration.name);
            } else {
                println!();
                println!("To add it by hand: Data > Databases > + Database, choose 'Other',");
                println!("enter the display name and paste the URI above.");
            }
        }
    }
    Ok(())
}

#[derive(Parser)]
#[command(
    name = "reportgui",
    version,
    about = "pyPASreporterGUI: a branded analytics server with DuckDB support"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize if needed and start the server.
    Run {
        #[arg(long, short = 'p', default_value_t = 8088)]
        port: u16,
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, short = 'r')]
        reload: bool,
        #[arg(long, short = 'd')]
        debug: bool,
        #[arg(long)]
        no_init: bool,
    },
    /// Run migrations and create the admin account.
    Init {
        #[arg(long, default_value = "admin")]
        admin_username: String,
        #[arg(long, default_value = "admin")]
        admin_password: String,
        #[arg(long, default_value = "admin@pypasreportergui.local")]
        admin_email: String,
        #[arg(long, short = 'f')]
        force: bool,
    },
    /// Print paths and versions and run sanity checks.
    Doctor {
        #[arg(long)]
        json: bool,
    },
    /// Register a DuckDB file as a database connection.
    AddDuckdb {
        #[arg(long, short = 'p', value_hint = ValueHint::FilePath)]
        path: PathBuf,
        #[arg(long, short = 'n')]
        name: Option<String>,
        #[arg(long, short = 'r')]
        read_only: bool,
    },
}
