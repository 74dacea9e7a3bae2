use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{ForgeError, ForgeResult};
use crate::runtime::RuntimeContext;
use crate::security::write_atomic;

pub const APP_NAME: &str = "pyPASreporterGUI";
pub const SECRET_FILE: &str = ".secret_key";
pub const SECRET_ENV: &str = "SUPERSET_SECRET_KEY";

/// Directories the engine expects under the home directory.
pub const STATE_DIRS: [&str; 6] = [
    "cache",
    "data_cache",
    "filter_cache",
    "explore_cache",
    "uploads",
    "logs",
];

// Paths are derived from the environment when the engine loads the file, so
// a relocated bundle or home directory keeps working without regeneration.
const TEMPLATE: &str = r#"# @APP_NAME@ engine configuration
# Generated by reportforge @APP_VERSION@. Regenerate with `reportgui init --force`.

import os
from pathlib import Path

_HOME = Path(os.environ.get("REPORTFORGE_HOME") or Path(__file__).resolve().parent)
_RESOURCES = Path(os.environ.get("REPORTFORGE_RESOURCE_ROOT") or _HOME)
_BRANDING_STATIC = _RESOURCES / "pypasreportergui" / "branding" / "static"
_HOME_STR = _HOME.as_posix()

APP_NAME = "@APP_NAME@"
APP_ICON = "/pypasreportergui_static/logo-horiz.png"
FAVICONS = [
    {"href": "/pypasreportergui_static/favicon.png", "sizes": "16x16", "type": "image/png"},
]

SECRET_KEY = @SECRET_KEY@

SQLALCHEMY_DATABASE_URI = f"sqlite:///{_HOME_STR}/@DATABASE_FILE@?check_same_thread=false"

FEATURE_FLAGS = {
    "ENABLE_TEMPLATE_PROCESSING": True,
    "DASHBOARD_NATIVE_FILTERS": True,
    "DASHBOARD_CROSS_FILTERS": True,
    "EMBEDDED_SUPERSET": True,
    "ALERT_REPORTS": False,
    "SCHEDULED_QUERIES": False,
}


def _filesystem_cache(subdir, timeout):
    return {
        "CACHE_TYPE": "FileSystemCache",
        "CACHE_DIR": f"{_HOME_STR}/{subdir}",
        "CACHE_DEFAULT_TIMEOUT": timeout,
        "CACHE_THRESHOLD": 100,
    }


CACHE_CONFIG = _filesystem_cache("cache", 300)
DATA_CACHE_CONFIG = _filesystem_cache("data_cache", 86400)
FILTER_STATE_CACHE_CONFIG = _filesystem_cache("filter_cache", 86400)
EXPLORE_FORM_DATA_CACHE_CONFIG = _filesystem_cache("explore_cache", 86400)


class CeleryConfig:
    broker_url = None
    result_backend = None


CELERY_CONFIG = CeleryConfig
SQLLAB_ASYNC_TIME_LIMIT_SEC = 0

WTF_CSRF_ENABLED = True
SESSION_COOKIE_HTTPONLY = True
SESSION_COOKIE_SECURE = False
TALISMAN_ENABLED = False

SQLLAB_TIMEOUT = 300
SQL_MAX_ROW = 100000
DISPLAY_MAX_ROW = 10000

UPLOAD_FOLDER = f"{_HOME_STR}/uploads"
ALLOWED_EXTENSIONS = {"csv", "xlsx", "xls", "json", "parquet"}
CSV_UPLOAD = True
EXCEL_UPLOAD = True

LOG_LEVEL = "INFO"
ENABLE_TIME_ROTATE = True
TIME_ROTATE_LOG_LEVEL = "INFO"
FILENAME = f"{_HOME_STR}/logs/superset.log"

PREFERRED_DATABASES = ["DuckDB", "SQLite", "PostgreSQL", "MySQL"]
SUPERSET_WEBSERVER_TIMEOUT = 60
SUPERSET_LOAD_EXAMPLES = False


def FLASK_APP_MUTATOR(app):
    try:
        from pypasreportergui.branding.blueprint import branding_bp

        app.register_blueprint(branding_bp)
        return
    except ImportError:
        pass
    if _BRANDING_STATIC.is_dir():
        from flask import send_from_directory

        @app.route("/pypasreportergui_static/<path:filename>")
        def pypasreportergui_static(filename):
            return send_from_directory(str(_BRANDING_STATIC), filename)
"#;

/// Render the engine configuration for `secret`.
pub fn render_config(secret: &str) -> String {
    TEMPLATE
        .replace("@APP_NAME@", APP_NAME)
        .replace("@APP_VERSION@", env!("CARGO_PKG_VERSION"))
        .replace("@DATABASE_FILE@", super::DATABASE_FILE)
        .replace("@SECRET_KEY@", &python_string(secret))
}

/// Quote `value` as a Python string literal.
fn python_string(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for ch in value.chars() {
        match ch {
            '\\' => quoted.push_str("\\\\"),
            '"' => quoted.push_str("\\\""),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            '\t' => quoted.push_str("\\t"),
            c if c.is_control() => quoted.push_str(&format!("\\u{:04x}", c as u32)),
            c => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}

/// Write the configuration file unless it exists. Returns its path.
pub fn ensure_config(ctx: &RuntimeContext, force: bool) -> ForgeResult<PathBuf> {
    let path = ctx.config_path.clone();
    if path.is_file() && !force {
        debug!(path = %path.display(), "Runtime configuration already present");
        return Ok(path);
    }

    let secret = load_or_create_secret(&ctx.home_directory)?;
    write_atomic(&path, render_config(&secret).as_bytes())?;
    for dir in STATE_DIRS {
        let dir = ctx.home_directory.join(dir);
        std::fs::create_dir_all(&dir)
            .map_err(|err| ForgeError::io(format!("failed to create {}", dir.display()), err))?;
    }
    info!(path = %path.display(), "Runtime configuration written");
    Ok(path)
}

/// The secret survives regeneration: environment first, then the persisted
/// file, and only then a fresh random value which is saved.
pub fn load_or_create_secret(home: &Path) -> ForgeResult<String> {
    if let Ok(secret) = std::env::var(SECRET_ENV)
        && !secret.trim().is_empty()
    {
        return Ok(secret.trim().to_string());
    }

    let path = home.join(SECRET_FILE);
    if path.is_file() {
        let secret = std::fs::read_to_string(&path)
            .map_err(|err| ForgeError::io(format!("failed to read {}", path.display()), err))?;
        let secret = secret.trim();
        if !secret.is_empty() {
            return Ok(secret.to_string());
        }
    }

    let mut bytes = [0u8; 32];
    getrandom::fill(&mut bytes)
        .map_err(|err| ForgeError::Runtime(format!("failed to generate secret: {err}")))?;
    let secret = hex::encode(bytes);
    write_atomic(&path, secret.as_bytes())?;
    restrict_permissions(&path)?;
    info!(path = %path.display(), "Generated new secret");
    Ok(secret)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> ForgeResult<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|err| ForgeError::io(format!("failed to restrict {}", path.display()), err))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> ForgeResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ExecutionMode, RuntimeContext};
    use tempfile::tempdir;

    fn context(home: &Path) -> RuntimeContext {
        RuntimeContext {
            execution_mode: ExecutionMode::Normal,
            base_resource_root: home.join("resources"),
            config_path: home.join(crate::runtime::CONFIG_FILE),
            home_directory: home.to_path_buf(),
            bundle_root: None,
            bundle: None,
        }
    }

    #[test]
    fn rendered_config_disables_clustered_features() {
        let rendered = render_config("abc123");
        assert!(rendered.contains(r#"SECRET_KEY = "abc123""#));
        assert!(rendered.contains(r#""ALERT_REPORTS": False"#));
        assert!(rendered.contains(r#""SCHEDULED_QUERIES": False"#));
        assert!(rendered.contains("SQLLAB_ASYNC_TIME_LIMIT_SEC = 0"));
        assert!(rendered.contains("FileSystemCache"));
        for placeholder in ["@APP_NAME@", "@APP_VERSION@", "@DATABASE_FILE@", "@SECRET_KEY@"] {
            assert!(!rendered.contains(placeholder), "{placeholder} left in output");
        }
    }

    #[test]
    fn secret_with_quotes_stays_a_single_literal() {
        let rendered = render_config(r#"a"b\c"#);
        assert!(rendered.contains(r#"SECRET_KEY = "a\"b\\c""#), "{rendered}");
        assert_eq!(python_string("tab\there"), r#""tab\there""#);
        assert_eq!(python_string("bell\u{7}"), r#""bell\u0007""#);
    }

    #[test]
    fn rendered_config_embeds_no_absolute_paths() {
        let temp = tempdir().unwrap();
        let rendered = render_config("s");
        assert!(!rendered.contains(&*temp.path().to_string_lossy()));
        assert!(rendered.contains("REPORTFORGE_RESOURCE_ROOT"));
    }

    #[test]
    fn existing_config_is_kept_and_secret_reused() {
        let temp = tempdir().unwrap();
        let ctx = context(temp.path());

        let path = ensure_config(&ctx, false).unwrap();
        let first = std::fs::read_to_string(&path).unwrap();
        for dir in STATE_DIRS {
            assert!(temp.path().join(dir).is_dir(), "{dir} missing");
        }

        std::fs::write(&path, "# edited by hand\n").unwrap();
        ensure_config(&ctx, false).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "# edited by hand\n");

        ensure_config(&ctx, true).unwrap();
        let regenerated = std::fs::read_to_string(&path).unwrap();
        // Only meaningful when the secret is not pinned through the environment.
        if std::env::var(SECRET_ENV).is_err() {
            assert_eq!(first, regenerated);
        }
    }
}
