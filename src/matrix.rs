use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::ForgeConfig;
use crate::error::{ForgeError, ForgeResult};
use crate::pin::{PinnedRevision, read_head, short_id};
use crate::platform::{CommandRunner, ToolTable};
use crate::security::write_atomic;

/// What a build was built from. Written once per successful pin and read by
/// every later stage and by the validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionMatrix {
    pub pinned_revision: PinnedRevision,
    #[serde(default)]
    pub external_version: String,
    #[serde(default)]
    pub toolchain_versions: BTreeMap<String, String>,
    pub app_version: String,
    pub generated_at: DateTime<Utc>,
    #[serde(default)]
    pub build_host: String,
}

impl VersionMatrix {
    pub fn new(
        pinned_revision: PinnedRevision,
        external_version: impl Into<String>,
        toolchain_versions: BTreeMap<String, String>,
        app_version: impl Into<String>,
    ) -> Self {
        Self {
            pinned_revision,
            external_version: external_version.into(),
            toolchain_versions,
            app_version: app_version.into(),
            generated_at: Utc::now(),
            build_host: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
        }
    }

    pub fn resolved_id(&self) -> &str {
        &self.pinned_revision.resolved_id
    }

    pub fn to_markdown(&self, external_name: &str) -> String {
        let pinned = &self.pinned_revision;
        let mut out = String::new();
        out.push_str("# Version Matrix\n\n");
        out.push_str(&format!(
            "Generated {} on `{}`.\n\n",
            self.generated_at.to_rfc3339(),
            self.build_host
        ));
        out.push_str("| Component | Version |\n|-----------|---------|\n");
        out.push_str(&format!("| Application | {} |\n", self.app_version));
        out.push_str(&format!(
            "| {external_name} | {} (`{}`) |\n",
            self.external_version,
            short_id(&pinned.resolved_id)
        ));
        for (tool, version) in &self.toolchain_versions {
            out.push_str(&format!("| {tool} | {version} |\n"));
        }
        out.push_str("\n## Pinned revision\n\n");
        out.push_str(&format!("- Reference: {}\n", pinned.reference_kind));
        if !pinned.requested_value.is_empty() {
            out.push_str(&format!("- Requested: `{}`\n", pinned.requested_value));
        }
        out.push_str(&format!("- Display name: `{}`\n", pinned.resolved_display_name));
        out.push_str(&format!("- Commit: `{}`\n", pinned.resolved_id));
        out.push_str("\n## Rebuilding this version\n\n```\n");
        out.push_str(&format!("reportforge build --sha {}\n", pinned.resolved_id));
        out.push_str("```\n");
        out
    }
}

/// Reads and writes the version matrix files named in the build config.
#[derive(Debug, Clone)]
pub struct MatrixRecorder {
    json: PathBuf,
    markdown: Option<PathBuf>,
    external_name: String,
}

impl MatrixRecorder {
    pub fn new(json: PathBuf, markdown: Option<PathBuf>) -> Self {
        Self {
            json,
            markdown,
            external_name: "external source".into(),
        }
    }

    pub fn from_config(config: &ForgeConfig) -> Self {
        Self {
            json: config.matrix_path(),
            markdown: config.matrix.markdown.as_deref().map(|p| config.resolve(p)),
            external_name: config.external.name.clone(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.json
    }

    pub fn record(&self, matrix: &VersionMatrix) -> ForgeResult<()> {
        let json = serde_json::to_vec_pretty(matrix).map_err(|err| ForgeError::Config {
            path: self.json.clone(),
            detail: format!("failed to serialise version matrix: {err}"),
        })?;
        write_atomic(&self.json, &json)?;

        if let Some(markdown) = &self.markdown {
            write_atomic(markdown, matrix.to_markdown(&self.external_name).as_bytes())?;
        }

        info!(
            path = %self.json.display(),
            resolved_id = %matrix.resolved_id(),
            "Version matrix recorded"
        );
        Ok(())
    }

    /// `Ok(None)` when no matrix has been recorded yet.
    pub fn load(&self) -> ForgeResult<Option<VersionMatrix>> {
        if !self.json.exists() {
            return Ok(None);
        }
        load_matrix(&self.json).map(Some)
    }

    pub fn require(&self) -> ForgeResult<VersionMatrix> {
        self.load()?.ok_or_else(|| ForgeError::Config {
            path: self.json.clone(),
            detail: "no version matrix recorded; run the pin stage first".into(),
        })
    }
}

pub fn load_matrix(path: &Path) -> ForgeResult<VersionMatrix> {
    let content = std::fs::read_to_string(path)
        .map_err(|err| ForgeError::io(format!("failed to read {}", path.display()), err))?;
    serde_json::from_str(&content).map_err(|err| ForgeError::Config {
        path: path.to_path_buf(),
        detail: format!("malformed version matrix: {err}"),
    })
}

/// Fail with `Drift` when the checkout's `HEAD` no longer matches the
/// recorded revision.
pub fn verify(
    matrix: &VersionMatrix,
    checkout: &Path,
    tools: &ToolTable,
    runner: &dyn CommandRunner,
) -> ForgeResult<()> {
    let actual = read_head(tools, runner, checkout)?;
    if actual != matrix.resolved_id() {
        warn!(
            expected = %matrix.resolved_id(),
            actual = %actual,
            "Checkout drifted from version matrix"
        );
        return Err(ForgeError::Drift {
            expected: matrix.resolved_id().to_string(),
            actual,
            checkout: checkout.to_path_buf(),
        });
    }
    info!(resolved_id = %actual, "Checkout matches version matrix");
    Ok(())
}
