use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::config::ExternalSource;
use crate::error::{ForgeError, ForgeResult};
use crate::matrix::VersionMatrix;
use crate::pipeline::{PipelineContext, PipelineState, Stage};
use crate::platform::{CommandOutput, CommandRunner, Invocation, Tool, ToolTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    LatestTag,
    Branch,
    ExplicitId,
}

impl fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReferenceKind::LatestTag => "latest_tag",
            ReferenceKind::Branch => "branch",
            ReferenceKind::ExplicitId => "explicit_id",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinRequest {
    pub kind: ReferenceKind,
    pub value: Option<String>,
}

impl PinRequest {
    pub fn latest_tag() -> Self {
        Self {
            kind: ReferenceKind::LatestTag,
            value: None,
        }
    }

    pub fn branch(name: Option<String>) -> Self {
        Self {
            kind: ReferenceKind::Branch,
            value: name,
        }
    }

    pub fn explicit(id: impl Into<String>) -> Self {
        Self {
            kind: ReferenceKind::ExplicitId,
            value: Some(id.into()),
        }
    }

    /// `--sha` wins over `--latest-tag`, which wins over `--branch`; with no
    /// flag the default branch is tracked.
    pub fn from_flags(latest_tag: bool, sha: Option<String>, branch: Option<String>) -> Self {
        if let Some(sha) = sha {
            Self::explicit(sha)
        } else if latest_tag {
            Self::latest_tag()
        } else {
            Self::branch(branch)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinnedRevision {
    pub reference_kind: ReferenceKind,
    pub requested_value: String,
    pub resolved_id: String,
    pub resolved_display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PreRelease {
    Numeric(u64),
    Alpha(String),
}

impl Ord for PreRelease {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (PreRelease::Numeric(a), PreRelease::Numeric(b)) => a.cmp(b),
            (PreRelease::Numeric(_), PreRelease::Alpha(_)) => Ordering::Less,
            (PreRelease::Alpha(_), PreRelease::Numeric(_)) => Ordering::Greater,
            (PreRelease::Alpha(a), PreRelease::Alpha(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for PreRelease {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

static SEMVER_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^v?(\d+)\.(\d+)\.(\d+)(?:-([0-9A-Za-z][0-9A-Za-z.\-]*)|([A-Za-z][0-9A-Za-z.\-]*))?$")
        .expect("semver tag pattern is valid")
});

/// Version parsed from a release tag. `2.10.0-rc1` and `2.10.0rc1` are both
/// accepted; a pre-release always ranks below its release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SemVer {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pre: Vec<PreRelease>,
}

impl SemVer {
    pub fn parse(tag: &str) -> Option<Self> {
        let caps = SEMVER_TAG.captures(tag.trim())?;
        let number = |idx: usize| caps.get(idx)?.as_str().parse::<u64>().ok();
        let pre = caps
            .get(4)
            .or_else(|| caps.get(5))
            .map(|m| split_pre_release(m.as_str()))
            .unwrap_or_default();
        Some(Self {
            major: number(1)?,
            minor: number(2)?,
            patch: number(3)?,
            pre,
        })
    }

    pub fn is_prerelease(&self) -> bool {
        !self.pre.is_empty()
    }
}

fn split_pre_release(raw: &str) -> Vec<PreRelease> {
    let mut parts = Vec::new();
    for segment in raw.split(['.', '-']).filter(|s| !s.is_empty()) {
        // "rc1" compares as ["rc", 1] so rc10 sorts after rc9.
        let digits_at = segment
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(segment.len());
        let (alpha, digits) = segment.split_at(digits_at);
        if !alpha.is_empty() {
            parts.push(PreRelease::Alpha(alpha.to_ascii_lowercase()));
        }
        if !digits.is_empty() {
            match digits.parse::<u64>() {
                Ok(n) => parts.push(PreRelease::Numeric(n)),
                Err(_) => parts.push(PreRelease::Alpha(digits.to_string())),
            }
        }
    }
    parts
}

impl Ord for SemVer {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| match (self.pre.is_empty(), other.pre.is_empty()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => self.pre.cmp(&other.pre),
            })
    }
}

impl PartialOrd for SemVer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Highest tag by semantic-version ordering. Tags that do not parse are
/// ignored; pre-releases only compete when `allow_prerelease` is set.
pub fn select_latest_tag<'a, I>(tags: I, allow_prerelease: bool) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    tags.into_iter()
        .filter_map(|tag| SemVer::parse(tag).map(|version| (version, tag.trim())))
        .filter(|(version, _)| allow_prerelease || !version.is_prerelease())
        .max_by(|(a, _), (b, _)| a.cmp(b))
        .map(|(_, tag)| tag)
}

pub struct RevisionPinner<'a> {
    runner: &'a dyn CommandRunner,
    tools: &'a ToolTable,
    checkout: PathBuf,
    source: &'a ExternalSource,
}

impl<'a> RevisionPinner<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        tools: &'a ToolTable,
        checkout: PathBuf,
        source: &'a ExternalSource,
    ) -> Self {
        Self {
            runner,
            tools,
            checkout,
            source,
        }
    }

    pub fn checkout(&self) -> &Path {
        &self.checkout
    }

    #[instrument(skip(self), fields(checkout = %self.checkout.display()))]
    pub fn pin(&self, request: &PinRequest) -> ForgeResult<PinnedRevision> {
        self.ensure_checkout()?;

        let (requested_value, resolved_id, display_value) = match request.kind {
            ReferenceKind::ExplicitId => {
                let value = request.value.clone().ok_or_else(|| ForgeError::Resolution {
                    reference: "explicit_id".into(),
                    detail: "no revision id supplied".into(),
                })?;
                let id = self.resolve_explicit(&value)?;
                let display = if looks_like_object_id(&value) {
                    short_id(&id)
                } else {
                    value.clone()
                };
                (value, id, display)
            }
            ReferenceKind::LatestTag => {
                let tag = self.latest_tag()?;
                let id = self.require_commit(&tag)?;
                (String::new(), id, tag)
            }
            ReferenceKind::Branch => {
                let branch = match &request.value {
                    Some(name) => name.clone(),
                    None => self.default_branch()?,
                };
                self.fetch(&["fetch", "origin", "--prune"])?;
                let id = match self.rev_parse_commit(&format!("origin/{branch}"))? {
                    Some(id) => id,
                    None => self.require_commit(&branch)?,
                };
                (request.value.clone().unwrap_or_default(), id, branch)
            }
        };

        self.materialize(&resolved_id)?;

        info!(
            kind = %request.kind,
            resolved_id = %resolved_id,
            display = %display_value,
            "Pinned external source"
        );

        Ok(PinnedRevision {
            reference_kind: request.kind,
            requested_value,
            resolved_id,
            resolved_display_name: display_value,
        })
    }

    /// Current `HEAD` of the checkout.
    pub fn head(&self) -> ForgeResult<String> {
        read_head(self.tools, self.runner, &self.checkout)
    }

    /// Tracked files with uncommitted modifications.
    pub fn dirty_files(&self) -> ForgeResult<Vec<String>> {
        let invocation = self.git(["status", "--porcelain", "--untracked-files=no"]);
        let output = self.runner.run_checked(&invocation)?;
        Ok(output
            .stdout
            .lines()
            .filter(|line| line.len() > 3)
            .map(|line| line[3..].trim().to_string())
            .collect())
    }

    fn git<I, S>(&self, args: I) -> Invocation
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut full = vec!["-C".to_string(), self.checkout.to_string_lossy().to_string()];
        full.extend(args.into_iter().map(Into::into));
        self.tools.invocation(Tool::Git, full)
    }

    fn ensure_checkout(&self) -> ForgeResult<()> {
        if self.checkout.join(".git").exists() {
            return Ok(());
        }
        if let Some(parent) = self.checkout.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|err| {
                ForgeError::io(format!("failed to create {}", parent.display()), err)
            })?;
        }
        info!(url = %self.source.repo_url, "Cloning external source");
        let invocation = self.tools.invocation(
            Tool::Git,
            [
                "clone".to_string(),
                "--depth".to_string(),
                self.source.clone_depth.to_string(),
                "--no-single-branch".to_string(),
                self.source.repo_url.clone(),
                self.checkout.to_string_lossy().to_string(),
            ],
        );
        let output = self.runner.run(&invocation)?;
        if !output.success() {
            return Err(self.network_error(&output));
        }
        Ok(())
    }

    fn network_error(&self, output: &CommandOutput) -> ForgeError {
        ForgeError::Network {
            remote: self.source.repo_url.clone(),
            detail: output.stderr.trim().to_string(),
        }
    }

    fn fetch(&self, args: &[&str]) -> ForgeResult<()> {
        let output = self.runner.run(&self.git(args.iter().copied()))?;
        if !output.success() {
            return Err(self.network_error(&output));
        }
        Ok(())
    }

    fn is_shallow(&self) -> ForgeResult<bool> {
        let output = self
            .runner
            .run(&self.git(["rev-parse", "--is-shallow-repository"]))?;
        Ok(output.success() && output.stdout.trim().eq_ignore_ascii_case("true"))
    }

    /// Deepen a shallow clone so tags and old ids become reachable.
    fn ensure_full_history(&self) -> ForgeResult<()> {
        if !self.is_shallow()? {
            return Ok(());
        }
        info!("Checkout is shallow; fetching full history");
        let _ = self
            .runner
            .run(&self.git(["fetch", "--unshallow", "--tags", "--prune"]))?;
        if self.is_shallow()? {
            let _ = self
                .runner
                .run(&self.git(["fetch", "--depth", "1000000", "--tags", "--prune"]))?;
        }
        Ok(())
    }

    fn rev_parse_commit(&self, reference: &str) -> ForgeResult<Option<String>> {
        let target = format!("{reference}^{{commit}}");
        let output = self
            .runner
            .run(&self.git(["rev-parse", "--verify", "--quiet", target.as_str()]))?;
        let id = output.stdout.trim();
        if output.success() && !id.is_empty() {
            Ok(Some(id.to_string()))
        } else {
            Ok(None)
        }
    }

    fn require_commit(&self, reference: &str) -> ForgeResult<String> {
        self.rev_parse_commit(reference)?
            .ok_or_else(|| ForgeError::Resolution {
                reference: reference.to_string(),
                detail: "not a known commit, tag or branch".into(),
            })
    }

    fn resolve_explicit(&self, value: &str) -> ForgeResult<String> {
        if let Some(id) = self.rev_parse_commit(value)? {
            return Ok(id);
        }
        self.fetch(&["fetch", "--all", "--tags", "--prune"])?;
        self.ensure_full_history()?;
        // Some hosts only serve unadvertised ids on explicit request.
        let _ = self.runner.run(&self.git(["fetch", "origin", value]))?;
        self.require_commit(value)
    }

    fn latest_tag(&self) -> ForgeResult<String> {
        self.fetch(&["fetch", "--all", "--tags", "--prune"])?;
        self.ensure_full_history()?;
        let output = self.runner.run_checked(&self.git(["tag", "--list"]))?;
        select_latest_tag(output.stdout.lines(), self.source.allow_prerelease)
            .map(str::to_string)
            .ok_or_else(|| ForgeError::Resolution {
                reference: ReferenceKind::LatestTag.to_string(),
                detail: "no tag matches the semantic-version pattern".into(),
            })
    }

    fn default_branch(&self) -> ForgeResult<String> {
        if let Some(branch) = &self.source.default_branch {
            return Ok(branch.clone());
        }
        let output = self
            .runner
            .run(&self.git(["symbolic-ref", "refs/remotes/origin/HEAD"]))?;
        if output.success()
            && let Some(name) = output.stdout.trim().rsplit('/').next()
            && !name.is_empty()
        {
            return Ok(name.to_string());
        }
        for candidate in ["main", "master", "next"] {
            let remote_ref = format!("refs/remotes/origin/{candidate}");
            let check = self
                .runner
                .run(&self.git(["show-ref", "--verify", "--quiet", remote_ref.as_str()]))?;
            if check.success() {
                return Ok(candidate.to_string());
            }
        }
        Err(ForgeError::Resolution {
            reference: ReferenceKind::Branch.to_string(),
            detail: "unable to determine the default branch".into(),
        })
    }

    /// Move the checkout to `id`. Already being there is a successful no-op.
    fn materialize(&self, id: &str) -> ForgeResult<()> {
        let head = self.head()?;
        let dirty = self.dirty_files()?;
        if head == id {
            if !dirty.is_empty() {
                warn!(files = ?dirty, "Checkout already pinned but has local modifications");
            }
            info!(resolved_id = %id, "Checkout already at pinned revision");
            return Ok(());
        }
        if !dirty.is_empty() {
            return Err(ForgeError::DirtyCheckout {
                checkout: self.checkout.clone(),
                files: dirty,
            });
        }
        let output = self
            .runner
            .run(&self.git(["checkout", "--detach", "--quiet", id]))?;
        if !output.success() {
            return Err(ForgeError::Resolution {
                reference: id.to_string(),
                detail: format!("checkout failed: {}", output.stderr.trim()),
            });
        }
        Ok(())
    }
}

/// Resolve `HEAD` of the checkout at `checkout` to a full commit id.
pub fn read_head(
    tools: &ToolTable,
    runner: &dyn CommandRunner,
    checkout: &Path,
) -> ForgeResult<String> {
    let invocation = tools.invocation(
        Tool::Git,
        [
            "-C".to_string(),
            checkout.to_string_lossy().to_string(),
            "rev-parse".to_string(),
            "HEAD".to_string(),
        ],
    );
    let output = runner.run(&invocation)?;
    if !output.success() {
        return Err(ForgeError::SourceTreeInvalid {
            root: checkout.to_path_buf(),
            expected: format!("a git checkout ({})", output.stderr.trim()),
        });
    }
    Ok(output.stdout.trim().to_string())
}

fn looks_like_object_id(value: &str) -> bool {
    value.len() >= 7 && value.chars().all(|c| c.is_ascii_hexdigit())
}

pub fn short_id(id: &str) -> String {
    id.chars().take(12).collect()
}

static VERSION_PY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"VERSION\s*=\s*["']([^"']+)["']"#).expect("version.py pattern is valid")
});

static PYPROJECT_VERSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)^version\s*=\s*["']([^"']+)["']"#).expect("pyproject pattern is valid")
});

/// Version string declared by the external source tree, or `unknown`.
pub fn external_version(checkout: &Path, module: &str) -> String {
    let version_file = checkout.join(module).join("version.py");
    if let Ok(content) = std::fs::read_to_string(&version_file)
        && let Some(caps) = VERSION_PY.captures(&content)
    {
        return caps[1].to_string();
    }
    if let Ok(content) = std::fs::read_to_string(checkout.join("pyproject.toml"))
        && let Some(caps) = PYPROJECT_VERSION.captures(&content)
    {
        return caps[1].to_string();
    }
    "unknown".to_string()
}

/// Pins the checkout and records a fresh version matrix.
pub struct PinStage;

impl Stage for PinStage {
    fn name(&self) -> &'static str {
        "pin"
    }

    fn state(&self) -> PipelineState {
        PipelineState::Pin
    }

    fn run(&self, ctx: &mut PipelineContext<'_>) -> ForgeResult<()> {
        let source = &ctx.config.external;
        let pinner = RevisionPinner::new(ctx.runner, ctx.tools, ctx.checkout(), source);
        let pinned = pinner.pin(&ctx.pin_request)?;

        let version = external_version(pinner.checkout(), &source.module);
        let matrix = VersionMatrix::new(
            pinned,
            version,
            ctx.toolchain_versions.clone(),
            ctx.config.wrapper.version.clone(),
        );
        ctx.recorder.record(&matrix)?;
        ctx.matrix = Some(matrix);
        Ok(())
    }
}
