use std::path::PathBuf;

use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::config::ExternalSource;
use crate::dist::has_build_descriptor;
use crate::error::{ForgeError, ForgeResult};
use crate::pipeline::{PipelineContext, PipelineState, Stage};
use crate::platform::{CommandRunner, Tool, ToolTable};

const PREFERRED_SCRIPTS: [&str; 4] = ["build", "build-prod", "build:prod", "build:production"];

/// Pick the production build script from a `package.json` document.
pub fn pick_build_script(package_json: &Value) -> Option<String> {
    let scripts = package_json.get("scripts")?.as_object()?;
    PREFERRED_SCRIPTS
        .iter()
        .find(|name| scripts.contains_key(**name))
        .map(|name| name.to_string())
        .or_else(|| {
            // serde_json maps iterate in key order, which keeps the fallback stable.
            scripts.keys().find(|name| name.contains("build")).cloned()
        })
}

pub struct AssetBuilder<'a> {
    tools: &'a ToolTable,
    runner: &'a dyn CommandRunner,
    checkout: PathBuf,
    source: &'a ExternalSource,
}

impl<'a> AssetBuilder<'a> {
    pub fn new(
        tools: &'a ToolTable,
        runner: &'a dyn CommandRunner,
        checkout: PathBuf,
        source: &'a ExternalSource,
    ) -> Self {
        Self {
            tools,
            runner,
            checkout,
            source,
        }
    }

    pub fn frontend_dir(&self) -> PathBuf {
        self.checkout.join(&self.source.frontend_dir)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.checkout.join(&self.source.assets_output)
    }

    /// Clean install then production build. The previous output is removed
    /// up front so a failed build cannot leave stale assets behind.
    #[instrument(skip_all, fields(frontend = %self.frontend_dir().display()))]
    pub fn build(&self) -> ForgeResult<PathBuf> {
        let frontend = self.frontend_dir();
        let manifest_path = frontend.join("package.json");
        let manifest = std::fs::read_to_string(&manifest_path).map_err(|_| {
            ForgeError::SourceTreeInvalid {
                root: frontend.clone(),
                expected: "package.json".into(),
            }
        })?;
        let manifest: Value =
            serde_json::from_str(&manifest).map_err(|err| ForgeError::SourceTreeInvalid {
                root: frontend.clone(),
                expected: format!("a valid package.json ({err})"),
            })?;
        let script = pick_build_script(&manifest).ok_or_else(|| ForgeError::SourceTreeInvalid {
            root: frontend.clone(),
            expected: "an npm build script in package.json".into(),
        })?;

        let output = self.output_dir();
        if output.exists() {
            info!(path = %output.display(), "Removing previous asset output");
            std::fs::remove_dir_all(&output).map_err(|err| {
                ForgeError::io(format!("failed to remove {}", output.display()), err)
            })?;
        }

        let install = self
            .tools
            .invocation(Tool::Npm, ["ci"])
            .current_dir(&frontend)
            .inherit_output();
        info!(command = %install, "Installing frontend dependencies");
        self.runner.run_checked(&install)?;

        let build = self
            .tools
            .invocation(Tool::Npm, ["run", script.as_str()])
            .current_dir(&frontend)
            .env("NODE_ENV", "production")
            .inherit_output();
        info!(command = %build, "Building frontend assets");
        self.runner.run_checked(&build)?;

        if !output.is_dir() {
            return Err(ForgeError::SourceTreeInvalid {
                root: output,
                expected: format!("compiled assets after `npm run {script}`"),
            });
        }
        Ok(output)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Installer {
    Uv,
    Pip,
}

impl Installer {
    pub fn label(&self) -> &'static str {
        match self {
            Installer::Uv => "uv",
            Installer::Pip => "pip",
        }
    }
}

pub struct LibraryInstaller<'a> {
    tools: &'a ToolTable,
    runner: &'a dyn CommandRunner,
    checkout: PathBuf,
    companions: &'a [String],
}

impl<'a> LibraryInstaller<'a> {
    pub fn new(
        tools: &'a ToolTable,
        runner: &'a dyn CommandRunner,
        checkout: PathBuf,
        companions: &'a [String],
    ) -> Self {
        Self {
            tools,
            runner,
            checkout,
            companions,
        }
    }

    pub fn select_installer(&self) -> Installer {
        if self.tools.is_available(Tool::Uv, self.runner) {
            Installer::Uv
        } else {
            Installer::Pip
        }
    }

    /// Editable install of the checkout followed by the companion packages.
    #[instrument(skip_all, fields(checkout = %self.checkout.display()))]
    pub fn install(&self) -> ForgeResult<Installer> {
        if !has_build_descriptor(&self.checkout) {
            return Err(ForgeError::SourceTreeInvalid {
                root: self.checkout.clone(),
                expected: "pyproject.toml or setup.py".into(),
            });
        }
        let installer = self.select_installer();

        let checkout = self.checkout.to_string_lossy().to_string();
        self.pip_install(installer, &["-e", checkout.as_str()])?;

        if self.companions.is_empty() {
            warn!("No companion packages configured");
        } else {
            let companions: Vec<&str> = self.companions.iter().map(String::as_str).collect();
            self.pip_install(installer, &companions)?;
        }
        Ok(installer)
    }

    fn pip_install(&self, installer: Installer, packages: &[&str]) -> ForgeResult<()> {
        let python = self.tools.spec(Tool::Python).program.clone();
        let mut args: Vec<String> = match installer {
            Installer::Uv => vec![
                "pip".into(),
                "install".into(),
                "--python".into(),
                python,
            ],
            Installer::Pip => vec!["-m".into(), "pip".into(), "install".into()],
        };
        args.extend(packages.iter().map(|p| p.to_string()));

        let tool = match installer {
            Installer::Uv => Tool::Uv,
            Installer::Pip => Tool::Python,
        };
        let invocation = self.tools.invocation(tool, args).inherit_output();
        info!(command = %invocation, "Installing packages");
        self.runner.run_checked(&invocation)?;
        Ok(())
    }
}

fn note_probed(ctx: &mut PipelineContext<'_>, tool: Tool) -> ForgeResult<()> {
    if let Ok(version) = ctx.tools.probe_version(tool, ctx.runner) {
        ctx.note_toolchain(tool.name(), &version)?;
    }
    Ok(())
}

pub struct AssetStage;

impl Stage for AssetStage {
    fn name(&self) -> &'static str {
        "build-assets"
    }

    fn state(&self) -> PipelineState {
        PipelineState::BuildAssets
    }

    fn run(&self, ctx: &mut PipelineContext<'_>) -> ForgeResult<()> {
        let builder = AssetBuilder::new(
            ctx.tools,
            ctx.runner,
            ctx.checkout(),
            &ctx.config.external,
        );
        let output = builder.build()?;
        info!(path = %output.display(), "Frontend assets built");
        note_probed(ctx, Tool::Node)?;
        note_probed(ctx, Tool::Npm)
    }
}

pub struct LibraryStage;

impl Stage for LibraryStage {
    fn name(&self) -> &'static str {
        "build-library"
    }

    fn state(&self) -> PipelineState {
        PipelineState::BuildLibrary
    }

    fn run(&self, ctx: &mut PipelineContext<'_>) -> ForgeResult<()> {
        let installer = LibraryInstaller::new(
            ctx.tools,
            ctx.runner,
            ctx.checkout(),
            &ctx.config.companion_packages.0,
        );
        let used = installer.install()?;
        note_probed(ctx, Tool::Python)?;
        ctx.note_toolchain("installer", used.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prefers_plain_build_script() {
        let manifest = json!({"scripts": {"build:prod": "x", "build": "y", "dev": "z"}});
        assert_eq!(pick_build_script(&manifest).as_deref(), Some("build"));
    }

    #[test]
    fn falls_back_to_any_build_script() {
        let manifest = json!({"scripts": {"dev": "z", "prod-build": "w"}});
        assert_eq!(pick_build_script(&manifest).as_deref(), Some("prod-build"));
        assert_eq!(pick_build_script(&json!({"scripts": {"dev": "z"}})), None);
        assert_eq!(pick_build_script(&json!({})), None);
    }
}
