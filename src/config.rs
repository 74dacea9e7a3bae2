use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::freeze::FreezeManifest;
use crate::validation::ValidationPlan;

pub const DEFAULT_CONFIG_FILE: &str = "forge.yaml";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ForgeConfig {
    /// Directory every relative path in the config is resolved against.
    #[serde(skip)]
    pub root: PathBuf,
    pub external: ExternalSource,
    pub wrapper: WrapperApp,
    pub companion_packages: CompanionPackages,
    pub matrix: MatrixPaths,
    pub dist: DistSettings,
    pub freeze: FreezeManifest,
    pub validation: ValidationPlan,
}

impl ForgeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config: ForgeConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config YAML: {}", path.display()))?;
        config.root = config_root(path);
        Ok(config)
    }

    /// Load `path` when it exists, otherwise fall back to built-in defaults
    /// rooted at the file's directory.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }
        Ok(Self {
            root: config_root(path),
            ..Self::default()
        })
    }

    pub fn resolve(&self, relative: &Path) -> PathBuf {
        if relative.is_absolute() {
            relative.to_path_buf()
        } else {
            self.root.join(relative)
        }
    }

    pub fn checkout_dir(&self) -> PathBuf {
        self.resolve(&self.external.checkout)
    }

    pub fn matrix_path(&self) -> PathBuf {
        self.resolve(&self.matrix.json)
    }

    pub fn validate(&self) -> ConfigReport {
        let mut report = ConfigReport::default();

        if self.external.repo_url.trim().is_empty() {
            report.errors.push("external.repo_url cannot be empty".into());
        }
        if self.external.checkout.as_os_str().is_empty() {
            report.errors.push("external.checkout cannot be empty".into());
        }
        if self.external.module.trim().is_empty() {
            report.errors.push("external.module cannot be empty".into());
        }
        if self.wrapper.module.trim().is_empty() {
            report.errors.push("wrapper.module cannot be empty".into());
        }
        if self.companion_packages.0.is_empty() {
            report
                .warnings
                .push("No companion packages listed; the analytics engine driver will be missing".into());
        }

        let mut seen = BTreeSet::new();
        for sub in &self.external.sub_packages {
            if !seen.insert(sub.dir.clone()) {
                report.errors.push(format!(
                    "external.sub_packages lists '{}' more than once",
                    sub.dir.display()
                ));
            }
        }

        report.merge(self.freeze.check());
        report.merge(self.validation.check());
        report
    }
}

fn config_root(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

#[derive(Debug, Default, Serialize)]
pub struct ConfigReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ConfigReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ConfigReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExternalSource {
    pub name: String,
    pub module: String,
    pub repo_url: String,
    pub checkout: PathBuf,
    pub clone_depth: u32,
    pub default_branch: Option<String>,
    pub allow_prerelease: bool,
    pub frontend_dir: PathBuf,
    pub assets_output: PathBuf,
    pub sub_packages: Vec<SubPackage>,
}

impl Default for ExternalSource {
    fn default() -> Self {
        Self {
            name: "apache-superset".into(),
            module: "superset".into(),
            repo_url: "https://github.com/apache/superset.git".into(),
            checkout: PathBuf::from("superset-src"),
            clone_depth: 100,
            default_branch: None,
            allow_prerelease: false,
            frontend_dir: PathBuf::from("superset-frontend"),
            assets_output: PathBuf::from("superset/static/assets"),
            sub_packages: vec![
                SubPackage {
                    dir: PathBuf::from("superset-core"),
                    name: "apache-superset-core".into(),
                },
                SubPackage {
                    dir: PathBuf::from("superset-extensions-cli"),
                    name: "superset-extensions-cli".into(),
                },
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SubPackage {
    pub dir: PathBuf,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WrapperApp {
    pub name: String,
    pub module: String,
    pub version: String,
    pub source_dir: PathBuf,
}

impl Default for WrapperApp {
    fn default() -> Self {
        Self {
            name: "pyPASreporterGUI".into(),
            module: "pypasreportergui".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            source_dir: PathBuf::from("."),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(transparent)]
pub struct CompanionPackages(pub Vec<String>);

impl Default for CompanionPackages {
    fn default() -> Self {
        Self(vec![
            "duckdb>=0.10.0".into(),
            "duckdb-engine>=0.10.0".into(),
        ])
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MatrixPaths {
    pub json: PathBuf,
    pub markdown: Option<PathBuf>,
}

impl Default for MatrixPaths {
    fn default() -> Self {
        Self {
            json: PathBuf::from("VERSION_MATRIX.json"),
            markdown: Some(PathBuf::from("docs/VERSION_MATRIX.md")),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DistSettings {
    pub output: PathBuf,
}

impl Default for DistSettings {
    fn default() -> Self {
        Self {
            output: PathBuf::from("dist/wheels"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let temp = tempdir().unwrap();
        let config = ForgeConfig::load_or_default(&temp.path().join("forge.yaml")).unwrap();
        assert_eq!(config.root, temp.path());
        assert_eq!(config.checkout_dir(), temp.path().join("superset-src"));
        assert_eq!(config.companion_packages.0.len(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_yaml_keeps_other_defaults() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("forge.yaml");
        std::fs::write(
            &path,
            "external:\n  checkout: vendor/superset\n  allow_prerelease: true\n",
        )
        .unwrap();
        let config = ForgeConfig::load(&path).unwrap();
        assert_eq!(config.checkout_dir(), temp.path().join("vendor/superset"));
        assert!(config.external.allow_prerelease);
        assert_eq!(config.external.module, "superset");
        assert_eq!(config.matrix_path(), temp.path().join("VERSION_MATRIX.json"));
    }

    #[test]
    fn duplicate_sub_packages_are_rejected() {
        let mut config = ForgeConfig::default();
        let dup = config.external.sub_packages[0].clone();
        config.external.sub_packages.push(dup);
        let report = config.validate();
        assert!(!report.is_ok());
        assert!(report.errors[0].contains("superset-core"));
    }
}
