//! The built-in target provider: a `targets.toml` manifest at the workspace root.
//!
//! The DSL/analysis layer that produces `Target`s is an external collaborator the core only
//! consumes through `TargetProvider` (§6); this module is the minimal concrete implementation
//! `builder-cli` ships so the binary is runnable without a separate build-language frontend.
//! Generalizes the teacher's TOML-driven configuration loading (`convenient_kas`'s merged KAS
//! config, `bitbake_config`) into one flat table per target rather than a layered DSL.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use builder_core::error::ConfigError;
use builder_core::model::{ConfigValue, Target, TargetId, TargetKind};
use builder_core::traits::TargetProvider;

#[derive(Debug, Default, Deserialize)]
struct ManifestFile {
    #[serde(default, rename = "target")]
    targets: Vec<ManifestTarget>,
}

#[derive(Debug, Deserialize)]
struct ManifestTarget {
    id: String,
    kind: ManifestKind,
    language: String,
    #[serde(default)]
    sources: Vec<PathBuf>,
    #[serde(default)]
    deps: Vec<String>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    outputs: Vec<PathBuf>,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ManifestKind {
    Executable,
    Library,
    Test,
    Generator,
    Data,
}

impl From<ManifestKind> for TargetKind {
    fn from(kind: ManifestKind) -> Self {
        match kind {
            ManifestKind::Executable => TargetKind::Executable,
            ManifestKind::Library => TargetKind::Library,
            ManifestKind::Test => TargetKind::Test,
            ManifestKind::Generator => TargetKind::Generator,
            ManifestKind::Data => TargetKind::Data,
        }
    }
}

/// Prefix a manifest target's config keys carry for env vars, so `ShellHandler` (or any other
/// handler reading this provider's targets) can recover them without a dedicated field on
/// `Target` itself.
pub const ENV_KEY_PREFIX: &str = "env.";

/// Config key a manifest target's shell command is stored under.
pub const COMMAND_KEY: &str = "command";

/// Config key a manifest target's declared outputs are stored under.
pub const OUTPUTS_KEY: &str = "outputs";

/// Reads `<workspace_root>/targets.toml`, normalizing each `[[target]]` table into the core's
/// `Target` model. A workspace with no manifest file yields an empty target list — an empty
/// build is valid, not an error.
#[derive(Debug, Default)]
pub struct ManifestTargetProvider;

impl TargetProvider for ManifestTargetProvider {
    fn load_targets(&self, workspace_root: &Path) -> Result<Vec<Target>, ConfigError> {
        let manifest_path = workspace_root.join("targets.toml");
        if !manifest_path.is_file() {
            return Ok(Vec::new());
        }

        let text = std::fs::read_to_string(&manifest_path)?;
        let file: ManifestFile =
            toml::from_str(&text).map_err(|source| ConfigError::TomlParse {
                path: manifest_path.display().to_string(),
                source,
            })?;

        let mut seen = BTreeSet::new();
        let mut targets = Vec::with_capacity(file.targets.len());
        for manifest_target in file.targets {
            let id = TargetId::from(manifest_target.id.as_str());
            if !seen.insert(id.clone()) {
                return Err(ConfigError::DuplicateTargetId(id.0));
            }

            let mut config = BTreeMap::new();
            if let Some(command) = manifest_target.command {
                let _ = config.insert(COMMAND_KEY.to_string(), ConfigValue::Scalar(command));
            }
            if !manifest_target.outputs.is_empty() {
                let _ = config.insert(
                    OUTPUTS_KEY.to_string(),
                    ConfigValue::List(
                        manifest_target
                            .outputs
                            .iter()
                            .map(|p| p.display().to_string())
                            .collect(),
                    ),
                );
            }
            for (key, value) in manifest_target.env {
                let _ = config.insert(format!("{ENV_KEY_PREFIX}{key}"), ConfigValue::Scalar(value));
            }

            targets.push(Target {
                id,
                kind: manifest_target.kind.into(),
                language: manifest_target.language,
                sources: manifest_target.sources,
                deps: manifest_target
                    .deps
                    .iter()
                    .map(|d| TargetId::from(d.as_str()))
                    .collect(),
                config,
            });
        }

        Ok(targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_manifest_yields_empty_targets() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ManifestTargetProvider;
        let targets = provider.load_targets(dir.path()).unwrap();
        assert!(targets.is_empty());
    }

    #[test]
    fn parses_targets_and_deps() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("targets.toml"),
            r#"
            [[target]]
            id = "//lib:a"
            kind = "generator"
            language = "shell"
            command = "echo a > a.out"
            outputs = ["a.out"]

            [[target]]
            id = "//app:b"
            kind = "executable"
            language = "shell"
            deps = ["//lib:a"]
            command = "cat a.out > b.out"
            outputs = ["b.out"]
            "#,
        )
        .unwrap();

        let provider = ManifestTargetProvider;
        let targets = provider.load_targets(dir.path()).unwrap();
        assert_eq!(targets.len(), 2);
        let app = targets.iter().find(|t| t.id.0 == "//app:b").unwrap();
        assert!(app.deps.contains(&TargetId::from("//lib:a")));
    }

    #[test]
    fn rejects_duplicate_target_ids() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("targets.toml"),
            r#"
            [[target]]
            id = "//a:b"
            kind = "data"
            language = "shell"

            [[target]]
            id = "//a:b"
            kind = "data"
            language = "shell"
            "#,
        )
        .unwrap();

        let provider = ManifestTargetProvider;
        let err = provider.load_targets(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateTargetId(_)));
    }
}
