//! The `shell` language handler: the one built-in `LanguageHandler` the CLI registers so a
//! `targets.toml` manifest is buildable without a real per-language toolchain plugged in.
//!
//! Reads the `command`/`outputs`/`env.*` config keys [`crate::manifest::ManifestTargetProvider`]
//! populates and turns them into a single `ActionSpec`. One target, one action — targets that
//! need to fan out per source file need a richer handler than this one.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use builder_core::model::{ActionSpec, ActionType, ConfigValue, Target};
use builder_core::traits::{HandlerContext, LanguageHandler};

use crate::manifest::{COMMAND_KEY, ENV_KEY_PREFIX, OUTPUTS_KEY};

/// Language tag this handler registers under.
pub const LANGUAGE_TAG: &str = "shell";

/// Turns a manifest target's `command` string into a single sandboxed shell invocation.
#[derive(Debug, Default)]
pub struct ShellLanguageHandler;

impl LanguageHandler for ShellLanguageHandler {
    fn build_spec(&self, target: &Target, context: &HandlerContext) -> Vec<ActionSpec> {
        let command = match target.config.get(COMMAND_KEY) {
            Some(ConfigValue::Scalar(s)) => s.clone(),
            Some(ConfigValue::List(items)) => items.join(" && "),
            None => "true".to_string(),
        };

        let declared_outputs = match target.config.get(OUTPUTS_KEY) {
            Some(ConfigValue::List(items)) => items.iter().map(PathBuf::from).collect(),
            Some(ConfigValue::Scalar(s)) => BTreeSet::from([PathBuf::from(s)]),
            None => BTreeSet::new(),
        };

        let mut env: BTreeMap<String, String> = target
            .config
            .iter()
            .filter_map(|(k, v)| {
                let key = k.strip_prefix(ENV_KEY_PREFIX)?;
                match v {
                    ConfigValue::Scalar(s) => Some((key.to_string(), s.clone())),
                    ConfigValue::List(_) => None,
                }
            })
            .collect();
        for (k, v) in &context.env_allowlist {
            let _ = env.entry(k.clone()).or_insert_with(|| v.clone());
        }

        vec![ActionSpec {
            target_id: target.id.clone(),
            action_type: ActionType::Codegen,
            sub_id: None,
            command: vec![command],
            workdir: context.workspace_root.clone(),
            env,
            inputs: target.sources.iter().cloned().collect(),
            declared_outputs,
            tool_versions: self.tool_versions(context),
        }]
    }

    fn tool_versions(&self, _context: &HandlerContext) -> BTreeMap<String, String> {
        let mut versions = BTreeMap::new();
        let _ = versions.insert("sh".to_string(), "posix".to_string());
        versions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use builder_core::model::{TargetId, TargetKind};
    use std::path::Path;

    #[test]
    fn default_command_is_a_no_op() {
        let handler = ShellLanguageHandler;
        let target = Target {
            id: TargetId::from("//a:b"),
            kind: TargetKind::Data,
            language: LANGUAGE_TAG.to_string(),
            sources: vec![],
            deps: BTreeSet::new(),
            config: BTreeMap::new(),
        };
        let context = HandlerContext {
            workspace_root: Path::new("/ws").to_path_buf(),
            env_allowlist: BTreeMap::new(),
        };
        let specs = handler.build_spec(&target, &context);
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].command, vec!["true".to_string()]);
    }

    #[test]
    fn reads_command_outputs_and_env() {
        let handler = ShellLanguageHandler;
        let mut config = BTreeMap::new();
        let _ = config.insert(
            COMMAND_KEY.to_string(),
            ConfigValue::Scalar("echo hi > out.txt".to_string()),
        );
        let _ = config.insert(
            OUTPUTS_KEY.to_string(),
            ConfigValue::List(vec!["out.txt".to_string()]),
        );
        let _ = config.insert(
            format!("{ENV_KEY_PREFIX}GREETING"),
            ConfigValue::Scalar("hi".to_string()),
        );
        let target = Target {
            id: TargetId::from("//a:b"),
            kind: TargetKind::Generator,
            language: LANGUAGE_TAG.to_string(),
            sources: vec![],
            deps: BTreeSet::new(),
            config,
        };
        let context = HandlerContext {
            workspace_root: Path::new("/ws").to_path_buf(),
            env_allowlist: BTreeMap::new(),
        };
        let specs = handler.build_spec(&target, &context);
        assert_eq!(specs[0].declared_outputs, BTreeSet::from([PathBuf::from("out.txt")]));
        assert_eq!(specs[0].env.get("GREETING"), Some(&"hi".to_string()));
    }
}
