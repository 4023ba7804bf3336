//! `ActionKey` derivation (§3 "`ActionKey = H(target_id, action_type, sub_id, command,
//! sorted env, sorted input content hashes, sorted declared outputs, tool versions)`", §4.7
//! step 3).
//!
//! `ActionSpec`'s `env`/`inputs`/`declared_outputs`/`tool_versions` fields are already
//! `BTreeMap`/`BTreeSet`, so their iteration order is canonical for free; this module only has
//! to fold each field into its own sub-digest and combine them with `ContentHasher::hash_composite`
//! so that two specs differing only in, say, environment never collide on key material meant
//! for inputs.

use std::path::Path;

use builder_core::model::{ActionKey, ActionSpec};
use builder_hash::ContentHasher;

use crate::error::{Result, RunnerError};

/// Derives the content-hash identity of `spec`, hashing every declared input's file content
/// relative to `workspace_root`.
///
/// Fails with [`RunnerError::Hash`] if a declared input is missing or unreadable — a stale or
/// wrong `ActionSpec` is a handler bug, not a transient condition, so this is never retried by
/// itself (the caller's retry policy governs the action's own exit status, not key derivation).
pub fn compute_action_key(
    hasher: &ContentHasher,
    workspace_root: &Path,
    spec: &ActionSpec,
) -> Result<ActionKey> {
    let command_digest = hasher.hash_bytes(encode_strings(&spec.command).as_bytes());

    let mut env_buf = String::new();
    for (k, v) in &spec.env {
        env_buf.push_str(k);
        env_buf.push('=');
        env_buf.push_str(v);
        env_buf.push('\0');
    }
    let env_digest = hasher.hash_bytes(env_buf.as_bytes());

    let mut input_parts = Vec::with_capacity(spec.inputs.len());
    for input in &spec.inputs {
        let path = workspace_root.join(input);
        let digest = hasher
            .hash_file(&path)
            .map_err(RunnerError::Hash)?;
        input_parts.push((input.display().to_string(), digest));
    }
    let inputs_digest = hasher.hash_composite(
        input_parts
            .iter()
            .map(|(label, digest)| (label.as_str(), *digest)),
    );

    let outputs_digest = hasher.hash_bytes(
        encode_strings(
            &spec
                .declared_outputs
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>(),
        )
        .as_bytes(),
    );

    let mut tools_buf = String::new();
    for (tool, version) in &spec.tool_versions {
        tools_buf.push_str(tool);
        tools_buf.push('=');
        tools_buf.push_str(version);
        tools_buf.push('\0');
    }
    let tools_digest = hasher.hash_bytes(tools_buf.as_bytes());

    let sub_id = spec.sub_id.clone().unwrap_or_default();
    let key_digest = hasher.hash_composite([
        ("target_id", hasher.hash_bytes(spec.target_id.0.as_bytes())),
        (
            "action_type",
            hasher.hash_bytes(spec.action_type.to_string().as_bytes()),
        ),
        ("sub_id", hasher.hash_bytes(sub_id.as_bytes())),
        ("command", command_digest),
        ("env", env_digest),
        ("inputs", inputs_digest),
        ("outputs", outputs_digest),
        ("tool_versions", tools_digest),
    ]);

    Ok(ActionKey(key_digest))
}

fn encode_strings(items: &[String]) -> String {
    let mut buf = String::new();
    for item in items {
        buf.push_str(item);
        buf.push('\0');
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use builder_core::model::{ActionType, TargetId};
    use std::collections::{BTreeMap, BTreeSet};
    use std::path::PathBuf;

    fn spec(command: &str) -> ActionSpec {
        ActionSpec {
            target_id: TargetId::from("//a:b"),
            action_type: ActionType::Compile,
            sub_id: None,
            command: vec![command.to_string()],
            workdir: PathBuf::from("."),
            env: BTreeMap::new(),
            inputs: BTreeSet::new(),
            declared_outputs: BTreeSet::new(),
            tool_versions: BTreeMap::new(),
        }
    }

    #[test]
    fn same_spec_produces_same_key() {
        let hasher = ContentHasher::default();
        let dir = tempfile::tempdir().unwrap();
        let a = compute_action_key(&hasher, dir.path(), &spec("echo hi")).unwrap();
        let b = compute_action_key(&hasher, dir.path(), &spec("echo hi")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn different_commands_produce_different_keys() {
        let hasher = ContentHasher::default();
        let dir = tempfile::tempdir().unwrap();
        let a = compute_action_key(&hasher, dir.path(), &spec("echo hi")).unwrap();
        let b = compute_action_key(&hasher, dir.path(), &spec("echo bye")).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn input_content_changes_the_key() {
        let hasher = ContentHasher::default();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("in.txt"), b"v1").unwrap();

        let mut s = spec("echo hi");
        let _ = s.inputs.insert(PathBuf::from("in.txt"));
        let before = compute_action_key(&hasher, dir.path(), &s).unwrap();

        std::fs::write(dir.path().join("in.txt"), b"v2").unwrap();
        let after = compute_action_key(&hasher, dir.path(), &s).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn missing_input_is_an_error() {
        let hasher = ContentHasher::default();
        let dir = tempfile::tempdir().unwrap();
        let mut s = spec("echo hi");
        let _ = s.inputs.insert(PathBuf::from("missing.txt"));
        assert!(compute_action_key(&hasher, dir.path(), &s).is_err());
    }
}
