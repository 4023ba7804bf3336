//! Hermetic sandbox contract (§4.2).
//!
//! A `Sandbox` is a scoped execution context: it validates `I ∩ O = ∅` at construction,
//! runs one command, hashes declared outputs, and tears itself down on every exit path —
//! including panics and cancellation — via `Drop`.

#![warn(missing_docs)]
#![warn(unused_results)]

mod backend;
mod error;
mod types;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub use backend::SandboxBackend;
pub use error::{Result, SandboxError};
pub use types::{ExecResult, NetworkPolicy, ResourceLimits, SandboxSpec};

use builder_core::model::Digest;

/// A prepared, scoped execution context for a single action.
///
/// `prepare` validates the I/O invariant and materializes a private root under
/// `sandbox_root`; `run` executes the command via the selected backend; `collect_outputs`
/// hashes the declared outputs; `teardown` (idempotent, also invoked by `Drop`) purges the
/// scratch set and removes the sandbox root.
pub struct Sandbox {
    spec: SandboxSpec,
    root: PathBuf,
    backend: SandboxBackend,
    torn_down: bool,
}

impl Sandbox {
    /// Validates `spec` and materializes a fresh sandbox rooted at `sandbox_root`.
    ///
    /// Returns `SandboxError::InputOutputOverlap` if any declared input is also a declared
    /// output — this check runs before anything is created on disk.
    pub fn prepare(spec: SandboxSpec, sandbox_root: PathBuf) -> Result<Self> {
        if !spec.inputs_outputs_disjoint() {
            return Err(SandboxError::InputOutputOverlap(format!(
                "{:?}",
                spec.ro_inputs
                    .iter()
                    .filter(|i| spec.declared_outputs.contains(*i))
                    .collect::<Vec<_>>()
            )));
        }

        fs::create_dir_all(&sandbox_root)?;
        let backend = SandboxBackend::detect();

        Ok(Sandbox {
            spec,
            root: sandbox_root,
            backend,
            torn_down: false,
        })
    }

    /// Builds a sandbox with an explicit backend override (bypassing auto-detection),
    /// used when `WorkspaceConfig::sandbox_backend` pins one.
    pub fn prepare_with_backend(
        spec: SandboxSpec,
        sandbox_root: PathBuf,
        backend: SandboxBackend,
    ) -> Result<Self> {
        let mut sandbox = Self::prepare(spec, sandbox_root)?;
        sandbox.backend = backend;
        Ok(sandbox)
    }

    /// Which backend this sandbox will execute with.
    pub fn backend(&self) -> SandboxBackend {
        self.backend
    }

    /// Runs the action's command. Blocks the calling thread for the duration of the
    /// process; cancellation is the caller's responsibility (send a terminate signal to
    /// the process this returns control to the caller about, or drop the sandbox, which
    /// tears down mounts but does not itself kill a still-running child).
    pub fn run(&self) -> Result<ExecResult> {
        self.backend.execute(&self.spec, &self.root)
    }

    /// Hashes every declared output under the sandbox's work directory.
    ///
    /// A declared-but-missing output is a fatal `MissingOutput` error. Files found under
    /// the work directory that were NOT declared are reported as warnings via the returned
    /// vector rather than failing the whole collection — the caller (the action runner)
    /// decides whether undeclared writes exceed policy.
    pub fn collect_outputs(
        &self,
        hasher: &builder_hash::ContentHasher,
    ) -> Result<(BTreeMap<PathBuf, (Digest, u64)>, Vec<PathBuf>)> {
        let work_dir = self.root.join("work");
        let mut outputs = BTreeMap::new();
        for declared in &self.spec.declared_outputs {
            let path = work_dir.join(declared);
            let meta = fs::metadata(&path)
                .map_err(|_| SandboxError::MissingOutput(declared.display().to_string()))?;
            let digest = hasher
                .hash_file(&path)
                .map_err(|e| SandboxError::ExecutionError(e.to_string()))?;
            let _ = outputs.insert(declared.clone(), (digest, meta.len()));
        }

        let mut undeclared = Vec::new();
        if work_dir.is_dir() {
            for entry in walkdir_files(&work_dir) {
                let relative = entry.strip_prefix(&work_dir).unwrap_or(&entry).to_path_buf();
                if !self.spec.declared_outputs.contains(&relative)
                    && !self.spec.ro_inputs.contains(&relative)
                {
                    undeclared.push(relative);
                }
            }
        }

        Ok((outputs, undeclared))
    }

    /// Idempotently tears down the sandbox: unmounts any bind mounts, and removes the
    /// sandbox root so the `T` scratch set does not survive.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        let work_dir = self.root.join("work");
        backend::teardown_native_mounts(&work_dir, &self.spec.ro_inputs);
        let _ = fs::remove_dir_all(&self.root);
        self.torn_down = true;
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn walkdir_files(root: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                out.push(path);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_overlapping_io() {
        let mut spec = SandboxSpec::new(vec!["true".to_string()]);
        spec.ro_inputs.push(PathBuf::from("shared.txt"));
        spec.declared_outputs.push(PathBuf::from("shared.txt"));

        let tmp = tempfile::tempdir().unwrap();
        let result = Sandbox::prepare(spec, tmp.path().join("sandbox"));
        assert!(matches!(result, Err(SandboxError::InputOutputOverlap(_))));
    }

    #[test]
    fn best_effort_round_trip_produces_declared_output() {
        let tmp = tempfile::tempdir().unwrap();
        let mut spec = SandboxSpec::new(vec!["echo hi > out.txt".to_string()]);
        spec.declared_outputs.push(PathBuf::from("out.txt"));

        let sandbox = Sandbox::prepare_with_backend(
            spec,
            tmp.path().join("sandbox"),
            SandboxBackend::BestEffort,
        )
        .unwrap();
        let result = sandbox.run().unwrap();
        assert!(result.success());

        let hasher = builder_hash::ContentHasher::default();
        let (outputs, undeclared) = sandbox.collect_outputs(&hasher).unwrap();
        assert_eq!(outputs.len(), 1);
        assert!(undeclared.is_empty());
    }

    #[test]
    fn missing_declared_output_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let mut spec = SandboxSpec::new(vec!["true".to_string()]);
        spec.declared_outputs.push(PathBuf::from("never-written.txt"));

        let sandbox = Sandbox::prepare_with_backend(
            spec,
            tmp.path().join("sandbox"),
            SandboxBackend::BestEffort,
        )
        .unwrap();
        let _ = sandbox.run().unwrap();

        let hasher = builder_hash::ContentHasher::default();
        let err = sandbox.collect_outputs(&hasher);
        assert!(matches!(err, Err(SandboxError::MissingOutput(_))));
    }

    #[test]
    fn teardown_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = SandboxSpec::new(vec!["true".to_string()]);
        let mut sandbox = Sandbox::prepare_with_backend(
            spec,
            tmp.path().join("sandbox"),
            SandboxBackend::BestEffort,
        )
        .unwrap();
        sandbox.teardown();
        sandbox.teardown();
        assert!(!sandbox.root.exists());
    }
}
