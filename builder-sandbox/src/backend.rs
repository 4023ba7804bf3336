//! Platform sandbox backends (§4.2 "Platform strategy").
//!
//! Selection prefers the strongest isolation the host actually offers and degrades
//! gracefully rather than refusing to build: `NativeNamespace` on Linux, `SandboxExec` on
//! macOS, `BestEffort` (prefix enforcement only, explicitly flagged) everywhere else —
//! including the documented-but-unimplemented Windows Job Objects branch.

use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::error::{Result, SandboxError};
use crate::types::{ExecResult, SandboxSpec};

#[cfg(target_os = "linux")]
mod native;

/// Unmounts any bind mounts the native backend placed for this sandbox's declared inputs.
/// A no-op off Linux, where no such mounts were ever made.
#[cfg(target_os = "linux")]
pub(crate) fn teardown_native_mounts(work_dir: &Path, ro_inputs: &[std::path::PathBuf]) {
    native::teardown_mounts(work_dir, ro_inputs);
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn teardown_native_mounts(_work_dir: &Path, _ro_inputs: &[std::path::PathBuf]) {}

/// Which isolation mechanism a `Sandbox` actually uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxBackend {
    /// Linux namespaces (mount/PID/network/user) driven directly via `nix`.
    NativeNamespace,
    /// macOS `sandbox-exec` with a generated profile.
    SandboxExec,
    /// Prefix-based enforcement only; no kernel isolation. Always flagged in the result.
    BestEffort,
}

impl SandboxBackend {
    /// Picks the strongest backend the current host can actually support.
    pub fn detect() -> Self {
        #[cfg(target_os = "linux")]
        {
            info!("sandbox backend: native Linux namespaces");
            return SandboxBackend::NativeNamespace;
        }

        #[cfg(target_os = "macos")]
        {
            if Command::new("sandbox-exec").arg("-h").output().is_ok() {
                info!("sandbox backend: sandbox-exec");
                return SandboxBackend::SandboxExec;
            }
            warn!("sandbox-exec not found, unusual on macOS");
        }

        warn!("sandbox backend: best-effort (no kernel isolation available)");
        SandboxBackend::BestEffort
    }

    /// Runs `spec` inside `sandbox_root` using this backend.
    pub fn execute(&self, spec: &SandboxSpec, sandbox_root: &Path) -> Result<ExecResult> {
        match self {
            #[cfg(target_os = "linux")]
            SandboxBackend::NativeNamespace => native::execute(spec, sandbox_root),
            #[cfg(not(target_os = "linux"))]
            SandboxBackend::NativeNamespace => {
                warn!("native namespace backend requested off Linux; falling back to best-effort");
                Self::execute_best_effort(spec, sandbox_root)
            }
            SandboxBackend::SandboxExec => Self::execute_sandbox_exec(spec, sandbox_root),
            SandboxBackend::BestEffort => Self::execute_best_effort(spec, sandbox_root),
        }
    }

    fn command_for(spec: &SandboxSpec) -> Command {
        if spec.command.len() == 1 {
            let mut cmd = Command::new("bash");
            let _ = cmd.arg("-c").arg(&spec.command[0]);
            cmd
        } else {
            let mut cmd = Command::new(&spec.command[0]);
            let _ = cmd.args(&spec.command[1..]);
            cmd
        }
    }

    fn execute_sandbox_exec(spec: &SandboxSpec, sandbox_root: &Path) -> Result<ExecResult> {
        let start = Instant::now();
        let work_dir = sandbox_root.join("work");
        fs::create_dir_all(&work_dir)?;

        let profile = macos_sandbox_profile(&work_dir);
        let profile_path = sandbox_root.join("sandbox.sb");
        fs::write(&profile_path, profile)?;

        let mut cmd = Command::new("sandbox-exec");
        let _ = cmd.arg("-f").arg(&profile_path);
        let _ = cmd.current_dir(&work_dir);
        let _ = cmd.env_clear();
        for (key, value) in &spec.env {
            let _ = cmd.env(key, value);
        }
        let _ = cmd.env("HOME", "/tmp").env("PATH", "/usr/bin:/bin");

        let inner = Self::command_for(spec);
        let _ = cmd.arg(inner.get_program());
        for arg in inner.get_args() {
            let _ = cmd.arg(arg);
        }

        let _ = cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        debug!(?cmd, "executing via sandbox-exec");
        let output = cmd
            .output()
            .map_err(|e| SandboxError::ExecutionError(e.to_string()))?;

        Ok(ExecResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
            duration: start.elapsed(),
            peak_memory_bytes: None,
        })
    }

    fn execute_best_effort(spec: &SandboxSpec, sandbox_root: &Path) -> Result<ExecResult> {
        warn!("best-effort sandbox: no kernel isolation, prefix enforcement only");
        let start = Instant::now();
        let work_dir = sandbox_root.join("work");
        fs::create_dir_all(&work_dir)?;

        let mut cmd = Self::command_for(spec);
        let _ = cmd.current_dir(&work_dir);
        let _ = cmd.env_clear();
        for (key, value) in &spec.env {
            let _ = cmd.env(key, value);
        }
        let _ = cmd.env("HOME", "/tmp").env("PATH", "/usr/bin:/bin:/usr/sbin:/sbin");
        let _ = cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let output = cmd
            .output()
            .map_err(|e| SandboxError::ExecutionError(e.to_string()))?;

        for output_path in &spec.declared_outputs {
            if !work_dir.join(output_path).exists() {
                warn!(path = %output_path.display(), "declared output missing after best-effort run");
            }
        }

        Ok(ExecResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
            duration: start.elapsed(),
            peak_memory_bytes: None,
        })
    }
}

fn macos_sandbox_profile(work_dir: &Path) -> String {
    format!(
        r#"(version 1)
(deny default)
(allow file-read*
    (subpath "/usr/lib")
    (subpath "/usr/bin")
    (subpath "/bin")
    (subpath "/System/Library")
    (literal "/etc/resolv.conf"))
(allow file-read* file-write*
    (subpath "{}"))
(allow process-exec
    (subpath "/usr/bin")
    (subpath "/bin"))
(allow file-read* file-write*
    (literal "/dev/null")
    (literal "/dev/zero")
    (literal "/dev/urandom"))
"#,
        work_dir.display()
    )
}
