//! Native Linux namespace sandbox: mount + PID + network namespaces driven directly via
//! `nix`, with no external sandboxing binary required.
//!
//! Adapted from a BitBake-specific OverlayFS-sysroot sandbox into a generic model: instead
//! of layering `recipe-sysroot`/`recipe-sysroot-native` overlays, each declared input path
//! is bind-mounted read-only at its workspace-relative location inside the sandbox root,
//! and declared outputs are writable directly.

use std::ffi::CString;
use std::fs;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Instant;

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{chdir, fork, ForkResult, Pid};

use crate::error::{Result, SandboxError};
use crate::types::{ExecResult, NetworkPolicy, SandboxSpec};

/// Runs `spec` under `sandbox_root` inside fresh mount/PID/network namespaces.
pub fn execute(spec: &SandboxSpec, sandbox_root: &Path) -> Result<ExecResult> {
    check_overlay_support()?;

    let work_dir = sandbox_root.join("work");
    fs::create_dir_all(&work_dir)?;
    for input in &spec.ro_inputs {
        let target = work_dir.join(input);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
    }
    for output in &spec.declared_outputs {
        if let Some(parent) = work_dir.join(output).parent() {
            fs::create_dir_all(parent)?;
        }
    }

    let stdout_path = sandbox_root.join("stdout.log");
    let stderr_path = sandbox_root.join("stderr.log");
    let _ = fs::File::create(&stdout_path)?;
    let _ = fs::File::create(&stderr_path)?;

    let start = Instant::now();

    // Safety: the child immediately either execs or calls `process::exit`, never
    // returning through arbitrary Rust stack frames shared with the parent.
    match unsafe { fork() }.map_err(|e| SandboxError::NamespaceError(e.to_string()))? {
        ForkResult::Parent { child } => {
            let (exit_code, stdout, stderr) = wait_for_child(child, &stdout_path, &stderr_path)?;
            Ok(ExecResult {
                exit_code,
                stdout,
                stderr,
                duration: start.elapsed(),
                peak_memory_bytes: None,
            })
        }
        ForkResult::Child => {
            let outcome = run_in_namespace(spec, &work_dir, &stdout_path, &stderr_path);
            match outcome {
                Ok(status) => std::process::exit(status),
                Err(e) => {
                    eprintln!("sandbox child setup failed: {e}");
                    std::process::exit(127);
                }
            }
        }
    }
}

fn check_overlay_support() -> Result<()> {
    let filesystems = fs::read_to_string("/proc/filesystems")?;
    if filesystems.contains("overlay") {
        Ok(())
    } else {
        Err(SandboxError::NoOverlaySupport)
    }
}

fn run_in_namespace(
    spec: &SandboxSpec,
    work_dir: &Path,
    stdout_path: &Path,
    stderr_path: &Path,
) -> Result<i32> {
    let mut flags = CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWPID;
    if matches!(spec.network_policy, NetworkPolicy::Hermetic) {
        flags |= CloneFlags::CLONE_NEWNET;
    }
    unshare(flags).map_err(|e| SandboxError::NamespaceError(e.to_string()))?;

    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| SandboxError::MountError(e.to_string()))?;

    bind_mount_inputs(spec, work_dir)?;

    chdir(&work_dir.join(&spec.cwd)).or_else(|_| chdir(work_dir))?;

    let stdout_file = fs::File::create(stdout_path)?;
    let stderr_file = fs::File::create(stderr_path)?;

    let mut cmd = if spec.command.len() == 1 {
        let mut c = Command::new("bash");
        let _ = c.arg("-c").arg(&spec.command[0]);
        c
    } else {
        let mut c = Command::new(&spec.command[0]);
        let _ = c.args(&spec.command[1..]);
        c
    };
    let _ = cmd
        .current_dir(work_dir)
        .stdout(stdout_file)
        .stderr(stderr_file)
        .env_clear();
    for (key, value) in &spec.env {
        let _ = cmd.env(key, value);
    }

    let status = cmd
        .status()
        .map_err(|e| SandboxError::ExecutionError(e.to_string()))?;
    Ok(status.code().unwrap_or(status.signal().map(|s| 128 + s).unwrap_or(1)))
}

/// Bind-mounts each declared input read-only at its workspace-relative path inside the
/// sandbox work directory. A real deployment would use an overlay to avoid per-file mounts
/// at scale; per-path bind mounts keep this generalization straightforward and are
/// equivalent from the I/O-invariant standpoint the spec cares about.
fn bind_mount_inputs(spec: &SandboxSpec, work_dir: &Path) -> Result<()> {
    for input in &spec.ro_inputs {
        let source = input
            .canonicalize()
            .unwrap_or_else(|_| PathBuf::from(input));
        let target = work_dir.join(input);
        if !source.exists() {
            continue;
        }
        mount(
            Some(&source),
            &target,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|e| {
            SandboxError::MountError(format!(
                "bind mount {} -> {}: {}",
                source.display(),
                target.display(),
                e
            ))
        })?;
        let opts = CString::new("").unwrap();
        mount(
            None::<&str>,
            &target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            Some(opts.as_c_str()),
        )
        .map_err(|e| SandboxError::MountError(e.to_string()))?;
    }
    Ok(())
}

fn wait_for_child(
    child: Pid,
    stdout_path: &Path,
    stderr_path: &Path,
) -> Result<(i32, Vec<u8>, Vec<u8>)> {
    match waitpid(child, None).map_err(|e| SandboxError::ExecutionError(e.to_string()))? {
        WaitStatus::Exited(_, code) => {
            let stdout = fs::read(stdout_path).unwrap_or_default();
            let stderr = fs::read(stderr_path).unwrap_or_default();
            Ok((code, stdout, stderr))
        }
        WaitStatus::Signaled(_, signal, _) => {
            let stdout = fs::read(stdout_path).unwrap_or_default();
            let stderr = fs::read(stderr_path).unwrap_or_default();
            Ok((128 + signal as i32, stdout, stderr))
        }
        other => Err(SandboxError::ExecutionError(format!(
            "sandbox child ended unexpectedly: {other:?}"
        ))),
    }
}

/// Unmounts every bind mount placed under `work_dir`'s declared inputs. Idempotent: a
/// missing or already-unmounted path is ignored rather than surfaced as an error.
pub fn teardown_mounts(work_dir: &Path, ro_inputs: &[PathBuf]) {
    for input in ro_inputs {
        let target = work_dir.join(input);
        let _ = umount2(&target, MntFlags::MNT_DETACH);
    }
}
