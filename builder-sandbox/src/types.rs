//! The sandbox's I/O/T/N model (§4.2).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Network reachability granted to a sandboxed action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkPolicy {
    /// No network access; the sandbox's network namespace has no interfaces configured.
    Hermetic,
    /// Loopback only.
    LoopbackOnly,
    /// Access restricted to an explicit host allow-list.
    AllowList(Vec<String>),
}

impl Default for NetworkPolicy {
    fn default() -> Self {
        NetworkPolicy::Hermetic
    }
}

/// Resource ceilings enforced on the sandboxed process, generalized from cgroup-v2 knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    /// CPU time budget.
    pub cpu_time: Option<Duration>,
    /// Wall-clock deadline.
    pub wall_time: Option<Duration>,
    /// Resident memory ceiling in bytes.
    pub memory_bytes: Option<u64>,
    /// Maximum open file descriptors.
    pub max_open_files: Option<u64>,
}

impl ResourceLimits {
    /// No limits enforced (other than what the kernel imposes anyway).
    pub fn unlimited() -> Self {
        ResourceLimits {
            cpu_time: None,
            wall_time: None,
            memory_bytes: None,
            max_open_files: None,
        }
    }

    /// Conservative defaults suitable for most compile/link/test actions.
    pub fn default_limits() -> Self {
        ResourceLimits {
            cpu_time: Some(Duration::from_secs(600)),
            wall_time: Some(Duration::from_secs(900)),
            memory_bytes: Some(4 * 1024 * 1024 * 1024),
            max_open_files: Some(1024),
        }
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        ResourceLimits::default_limits()
    }
}

/// Everything the sandbox needs to prepare and run one action.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    /// Read-only input paths, relative to the workspace root.
    pub ro_inputs: Vec<PathBuf>,
    /// Declared output paths; only these survive `O` after teardown.
    pub declared_outputs: Vec<PathBuf>,
    /// Fully enumerated environment.
    pub env: BTreeMap<String, String>,
    /// Argv vector; `command[0]` is the program (or a shell one-liner when `command.len() == 1`).
    pub command: Vec<String>,
    /// Working directory inside the sandbox, relative to its root.
    pub cwd: PathBuf,
    /// Network reachability for this action.
    pub network_policy: NetworkPolicy,
    /// Resource ceilings for this action.
    pub resource_limits: ResourceLimits,
    /// Scratch space budget in megabytes for the `T` temp set.
    pub tmp_size_mb: u64,
}

impl SandboxSpec {
    /// Builds a spec for `command` with empty I/O and sane defaults, for callers that only
    /// care about a handful of fields.
    pub fn new(command: Vec<String>) -> Self {
        SandboxSpec {
            ro_inputs: Vec::new(),
            declared_outputs: Vec::new(),
            env: BTreeMap::new(),
            command,
            cwd: PathBuf::from("."),
            network_policy: NetworkPolicy::default(),
            resource_limits: ResourceLimits::default(),
            tmp_size_mb: 512,
        }
    }

    /// Validates the I ∩ O = ∅ invariant ahead of sandbox construction.
    pub fn inputs_outputs_disjoint(&self) -> bool {
        self.ro_inputs
            .iter()
            .all(|input| !self.declared_outputs.contains(input))
    }
}

/// Result of a completed sandbox run.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// Process exit code.
    pub exit_code: i32,
    /// Captured stdout, bounded by the caller's logging policy.
    pub stdout: Vec<u8>,
    /// Captured stderr, bounded by the caller's logging policy.
    pub stderr: Vec<u8>,
    /// Wall-clock duration of the run.
    pub duration: Duration,
    /// Peak resident memory, when the backend can observe it.
    pub peak_memory_bytes: Option<u64>,
}

impl ExecResult {
    /// Whether the process exited with status zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}
