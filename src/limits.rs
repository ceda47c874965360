// src/limits.rs
use std::process::ExitStatus;

/// Raw exit codes produced by signal deaths (`128 + signal`) that carry a
/// meaning for resource enforcement.
const SIGNAL_EXIT_CODES: &[(i32, ExitCode)] = &[
    (137, ExitCode::SigKill),
    (139, ExitCode::SigSegv),
    (152, ExitCode::SigCpu),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success,
    /// Killed by SIGKILL, usually the OOM killer or an external kill.
    SigKill,
    /// Segmentation fault, also used by generated scripts for `MemoryError`.
    SigSegv,
    /// CPU time limit exceeded (SIGXCPU).
    SigCpu,
    Unknown(i32),
}

impl ExitCode {
    pub fn parse(raw: i32) -> Self {
        if raw == 0 {
            return ExitCode::Success;
        }
        SIGNAL_EXIT_CODES
            .iter()
            .find(|(code, _)| *code == raw)
            .map(|(_, exit)| *exit)
            .unwrap_or(ExitCode::Unknown(raw))
    }

    /// Normalizes a process status to a shell-style raw code; signal deaths
    /// become `128 + signal`.
    pub fn raw(status: &ExitStatus) -> Option<i32> {
        if let Some(code) = status.code() {
            return Some(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            status.signal().map(|signal| 128 + signal)
        }
        #[cfg(not(unix))]
        {
            None
        }
    }
}

/// Address-space and CPU caps applied through a `ulimit` shell prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub memory_kb: u64,
    pub cpu_time_secs: u64,
}

impl ResourceLimits {
    pub fn memory_limit(&self) -> String {
        format!("ulimit -v {};", self.memory_kb)
    }

    pub fn cpu_time_limit(&self) -> String {
        format!("ulimit -t {};", self.cpu_time_secs)
    }

    /// Prefixes `argv` so it runs under the limits. The original argv is
    /// passed as positional parameters and re-executed verbatim, so nothing
    /// in it needs shell quoting.
    pub fn wrap(&self, argv: Vec<String>) -> Vec<String> {
        let mut wrapped = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            format!("{} {} exec \"$0\" \"$@\"", self.memory_limit(), self.cpu_time_limit()),
        ];
        wrapped.extend(argv);
        wrapped
    }
}
