use crate::artifact::{ArtifactKind, CrashDestination};
use std::fmt;
use std::process::ExitStatus;

/// How the target process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetExit {
    /// Exit status zero.
    Clean,
    /// Terminated by SIGSEGV or SIGABRT.
    Crashed { signal: i32 },
    /// Any other non-zero exit or terminating signal.
    Abnormal {
        code: Option<i32>,
        signal: Option<i32>,
    },
    /// Killed by the supervisor after an interrupt.
    Killed,
    /// Still alive after the exit wait expired; killed by the supervisor.
    Unresponsive,
}

impl TargetExit {
    /// Maps a process exit status onto the crash categories.
    ///
    /// SIGSEGV and SIGABRT are crashes. Any other signal or a non-zero exit code is
    /// abnormal. Exit code zero is clean.
    pub fn classify(status: ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;

        match (status.code(), status.signal()) {
            (Some(0), _) => TargetExit::Clean,
            (_, Some(signal)) if signal == libc::SIGSEGV || signal == libc::SIGABRT => {
                TargetExit::Crashed { signal }
            }
            (code, signal) => TargetExit::Abnormal { code, signal },
        }
    }

    /// Whether the exit alone is evidence of a bug.
    pub fn is_failure(&self) -> bool {
        matches!(self, TargetExit::Crashed { .. } | TargetExit::Abnormal { .. })
    }
}

fn signal_name(signal: i32) -> String {
    match signal {
        libc::SIGSEGV => "SIGSEGV".to_string(),
        libc::SIGABRT => "SIGABRT".to_string(),
        libc::SIGKILL => "SIGKILL".to_string(),
        libc::SIGTERM => "SIGTERM".to_string(),
        libc::SIGBUS => "SIGBUS".to_string(),
        other => format!("signal {other}"),
    }
}

impl fmt::Display for TargetExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetExit::Clean => write!(f, "exited cleanly"),
            TargetExit::Crashed { signal } => write!(f, "crashed ({})", signal_name(*signal)),
            TargetExit::Abnormal {
                signal: Some(signal),
                ..
            } => write!(f, "terminated abnormally ({})", signal_name(*signal)),
            TargetExit::Abnormal {
                code: Some(code), ..
            } => write!(f, "exited abnormally with code {code}"),
            TargetExit::Abnormal { .. } => write!(f, "exited abnormally"),
            TargetExit::Killed => write!(f, "killed after interrupt"),
            TargetExit::Unresponsive => write!(f, "unresponsive, killed"),
        }
    }
}

/// A query failure recorded by a fuzzer, waiting for the target's exit status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCrash {
    /// Bytes of the mutation buffer that make up the artifact.
    pub size: usize,
    pub kind: ArtifactKind,
    pub query: String,
    pub reason: String,
}

/// Everything known about a captured crash.
#[derive(Debug, Clone)]
pub struct CrashReport {
    pub exit: TargetExit,
    pub description: String,
    /// MD5 of the artifact bytes, hex encoded.
    pub input_hash: String,
    pub size: usize,
    pub kind: ArtifactKind,
    pub destination: Option<CrashDestination>,
}

/// Turns a recorded query failure plus the target's exit into a crash report.
#[derive(Debug, Default)]
pub struct CrashOracle;

impl CrashOracle {
    /// Creates a new `CrashOracle`.
    pub fn new() -> Self {
        CrashOracle
    }

    /// `artifact` is the crashing input, already cut to `pending.size`.
    pub fn examine(&self, pending: &PendingCrash, exit: TargetExit, artifact: &[u8]) -> CrashReport {
        let description = format!(
            "target {exit} after query `{}` failed: {}",
            pending.query, pending.reason
        );
        CrashReport {
            exit,
            description,
            input_hash: format!("{:x}", md5::compute(artifact)),
            size: artifact.len(),
            kind: pending.kind,
            destination: None,
        }
    }
}
