#![deny(clippy::all)]

mod utils;

mod child;
mod compare;
mod compile;
mod hardening;
mod judge;
mod lang;
mod limit;
mod pipe;
mod proc;
mod run;
mod signal;
mod verdict;
mod workspace;

pub use crate::child::SetupStage;
pub use crate::compare::{compare, normalize_line_endings, CompareMode, CompareResult};
pub use crate::compile::{CompileOutput, Compiler, DEFAULT_COMPILE_TIMEOUT};
pub use crate::hardening::{Hardening, NoHardening, NoNewPrivs};
pub use crate::judge::{
    CompileReport, CompileStatus, Judge, JudgeConfig, JudgeOutcome, JudgeReport, JudgeRequest,
    Submission,
};
pub use crate::lang::{Language, Toolchain, UnknownLanguage, PYTHON3};
pub use crate::run::{classify, Supervisor, CPU_TIME_TOLERANCE, DEFAULT_POLL_INTERVAL};
pub use crate::verdict::{Classification, Verdict, VerdictKind};
pub use crate::workspace::Workspace;

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

/// Caps applied to one run of an untrusted program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimit {
    pub cpu_time: Duration,
    pub wall_time: Duration,
    pub memory: u64, // bytes
    pub stack: u64,  // bytes
    pub output: u64, // bytes
}

impl ResourceLimit {
    /// Extra real time granted on top of the CPU limit.
    pub const WALL_TIME_GRACE: Duration = Duration::from_secs(2);
    pub const DEFAULT_OUTPUT: u64 = 32 * 1024 * 1024;
    pub const DEFAULT_STACK: u64 = 128 * 1024 * 1024;

    /// Derives the wall clock limit and the default stack and output caps.
    pub fn new(cpu_time: Duration, memory: u64) -> Self {
        Self {
            cpu_time,
            wall_time: cpu_time.saturating_add(Self::WALL_TIME_GRACE),
            memory,
            stack: Self::DEFAULT_STACK,
            output: Self::DEFAULT_OUTPUT,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.cpu_time.is_zero() {
            anyhow::bail!("cpu time limit must be positive");
        }
        if self.wall_time < self.cpu_time {
            anyhow::bail!(
                "wall time limit must not be below cpu time limit: wall = {:?}, cpu = {:?}",
                self.wall_time,
                self.cpu_time
            );
        }
        if self.memory == 0 {
            anyhow::bail!("memory limit must be positive");
        }
        Ok(())
    }
}

/// Measured consumption of one reaped child.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceUsage {
    pub cpu_time: Duration,  // user + sys
    pub wall_time: Duration, // spawn to reap
    pub peak_memory: u64,    // bytes
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub program: PathBuf,

    pub args: Vec<OsString>,

    /// `NAME` inherits the variable from this process, `NAME=value` is passed as is.
    pub env: Vec<OsString>,

    pub language: Language,

    pub work_dir: Option<PathBuf>,

    pub stdin: Option<PathBuf>,

    pub stdout: PathBuf,

    pub stderr: PathBuf,

    pub limit: ResourceLimit,
}

impl SandboxConfig {
    pub fn new(
        program: impl Into<PathBuf>,
        language: Language,
        stdout: impl Into<PathBuf>,
        stderr: impl Into<PathBuf>,
        limit: ResourceLimit,
    ) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            language,
            work_dir: None,
            stdin: None,
            stdout: stdout.into(),
            stderr: stderr.into(),
            limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_limits() {
        let limit = ResourceLimit::new(Duration::from_millis(1500), 256 << 20);
        assert_eq!(limit.wall_time, Duration::from_millis(3500));
        assert_eq!(limit.stack, 128 << 20);
        assert_eq!(limit.output, 32 << 20);
        assert!(limit.validate().is_ok());
    }

    #[test]
    fn wall_below_cpu_is_rejected() {
        let mut limit = ResourceLimit::new(Duration::from_secs(2), 1 << 20);
        limit.wall_time = Duration::from_secs(1);
        assert!(limit.validate().is_err());

        limit.wall_time = Duration::from_secs(2);
        assert!(limit.validate().is_ok());
    }

    #[test]
    fn huge_cpu_limit_saturates() {
        let limit = ResourceLimit::new(Duration::MAX, 1 << 20);
        assert_eq!(limit.wall_time, Duration::MAX);
        assert!(limit.validate().is_ok());
    }

    #[test]
    fn zero_cpu_is_rejected() {
        let limit = ResourceLimit::new(Duration::ZERO, 1 << 20);
        assert!(limit.validate().is_err());
    }
}
