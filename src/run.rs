use crate::child::{run_child, ChildSetup};
use crate::hardening::Hardening;
use crate::pipe;
use crate::proc::{self, kill_and_reap_quietly};
use crate::signal::{self, send_group_signal, send_signal};
use crate::verdict::{Classification, Verdict};
use crate::{ResourceLimit, ResourceUsage, SandboxConfig};

use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use nix::sys::signal::Signal;
use nix::unistd::{self, fork, ForkResult, Pid};
use scopeguard::{guard, ScopeGuard};
use tracing::{debug, trace, warn};

/// Measurement slack before a clean exit counts as over the CPU limit.
pub const CPU_TIME_TOLERANCE: Duration = Duration::from_millis(100);

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Parent side of a sandboxed run: forks, watches the wall clock, reaps and
/// classifies.
#[derive(Debug, Clone, Copy)]
pub struct Supervisor {
    poll_interval: Duration,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

enum Exit {
    Natural(ResourceUsage),
    TimedOut(ResourceUsage),
}

impl Supervisor {
    pub fn new() -> Self {
        Self::with_poll_interval(DEFAULT_POLL_INTERVAL)
    }

    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    /// Sleep between two reap attempts, at most 1% of `wall_time`.
    pub fn quantum(&self, wall_time: Duration) -> Duration {
        self.poll_interval
            .min(wall_time / 100)
            .max(MIN_POLL_INTERVAL)
    }

    /// Runs `config` to completion and classifies the outcome.
    ///
    /// Returns `Err` when the judge itself failed (bad config, fork, wait4,
    /// report pipe). A child setup failure is a `SystemError` verdict.
    #[tracing::instrument(level = "trace", err, skip_all, fields(nonce))]
    pub fn run(&self, config: &SandboxConfig, hardening: &dyn Hardening) -> Result<Classification> {
        let nonce: u32 = rand::random();
        tracing::Span::current().record("nonce", &nonce);

        trace!(?config);

        config.limit.validate()?;

        let setup = ChildSetup::prepare(config).context("failed to prepare child")?;

        let (pipe_tx, pipe_rx) = pipe::create().context("failed to create pipe")?;

        let t0 = Instant::now();

        let child_pid = match unsafe { fork() }.context("failed to fork")? {
            ForkResult::Child => {
                drop(pipe_rx);
                run_child(&setup, hardening, &pipe_tx)
            }
            ForkResult::Parent { child } => child,
        };

        drop(pipe_tx);
        trace!(?child_pid);

        // the child does the same; whichever runs first creates the group,
        // and EACCES after exec is expected
        let _ = unistd::setpgid(child_pid, child_pid);

        let child = guard(child_pid, |pid| {
            warn!(?pid, "supervision aborted, killing child");
            kill_and_reap_quietly(pid)
        });

        let exit = self.supervise(*child, &config.limit, t0)?;
        let _ = ScopeGuard::into_inner(child);

        let report = pipe_rx
            .read_report()
            .context("failed to read child report")?;

        for (cap, err) in &report.warnings {
            warn!(cap = cap.name(), %err, "resource cap not applied");
        }

        if let Some((stage, err)) = report.fatal {
            debug!(?stage, %err, "child setup failed");
            let verdict = Verdict::system_error(format!("{}: {}", stage, err));
            return Ok(Classification::Terminal(verdict));
        }

        let classification = match exit {
            Exit::TimedOut(usage) => {
                Classification::Terminal(Verdict::time_limit("Real time limit exceeded", usage))
            }
            Exit::Natural(usage) => classify(usage, &config.limit),
        };

        debug!(?classification);

        Ok(classification)
    }

    fn supervise(&self, pid: Pid, limit: &ResourceLimit, t0: Instant) -> Result<Exit> {
        let quantum = self.quantum(limit.wall_time);
        trace!(?quantum);

        loop {
            if let Some(reaped) = proc::try_reap(pid).context("failed to wait4")? {
                let usage = reaped.into_usage(t0.elapsed());
                trace!(?usage, "child exited");
                return Ok(Exit::Natural(usage));
            }

            let elapsed = t0.elapsed();
            if elapsed >= limit.wall_time {
                trace!(?elapsed, "real time limit exceeded");

                // not reaped yet, so the pid cannot have been reused
                if let Err(err) = send_group_signal(pid, Signal::SIGKILL) {
                    warn!(?pid, %err, "failed to kill process group");
                    if let Err(err) = send_signal(pid, Signal::SIGKILL) {
                        warn!(?pid, %err, "failed to kill child");
                    }
                }

                let reaped = proc::reap(pid).context("failed to wait4 after kill")?;
                let usage = reaped.into_usage(t0.elapsed());
                trace!(?usage, "child killed");
                return Ok(Exit::TimedOut(usage));
            }

            thread::sleep(quantum);
        }
    }
}

/// Maps a naturally terminated child to a verdict. First match wins.
pub fn classify(usage: ResourceUsage, limit: &ResourceLimit) -> Classification {
    let verdict = match (usage.signal, usage.exit_code) {
        (Some(libc::SIGXCPU), _) => Verdict::time_limit("CPU time limit exceeded (SIGXCPU)", usage),
        (Some(libc::SIGKILL), _) => Verdict::time_limit("Killed by SIGKILL", usage),
        (Some(sig), _) => Verdict::runtime_error(signal::describe(sig), usage),
        (None, Some(code)) if code != 0 => {
            Verdict::runtime_error(format!("Non-zero exit code: {}", code), usage)
        }
        _ if usage.peak_memory > limit.memory => {
            Verdict::memory_limit("Memory limit exceeded", usage)
        }
        _ if usage.cpu_time > limit.cpu_time.saturating_add(CPU_TIME_TOLERANCE) => {
            Verdict::time_limit("CPU time limit exceeded", usage)
        }
        _ => return Classification::Completed(usage),
    };
    Classification::Terminal(verdict)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::verdict::VerdictKind;

    fn limit() -> ResourceLimit {
        ResourceLimit::new(Duration::from_secs(1), 64 << 20)
    }

    fn kind_of(usage: ResourceUsage) -> Option<VerdictKind> {
        match classify(usage, &limit()) {
            Classification::Completed(_) => None,
            Classification::Terminal(v) => Some(v.kind),
        }
    }

    fn exited(code: i32) -> ResourceUsage {
        ResourceUsage {
            exit_code: Some(code),
            ..ResourceUsage::default()
        }
    }

    fn signaled(sig: i32) -> ResourceUsage {
        ResourceUsage {
            signal: Some(sig),
            ..ResourceUsage::default()
        }
    }

    #[test]
    fn clean_exit_completes() {
        let usage = ResourceUsage {
            cpu_time: Duration::from_millis(1050),
            peak_memory: 64 << 20,
            ..exited(0)
        };
        assert_eq!(classify(usage, &limit()), Classification::Completed(usage));
    }

    #[test]
    fn cpu_signals_are_tle() {
        assert_eq!(kind_of(signaled(libc::SIGXCPU)), Some(VerdictKind::TimeLimitExceeded));
        assert_eq!(kind_of(signaled(libc::SIGKILL)), Some(VerdictKind::TimeLimitExceeded));
    }

    #[test]
    fn other_signals_are_re() {
        let usage = ResourceUsage {
            peak_memory: 1 << 30,
            ..signaled(libc::SIGSEGV)
        };
        match classify(usage, &limit()) {
            Classification::Terminal(v) => {
                assert_eq!(v.kind, VerdictKind::RuntimeError);
                assert!(v.message.contains("SIGSEGV"));
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn exit_code_before_memory() {
        let usage = ResourceUsage {
            peak_memory: 1 << 30,
            ..exited(1)
        };
        match classify(usage, &limit()) {
            Classification::Terminal(v) => {
                assert_eq!(v.kind, VerdictKind::RuntimeError);
                assert_eq!(v.message, "Non-zero exit code: 1");
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn memory_before_cpu() {
        let usage = ResourceUsage {
            peak_memory: (64 << 20) + 1,
            cpu_time: Duration::from_secs(5),
            ..exited(0)
        };
        assert_eq!(kind_of(usage), Some(VerdictKind::MemoryLimitExceeded));
    }

    #[test]
    fn cpu_over_tolerance() {
        let usage = ResourceUsage {
            cpu_time: Duration::from_millis(1101),
            ..exited(0)
        };
        assert_eq!(kind_of(usage), Some(VerdictKind::TimeLimitExceeded));
    }

    #[test]
    fn quantum_is_clamped() {
        let sv = Supervisor::new();
        assert_eq!(sv.quantum(Duration::from_secs(3)), Duration::from_millis(10));
        assert_eq!(sv.quantum(Duration::from_millis(500)), Duration::from_millis(5));
        assert_eq!(sv.quantum(Duration::from_millis(10)), Duration::from_millis(1));
    }
}
