use crate::signal::{send_group_signal, send_signal};
use crate::utils::{libc_call, retry_eintr, timeval_to_duration};
use crate::ResourceUsage;

use std::time::Duration;
use std::{io, mem};

use nix::sys::signal::Signal;
use nix::unistd::Pid;

/// Raw result of one successful `wait4`.
pub struct Reaped {
    pub status: libc::c_int,
    pub rusage: libc::rusage,
}

impl Reaped {
    pub fn into_usage(self, wall_time: Duration) -> ResourceUsage {
        let status = self.status;
        let ru = &self.rusage;

        let exit_code = libc::WIFEXITED(status).then(|| libc::WEXITSTATUS(status));
        let signal = libc::WIFSIGNALED(status).then(|| libc::WTERMSIG(status));

        ResourceUsage {
            cpu_time: timeval_to_duration(ru.ru_utime) + timeval_to_duration(ru.ru_stime),
            wall_time,
            peak_memory: (ru.ru_maxrss.max(0) as u64) * 1024, // KiB => bytes
            exit_code,
            signal,
        }
    }
}

fn wait4(pid: Pid, options: libc::c_int) -> io::Result<Option<Reaped>> {
    let mut status: libc::c_int = 0;
    let mut rusage: libc::rusage = unsafe { mem::zeroed() };

    let ret = libc_call(|| unsafe { libc::wait4(pid.as_raw(), &mut status, options, &mut rusage) })?;
    if ret == 0 {
        return Ok(None);
    }
    Ok(Some(Reaped { status, rusage }))
}

/// Reaps `pid` if it has terminated, without blocking.
pub fn try_reap(pid: Pid) -> io::Result<Option<Reaped>> {
    retry_eintr(|| wait4(pid, libc::WNOHANG))
}

/// Blocks until `pid` terminates.
pub fn reap(pid: Pid) -> io::Result<Reaped> {
    loop {
        if let Some(reaped) = retry_eintr(|| wait4(pid, 0))? {
            return Ok(reaped);
        }
    }
}

/// Last resort cleanup so no child outlives its supervisor.
///
/// `pid` leads its own process group, which is killed along with it.
pub fn kill_and_reap_quietly(pid: Pid) {
    let _ = send_group_signal(pid, Signal::SIGKILL);
    let _ = send_signal(pid, Signal::SIGKILL);
    let _ = reap(pid);
}

#[cfg(test)]
mod tests {
    use super::*;

    use nix::unistd::{fork, ForkResult};

    #[test]
    fn reap_exit_code() {
        let pid = match unsafe { fork() }.unwrap() {
            ForkResult::Child => unsafe { libc::_exit(3) },
            ForkResult::Parent { child } => child,
        };
        let usage = reap(pid).unwrap().into_usage(Duration::ZERO);
        assert_eq!(usage.exit_code, Some(3));
        assert_eq!(usage.signal, None);
    }

    #[test]
    fn reap_killed() {
        let pid = match unsafe { fork() }.unwrap() {
            ForkResult::Child => loop {
                unsafe { libc::pause() };
            },
            ForkResult::Parent { child } => child,
        };
        assert!(try_reap(pid).unwrap().is_none());
        send_signal(pid, Signal::SIGKILL).unwrap();
        let usage = reap(pid).unwrap().into_usage(Duration::ZERO);
        assert_eq!(usage.exit_code, None);
        assert_eq!(usage.signal, Some(libc::SIGKILL));
    }
}
