use std::borrow::Cow;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::trace;

pub fn send_signal(pid: Pid, signal: Signal) -> nix::Result<()> {
    let result = signal::kill(pid, signal);
    trace!(
        "kill pid = {}, signal = {}, result = {:?}",
        pid,
        signal,
        result
    );
    result
}

/// Signals every process in the group led by `pgid`.
pub fn send_group_signal(pgid: Pid, signal: Signal) -> nix::Result<()> {
    let result = signal::killpg(pgid, signal);
    trace!(
        "killpg pgid = {}, signal = {}, result = {:?}",
        pgid,
        signal,
        result
    );
    result
}

/// Symbolic name of a raw signal number, e.g. `SIGSEGV`.
pub fn signal_name(signo: i32) -> Cow<'static, str> {
    match Signal::try_from(signo) {
        Ok(sig) => Cow::Borrowed(sig.as_str()),
        Err(_) => Cow::Owned(format!("SIG{}", signo)),
    }
}

/// Human readable reason for a process killed by `signo`.
pub fn describe(signo: i32) -> String {
    let reason = match signo {
        libc::SIGSEGV => "Segmentation fault",
        libc::SIGFPE => "Floating point exception",
        libc::SIGABRT => "Aborted",
        libc::SIGBUS => "Bus error",
        libc::SIGILL => "Illegal instruction",
        libc::SIGXFSZ => "Output limit exceeded",
        libc::SIGXCPU => "CPU time limit exceeded",
        libc::SIGKILL => "Killed",
        _ => return format!("Terminated by signal {} ({})", signo, signal_name(signo)),
    };
    format!("{} ({})", reason, signal_name(signo))
}
