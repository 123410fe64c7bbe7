use crate::lang::Language;
use crate::utils::libc_call;

use std::io;

/// Extra lockdown applied in the child after the resource limits and
/// before stdio is redirected.
///
/// Runs between `fork` and `exec`, so implementations must stick to
/// async-signal-safe calls: no allocation, no locks, no logging. A syscall
/// filter fits here and has to allow the `open`, `dup2`, `chdir` and `execve`
/// calls that follow it.
pub trait Hardening: Send + Sync {
    fn apply(&self, language: &Language) -> io::Result<()>;
}

/// Applies nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHardening;

impl Hardening for NoHardening {
    fn apply(&self, _: &Language) -> io::Result<()> {
        Ok(())
    }
}

/// Sets `PR_SET_NO_NEW_PRIVS` so the program cannot gain privileges
/// through setuid binaries.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoNewPrivs;

impl Hardening for NoNewPrivs {
    fn apply(&self, _: &Language) -> io::Result<()> {
        libc_call(|| unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) })?;
        Ok(())
    }
}
