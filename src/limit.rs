use crate::ResourceLimit;

use std::io;
use std::time::Duration;

use rlimit::Resource;

/// Caps whose failure is tolerated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SoftCap {
    AddressSpace = 1,
    Stack = 2,
    FileSize = 3,
    Core = 4,
}

impl SoftCap {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(SoftCap::AddressSpace),
            2 => Some(SoftCap::Stack),
            3 => Some(SoftCap::FileSize),
            4 => Some(SoftCap::Core),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SoftCap::AddressSpace => "RLIMIT_AS",
            SoftCap::Stack => "RLIMIT_STACK",
            SoftCap::FileSize => "RLIMIT_FSIZE",
            SoftCap::Core => "RLIMIT_CORE",
        }
    }
}

/// Whole seconds for `RLIMIT_CPU`, rounded up and at least one.
pub fn cpu_seconds(cpu_time: Duration) -> u64 {
    let secs = cpu_time.as_secs().saturating_add(u64::from(cpu_time.subsec_nanos() > 0));
    secs.max(1)
}

/// Applies `limit` to the calling process.
///
/// Must only run in the forked child: it neither allocates nor logs.
/// The CPU cap is mandatory and its failure is returned. The other caps are
/// best effort; each failure is handed to `on_soft_failure`.
pub fn apply(
    limit: &ResourceLimit,
    mut on_soft_failure: impl FnMut(SoftCap, io::Error),
) -> io::Result<()> {
    // hard = soft + 1: SIGXCPU first, SIGKILL only if SIGXCPU is caught
    let cpu = cpu_seconds(limit.cpu_time);
    Resource::CPU.set(cpu, cpu.saturating_add(1))?;

    let soft_caps = [
        (SoftCap::AddressSpace, Resource::AS, limit.memory),
        (SoftCap::Stack, Resource::STACK, limit.stack),
        (SoftCap::FileSize, Resource::FSIZE, limit.output),
        (SoftCap::Core, Resource::CORE, 0),
    ];

    for (cap, resource, value) in soft_caps {
        if let Err(err) = resource.set(value, value) {
            on_soft_failure(cap, err);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_seconds_round_up() {
        assert_eq!(cpu_seconds(Duration::from_millis(1)), 1);
        assert_eq!(cpu_seconds(Duration::from_secs(1)), 1);
        assert_eq!(cpu_seconds(Duration::from_millis(1500)), 2);
        assert_eq!(cpu_seconds(Duration::from_secs(3)), 3);
        assert_eq!(cpu_seconds(Duration::MAX), u64::MAX);
    }

    #[test]
    fn soft_cap_ids() {
        for cap in &[
            SoftCap::AddressSpace,
            SoftCap::Stack,
            SoftCap::FileSize,
            SoftCap::Core,
        ] {
            assert_eq!(SoftCap::from_u8(*cap as u8), Some(*cap));
        }
        assert_eq!(SoftCap::from_u8(0), None);
    }
}
