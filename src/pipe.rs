use crate::child::SetupStage;
use crate::limit::SoftCap;
use crate::utils::{libc_call, RawFd};

use std::io::Read;
use std::os::unix::prelude::FromRawFd;
use std::{fs, io, mem};

pub struct PipeTx(RawFd);
pub struct PipeRx(RawFd);

impl Drop for PipeTx {
    fn drop(&mut self) {
        let _ = unsafe { libc::close(self.0) };
    }
}

impl Drop for PipeRx {
    fn drop(&mut self) {
        let _ = unsafe { libc::close(self.0) };
    }
}

pub fn create() -> io::Result<(PipeTx, PipeRx)> {
    let mut fds = [0, 0];
    libc_call(|| unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) })?;
    let rx = PipeRx(fds[0]);
    let tx = PipeTx(fds[1]);
    Ok((tx, rx))
}

const RECORD_LEN: usize = 6;
const TAG_WARNING: u8 = 1;
const TAG_FATAL: u8 = 2;

/// One message from the child: `[tag, id, errno as i32 le]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Record {
    Warning(SoftCap, i32),
    Fatal(SetupStage, i32),
}

impl Record {
    fn encode(self) -> [u8; RECORD_LEN] {
        let (tag, id, errno) = match self {
            Record::Warning(cap, errno) => (TAG_WARNING, cap as u8, errno),
            Record::Fatal(stage, errno) => (TAG_FATAL, stage as u8, errno),
        };
        let e = errno.to_le_bytes();
        [tag, id, e[0], e[1], e[2], e[3]]
    }

    fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() != RECORD_LEN {
            return None;
        }
        let errno = i32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]);
        match buf[0] {
            TAG_WARNING => SoftCap::from_u8(buf[1]).map(|cap| Record::Warning(cap, errno)),
            TAG_FATAL => SetupStage::from_u8(buf[1]).map(|stage| Record::Fatal(stage, errno)),
            _ => None,
        }
    }
}

impl PipeTx {
    /// Writes one record. Safe to call between `fork` and `exec`.
    pub fn send(&self, record: Record) {
        let buf = record.encode();
        // records are far below PIPE_BUF, so the write is atomic
        let _ = unsafe { libc::write(self.0, buf.as_ptr().cast(), buf.len()) };
    }
}

/// Everything the child reported before it exec'd or exited.
#[derive(Debug, Default)]
pub struct ChildReport {
    pub warnings: Vec<(SoftCap, io::Error)>,
    pub fatal: Option<(SetupStage, io::Error)>,
}

impl PipeRx {
    /// Drains the pipe. Every write end must be closed by now, which holds
    /// once the child has been reaped.
    pub fn read_report(self) -> io::Result<ChildReport> {
        let mut buf = Vec::new();
        unsafe {
            let mut file = fs::File::from_raw_fd(self.0);
            let ret = file.read_to_end(&mut buf);
            mem::forget(file);
            ret?;
        }

        let mut report = ChildReport::default();
        for chunk in buf.chunks(RECORD_LEN) {
            match Record::decode(chunk) {
                Some(Record::Warning(cap, errno)) => {
                    report.warnings.push((cap, io::Error::from_raw_os_error(errno)))
                }
                Some(Record::Fatal(stage, errno)) => {
                    report.fatal = Some((stage, io::Error::from_raw_os_error(errno)))
                }
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("malformed child report: {:?}", chunk),
                    ))
                }
            }
        }
        Ok(report)
    }
}
