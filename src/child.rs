use crate::hardening::Hardening;
use crate::lang::Language;
use crate::limit;
use crate::pipe::{PipeTx, Record};
use crate::utils::{errno_of, RawFd};
use crate::{ResourceLimit, SandboxConfig};

use std::convert::Infallible;
use std::ffi::{CStr, CString, OsStr};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::{env, fmt, io, ptr};

use anyhow::{Context, Result};
use nix::fcntl::{self, FcntlArg, FdFlag, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::{self, AccessFlags, Pid};
use path_absolutize::Absolutize;

/// Step of the child setup that failed.
///
/// The discriminant is the exit code the child dies with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SetupStage {
    Internal = 119,
    Limits = 120,
    Hardening = 121,
    Stdin = 122,
    Stdout = 123,
    Stderr = 124,
    WorkDir = 125,
    Language = 126,
    Exec = 127,
}

impl SetupStage {
    pub fn exit_code(self) -> i32 {
        self as i32
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        let stage = match v {
            119 => SetupStage::Internal,
            120 => SetupStage::Limits,
            121 => SetupStage::Hardening,
            122 => SetupStage::Stdin,
            123 => SetupStage::Stdout,
            124 => SetupStage::Stderr,
            125 => SetupStage::WorkDir,
            126 => SetupStage::Language,
            127 => SetupStage::Exec,
            _ => return None,
        };
        Some(stage)
    }

    pub fn name(self) -> &'static str {
        match self {
            SetupStage::Internal => "internal error",
            SetupStage::Limits => "failed to set resource limits",
            SetupStage::Hardening => "failed to apply hardening",
            SetupStage::Stdin => "failed to redirect stdin",
            SetupStage::Stdout => "failed to redirect stdout",
            SetupStage::Stderr => "failed to redirect stderr",
            SetupStage::WorkDir => "failed to change working directory",
            SetupStage::Language => "language runtime is not executable",
            SetupStage::Exec => "failed to execve",
        }
    }
}

impl fmt::Display for SetupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy)]
struct ChildError {
    stage: SetupStage,
    errno: i32,
}

trait StageExt<T> {
    fn stage(self, stage: SetupStage) -> Result<T, ChildError>;
}

impl<T> StageExt<T> for nix::Result<T> {
    fn stage(self, stage: SetupStage) -> Result<T, ChildError> {
        self.map_err(|errno| ChildError {
            stage,
            errno: errno as i32,
        })
    }
}

impl<T> StageExt<T> for io::Result<T> {
    fn stage(self, stage: SetupStage) -> Result<T, ChildError> {
        self.map_err(|err| ChildError {
            stage,
            errno: errno_of(&err),
        })
    }
}

struct ExecveArgs {
    _cstrings: Vec<CString>,
    bin: *const libc::c_char,
    args: Vec<*const libc::c_char>,
    env: Vec<*const libc::c_char>,
}

fn cstring(s: &OsStr) -> Result<CString> {
    CString::new(s.as_bytes()).with_context(|| format!("interior nul byte in {:?}", s))
}

fn absolute_cstring(path: &Path) -> Result<CString> {
    let path = path
        .absolutize()
        .with_context(|| format!("failed to absolutize path: {}", path.display()))?;
    cstring(path.as_os_str())
}

fn prepare_execve_args(program: &CStr, config: &SandboxConfig) -> Result<ExecveArgs> {
    let mut cstrings = Vec::new();
    let mut args = Vec::new();
    let mut env = Vec::new();

    if let Language::Interpreted { ref interpreter } = config.language {
        let c = cstring(interpreter.as_os_str())?;
        args.push(c.as_ptr());
        cstrings.push(c);
    }
    {
        let c = program.to_owned();
        args.push(c.as_ptr());
        cstrings.push(c);
    }
    for a in &config.args {
        let c = cstring(a)?;
        args.push(c.as_ptr());
        cstrings.push(c);
    }
    args.push(ptr::null());

    for e in &config.env {
        let c = if e.as_bytes().contains(&b'=') {
            cstring(e)?
        } else if let Some(value) = env::var_os(e) {
            let mut v = Vec::new();
            v.extend_from_slice(e.as_bytes());
            v.push(b'=');
            v.extend(value.into_vec());
            CString::new(v).with_context(|| format!("interior nul byte in ${:?}", e))?
        } else {
            continue;
        };
        env.push(c.as_ptr());
        cstrings.push(c);
    }
    env.push(ptr::null());

    let bin = args[0];

    Ok(ExecveArgs {
        _cstrings: cstrings,
        bin,
        args,
        env,
    })
}

/// Everything the child needs, built in the parent before `fork`.
///
/// Paths are absolute because the child may change its working directory
/// before opening or executing them.
pub struct ChildSetup {
    limit: ResourceLimit,
    language: Language,
    exec: ExecveArgs,
    interpreter: Option<CString>,
    stdin: Option<CString>,
    stdout: CString,
    stderr: CString,
    work_dir: Option<CString>,
}

impl ChildSetup {
    pub fn prepare(config: &SandboxConfig) -> Result<Self> {
        let program = absolute_cstring(&config.program)?;
        let exec = prepare_execve_args(&program, config)?;

        let interpreter = match config.language {
            Language::Interpreted { ref interpreter } => Some(cstring(interpreter.as_os_str())?),
            Language::Native(_) => None,
        };

        let stdin = config.stdin.as_deref().map(absolute_cstring).transpose()?;
        let work_dir = config.work_dir.as_deref().map(absolute_cstring).transpose()?;

        Ok(Self {
            limit: config.limit,
            language: config.language.clone(),
            exec,
            interpreter,
            stdin,
            stdout: absolute_cstring(&config.stdout)?,
            stderr: absolute_cstring(&config.stderr)?,
            work_dir,
        })
    }

    fn setup_and_exec(
        &self,
        hardening: &dyn Hardening,
        report: &PipeTx,
    ) -> Result<Infallible, ChildError> {
        // lead a new process group so the supervisor can kill every descendant
        unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0)).stage(SetupStage::Internal)?;

        limit::apply(&self.limit, |cap, err| {
            report.send(Record::Warning(cap, errno_of(&err)))
        })
        .stage(SetupStage::Limits)?;

        hardening
            .apply(&self.language)
            .stage(SetupStage::Hardening)?;

        let read = OFlag::O_RDONLY;
        let write = OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC;

        if let Some(ref stdin) = self.stdin {
            redirect(stdin, read, libc::STDIN_FILENO).stage(SetupStage::Stdin)?;
        }
        redirect(&self.stdout, write, libc::STDOUT_FILENO).stage(SetupStage::Stdout)?;
        redirect(&self.stderr, write, libc::STDERR_FILENO).stage(SetupStage::Stderr)?;

        if let Some(ref dir) = self.work_dir {
            unistd::chdir(dir.as_c_str()).stage(SetupStage::WorkDir)?;
        }

        if let Some(ref interpreter) = self.interpreter {
            unistd::access(interpreter.as_c_str(), AccessFlags::X_OK)
                .stage(SetupStage::Language)?;
        }

        let exec = &self.exec;
        unsafe { libc::execve(exec.bin, exec.args.as_ptr(), exec.env.as_ptr()) };

        Err::<Infallible, _>(io::Error::last_os_error()).stage(SetupStage::Exec)
    }
}

fn redirect(path: &CStr, flags: OFlag, stdio: RawFd) -> nix::Result<()> {
    let fd = fcntl::open(path, flags | OFlag::O_CLOEXEC, Mode::from_bits_truncate(0o600))?;
    if fd == stdio {
        // the slot was free, so `open` landed on it; keep it across exec
        fcntl::fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty()))?;
        return Ok(());
    }
    let ret = unistd::dup2(fd, stdio);
    let _ = unistd::close(fd);
    ret?;
    Ok(())
}

/// Body of the forked child. Never returns.
///
/// On success the process image is replaced. Otherwise the failing stage is
/// written to `report` and the child exits with the stage's reserved code.
pub fn run_child(setup: &ChildSetup, hardening: &dyn Hardening, report: &PipeTx) -> ! {
    let ret = panic::catch_unwind(AssertUnwindSafe(|| setup.setup_and_exec(hardening, report)));
    let err = match ret {
        Ok(Ok(never)) => match never {},
        Ok(Err(err)) => err,
        Err(_) => ChildError {
            stage: SetupStage::Internal,
            errno: 0,
        },
    };
    report.send(Record::Fatal(err.stage, err.errno));
    unsafe { libc::_exit(err.stage.exit_code()) }
}
