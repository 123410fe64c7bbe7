use crate::lang::{Language, Toolchain};

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::Command;
use tokio::runtime::{self, Runtime};
use tokio::time;
use tracing::{debug, trace};

pub const DEFAULT_COMPILE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOutput {
    pub success: bool,
    /// Raw compiler diagnostics on failure.
    pub message: String,
    /// Ready to execute when `success` holds.
    pub executable: PathBuf,
}

impl CompileOutput {
    fn failed(message: impl Into<String>, executable: &Path) -> Self {
        Self {
            success: false,
            message: message.into(),
            executable: executable.to_owned(),
        }
    }
}

/// Runs the fixed per-language compiler command with a timeout.
pub struct Compiler {
    runtime: Runtime,
    timeout: Duration,
}

impl Compiler {
    pub fn new(timeout: Duration) -> Result<Self> {
        let runtime = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to build compiler runtime")?;
        Ok(Self { runtime, timeout })
    }

    /// Builds `source` into `output`.
    ///
    /// Interpreted languages need no build and succeed with `source` as the
    /// executable. `Err` means the compiler could not be run at all.
    pub fn compile(&self, source: &Path, language: &Language, output: &Path) -> Result<CompileOutput> {
        match *language {
            Language::Interpreted { .. } => Ok(CompileOutput {
                success: true,
                message: String::new(),
                executable: source.to_owned(),
            }),
            Language::Native(toolchain) => self.runtime.block_on(self.build(toolchain, source, output)),
        }
    }

    async fn build(&self, toolchain: Toolchain, source: &Path, output: &Path) -> Result<CompileOutput> {
        let (bin, args) = toolchain.command(source, output);
        debug!(bin, ?args, "compiling");

        let child = Command::new(bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn compiler: {}", bin))?;

        // dropping the future on timeout drops the child, which kills it
        let ret = match time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(ret) => ret.context("failed to wait for compiler")?,
            Err(_) => {
                debug!(timeout = ?self.timeout, "compiler timed out");
                let msg = format!("Compilation timed out after {:?}", self.timeout);
                return Ok(CompileOutput::failed(msg, output));
            }
        };

        let mut message = String::from_utf8_lossy(&ret.stderr).into_owned();
        message.push_str(&String::from_utf8_lossy(&ret.stdout));

        trace!(status = ?ret.status, message_len = message.len());

        if !ret.status.success() {
            return Ok(CompileOutput::failed(message, output));
        }

        if !output.exists() {
            append_line(&mut message, "compiler exited successfully but produced no executable");
            return Ok(CompileOutput::failed(message, output));
        }

        Ok(CompileOutput {
            success: true,
            message,
            executable: output.to_owned(),
        })
    }
}

fn append_line(message: &mut String, line: &str) {
    if !message.is_empty() && !message.ends_with('\n') {
        message.push('\n');
    }
    message.push_str(line);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interpreted_needs_no_build() {
        let compiler = Compiler::new(DEFAULT_COMPILE_TIMEOUT).unwrap();
        let ret = compiler
            .compile(Path::new("/tmp/a.py"), &Language::python3(), Path::new("/tmp/a"))
            .unwrap();
        assert!(ret.success);
        assert_eq!(ret.executable, Path::new("/tmp/a.py"));
        assert!(ret.message.is_empty());
    }

    #[test]
    fn notes_start_on_their_own_line() {
        let mut message = String::from("warning: unused variable");
        append_line(&mut message, "no executable");
        assert_eq!(message, "warning: unused variable\nno executable");

        let mut message = String::new();
        append_line(&mut message, "no executable");
        assert_eq!(message, "no executable");

        let mut message = String::from("warning\n");
        append_line(&mut message, "no executable");
        assert_eq!(message, "warning\nno executable");
    }
}
