use crate::compare::{compare, CompareMode};
use crate::compile::{Compiler, DEFAULT_COMPILE_TIMEOUT};
use crate::hardening::{Hardening, NoHardening};
use crate::lang::{Language, Toolchain};
use crate::run::{Supervisor, DEFAULT_POLL_INTERVAL};
use crate::verdict::{Classification, Verdict, VerdictKind};
use crate::workspace::Workspace;
use crate::{ResourceLimit, ResourceUsage, SandboxConfig};

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use path_absolutize::Absolutize;
use serde::Serialize;
use tracing::{debug, warn};

const EXECUTABLE: &str = "executable";
const STDOUT: &str = "stdout.txt";
const STDERR: &str = "stderr.txt";
const CHECKER_STDOUT: &str = "checker_stdout.txt";
const CHECKER_STDERR: &str = "checker_stderr.txt";
const DEV_NULL: &str = "/dev/null";

/// Bytes of program output echoed back in a report.
pub const OUTPUT_PREVIEW_LEN: usize = 1000;
const TRUNCATION_MARKER: &str = "... [truncated]";

#[derive(Debug, Clone)]
pub struct JudgeConfig {
    /// Parent of the per-request workspaces, system temp dir if `None`.
    pub workspace_root: Option<PathBuf>,
    pub compile_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            workspace_root: None,
            compile_timeout: DEFAULT_COMPILE_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Submission {
    Source(PathBuf),
    /// Already built, the compiler is skipped.
    Executable(PathBuf),
}

#[derive(Debug, Clone)]
pub struct JudgeRequest {
    pub submission: Submission,
    pub language: Language,
    /// Program stdin, `/dev/null` if `None`.
    pub input: Option<PathBuf>,
    pub expected: PathBuf,
    pub limit: ResourceLimit,
    pub mode: CompareMode,
    /// Run as `checker <input> <actual> <expected>` instead of comparing.
    pub checker: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct JudgeOutcome {
    pub verdict: Verdict,
    pub compiler_message: String,
    pub actual_output: Vec<u8>,
}

impl JudgeOutcome {
    fn new(verdict: Verdict) -> Self {
        Self {
            verdict,
            compiler_message: String::new(),
            actual_output: Vec::new(),
        }
    }

    pub fn report(&self) -> JudgeReport {
        let usage = &self.verdict.usage;
        let error_message = match self.verdict.kind {
            VerdictKind::CompileError => String::new(),
            _ => self.verdict.message.clone(),
        };
        JudgeReport {
            status: self.verdict.kind,
            time_ms: usage.cpu_time.as_millis() as u64,
            wall_time_ms: usage.wall_time.as_millis() as u64,
            memory_kb: usage.peak_memory / 1024,
            compiler_message: self.compiler_message.clone(),
            error_message,
            actual_output: preview(&self.actual_output),
        }
    }
}

fn preview(output: &[u8]) -> String {
    if output.len() <= OUTPUT_PREVIEW_LEN {
        return String::from_utf8_lossy(output).into_owned();
    }
    let mut s = String::from_utf8_lossy(&output[..OUTPUT_PREVIEW_LEN]).into_owned();
    s.push_str(TRUNCATION_MARKER);
    s
}

/// Serialized result of a judge request.
#[derive(Debug, Clone, Serialize)]
pub struct JudgeReport {
    pub status: VerdictKind,
    pub time_ms: u64,
    pub wall_time_ms: u64,
    pub memory_kb: u64,
    pub compiler_message: String,
    pub error_message: String,
    pub actual_output: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CompileStatus {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "CE")]
    CompileError,
    #[serde(rename = "SE")]
    SystemError,
}

/// Serialized result of a compile-only request.
#[derive(Debug, Clone, Serialize)]
pub struct CompileReport {
    pub status: CompileStatus,
    pub compiler_message: String,
    pub error_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executable_path: Option<PathBuf>,
}

/// Compile, run and compare, one request at a time.
pub struct Judge {
    config: JudgeConfig,
    compiler: Compiler,
    supervisor: Supervisor,
    hardening: Box<dyn Hardening>,
}

impl Judge {
    pub fn new(config: JudgeConfig) -> Result<Self> {
        let compiler = Compiler::new(config.compile_timeout)?;
        let supervisor = Supervisor::with_poll_interval(config.poll_interval);
        Ok(Self {
            config,
            compiler,
            supervisor,
            hardening: Box::new(NoHardening),
        })
    }

    pub fn with_hardening(mut self, hardening: impl Hardening + 'static) -> Self {
        self.hardening = Box::new(hardening);
        self
    }

    fn workspace(&self) -> Result<Workspace> {
        match self.config.workspace_root {
            Some(ref root) => Workspace::create_in(root),
            None => Workspace::create(),
        }
    }

    /// Judges one submission. Internal failures become a `SystemError`
    /// verdict, so this always yields an outcome.
    pub fn judge(&self, request: &JudgeRequest) -> JudgeOutcome {
        match self.try_judge(request) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(?err, "judge failed");
                JudgeOutcome::new(Verdict::system_error(format!("{:#}", err)))
            }
        }
    }

    fn try_judge(&self, request: &JudgeRequest) -> Result<JudgeOutcome> {
        let workspace = self.workspace()?;

        let mut compiler_message = String::new();
        let executable = match request.submission {
            Submission::Executable(ref exe) => exe.clone(),
            Submission::Source(ref src) => {
                let output = workspace.file(EXECUTABLE);
                let ret = self.compiler.compile(src, &request.language, &output)?;
                if !ret.success {
                    debug!("compile error");
                    let mut outcome = JudgeOutcome::new(Verdict::compile_error(&ret.message));
                    outcome.compiler_message = ret.message;
                    return Ok(outcome);
                }
                compiler_message = ret.message;
                ret.executable
            }
        };

        let stdout = workspace.file(STDOUT);
        let config = sandbox_config(
            &workspace,
            executable,
            request.language.clone(),
            request.input.as_deref(),
            stdout.clone(),
            workspace.file(STDERR),
            request.limit,
        );

        let classification = self.supervisor.run(&config, &*self.hardening)?;

        let outcome = match classification {
            Classification::Terminal(verdict) => JudgeOutcome {
                verdict,
                compiler_message,
                // may be missing when the child failed before redirecting
                actual_output: fs::read(&stdout).unwrap_or_default(),
            },
            Classification::Completed(usage) => {
                let actual_output = fs::read(&stdout)
                    .with_context(|| format!("failed to read output: {}", stdout.display()))?;
                let verdict = match request.checker {
                    Some(ref checker) => self.run_checker(&workspace, checker, request, &stdout, usage)?,
                    None => {
                        let expected = fs::read(&request.expected).with_context(|| {
                            format!("failed to read expected output: {}", request.expected.display())
                        })?;
                        let ret = compare(&actual_output, &expected, request.mode);
                        match ret.diagnostic {
                            None => Verdict::accepted(usage),
                            Some(diag) => Verdict::wrong_answer(diag, usage),
                        }
                    }
                };
                JudgeOutcome {
                    verdict,
                    compiler_message,
                    actual_output,
                }
            }
        };

        let _ = workspace.close();
        Ok(outcome)
    }

    fn run_checker(
        &self,
        workspace: &Workspace,
        checker: &Path,
        request: &JudgeRequest,
        actual: &Path,
        usage: ResourceUsage,
    ) -> Result<Verdict> {
        let input = request.input.as_deref().unwrap_or_else(|| Path::new(DEV_NULL));
        let stdout = workspace.file(CHECKER_STDOUT);
        let stderr = workspace.file(CHECKER_STDERR);

        // the checker runs inside the workspace, relative paths would not resolve
        let args = [input, actual, request.expected.as_path()]
            .iter()
            .map(|path| {
                path.absolutize()
                    .map(|abs| abs.as_os_str().to_owned())
                    .with_context(|| format!("failed to absolutize {}", path.display()))
            })
            .collect::<Result<Vec<_>>>()?;

        // any native toolchain execs the program as is, the checker is never compiled
        let mut config = sandbox_config(
            workspace,
            checker.to_owned(),
            Language::Native(Toolchain::C),
            None,
            stdout.clone(),
            stderr.clone(),
            checker_limit(),
        );
        config.args = args;

        let classification = self
            .supervisor
            .run(&config, &NoHardening)
            .context("failed to run checker")?;

        let verdict = match classification {
            Classification::Completed(_) => Verdict::accepted(usage),
            Classification::Terminal(ref v) => match (v.kind, v.usage.exit_code) {
                (VerdictKind::RuntimeError, Some(code)) if code != 0 => {
                    let message = [&stderr, &stdout]
                        .iter()
                        .map(|path| read_trimmed(path))
                        .find(|text| !text.is_empty())
                        .unwrap_or_else(|| {
                            format!("Checker rejected the output (exit code {})", code)
                        });
                    Verdict::wrong_answer(message, usage)
                }
                _ => Verdict::system_error(format!("Checker failed: {}", v.message)),
            },
        };

        debug!(kind = %verdict.kind, "checker finished");
        Ok(verdict)
    }

    /// Builds `source` and copies the artifact to `dest`.
    ///
    /// Interpreted sources are their own artifact and are not copied.
    pub fn compile_only(&self, source: &Path, language: &Language, dest: &Path) -> CompileReport {
        match self.try_compile_only(source, language, dest) {
            Ok(report) => report,
            Err(err) => {
                warn!(?err, "compile failed");
                CompileReport {
                    status: CompileStatus::SystemError,
                    compiler_message: String::new(),
                    error_message: format!("{:#}", err),
                    executable_path: None,
                }
            }
        }
    }

    fn try_compile_only(&self, source: &Path, language: &Language, dest: &Path) -> Result<CompileReport> {
        let workspace = self.workspace()?;
        let ret = self
            .compiler
            .compile(source, language, &workspace.file(EXECUTABLE))?;

        if !ret.success {
            return Ok(CompileReport {
                status: CompileStatus::CompileError,
                compiler_message: ret.message,
                error_message: String::new(),
                executable_path: None,
            });
        }

        let executable_path = if language.needs_compile() {
            fs::copy(&ret.executable, dest).with_context(|| {
                format!("failed to copy executable to {}", dest.display())
            })?;
            dest.to_owned()
        } else {
            ret.executable
        };

        let _ = workspace.close();
        Ok(CompileReport {
            status: CompileStatus::Ok,
            compiler_message: ret.message,
            error_message: String::new(),
            executable_path: Some(executable_path),
        })
    }
}

fn read_trimmed(path: &Path) -> String {
    let data = fs::read(path).unwrap_or_default();
    String::from_utf8_lossy(&data).trim().to_owned()
}

fn checker_limit() -> ResourceLimit {
    ResourceLimit::new(Duration::from_secs(10), 1 << 30)
}

fn sandbox_config(
    workspace: &Workspace,
    program: PathBuf,
    language: Language,
    input: Option<&Path>,
    stdout: PathBuf,
    stderr: PathBuf,
    limit: ResourceLimit,
) -> SandboxConfig {
    let mut config = SandboxConfig::new(program, language, stdout, stderr, limit);
    config.stdin = Some(input.unwrap_or_else(|| Path::new(DEV_NULL)).to_owned());
    config.env = vec![OsString::from("PATH")];
    config.work_dir = Some(workspace.path().to_owned());
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_truncates() {
        let short = vec![b'a'; OUTPUT_PREVIEW_LEN];
        assert_eq!(preview(&short).len(), OUTPUT_PREVIEW_LEN);

        let long = vec![b'a'; OUTPUT_PREVIEW_LEN + 1];
        let text = preview(&long);
        assert!(text.ends_with(TRUNCATION_MARKER));
        assert_eq!(text.len(), OUTPUT_PREVIEW_LEN + TRUNCATION_MARKER.len());
    }

    #[test]
    fn report_fields() {
        let usage = ResourceUsage {
            cpu_time: Duration::from_millis(1234),
            wall_time: Duration::from_millis(2000),
            peak_memory: 4096 * 1024,
            exit_code: Some(0),
            signal: None,
        };
        let outcome = JudgeOutcome {
            verdict: Verdict::wrong_answer("diff", usage),
            compiler_message: "warning".into(),
            actual_output: b"42\n".to_vec(),
        };
        let json = serde_json::to_value(outcome.report()).unwrap();
        assert_eq!(json["status"], "WA");
        assert_eq!(json["time_ms"], 1234);
        assert_eq!(json["wall_time_ms"], 2000);
        assert_eq!(json["memory_kb"], 4096);
        assert_eq!(json["error_message"], "diff");
        assert_eq!(json["compiler_message"], "warning");
        assert_eq!(json["actual_output"], "42\n");
    }

    #[test]
    fn judge_is_send() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Judge>();
    }

    #[test]
    fn compile_error_message_goes_to_compiler_field() {
        let mut outcome = JudgeOutcome::new(Verdict::compile_error("bad"));
        outcome.compiler_message = "bad".into();
        let report = outcome.report();
        assert_eq!(report.status, VerdictKind::CompileError);
        assert_eq!(report.compiler_message, "bad");
        assert!(report.error_message.is_empty());
    }
}
