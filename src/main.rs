use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use judger::{
    CompareMode, Judge, JudgeConfig, JudgeOutcome, JudgeRequest, Language, ResourceLimit,
    Submission, Verdict,
};
use serde::Serialize;

#[derive(Debug, Parser)]
#[command(name = "judger", version, about)]
struct Args {
    /// Source file to compile
    #[arg(long, value_name = "path", required_unless_present = "exe")]
    src: Option<PathBuf>,

    /// Prebuilt executable, or the artifact destination with --compile-only
    #[arg(long, value_name = "path")]
    exe: Option<PathBuf>,

    #[arg(long, value_name = "tag")]
    lang: Language,

    /// Program stdin, /dev/null by default
    #[arg(long, value_name = "path")]
    input: Option<PathBuf>,

    /// Expected output
    #[arg(long, value_name = "path", required_unless_present = "compile_only")]
    output: Option<PathBuf>,

    #[arg(long, value_name = "seconds", default_value = "1", value_parser = parse_seconds)]
    time: Duration,

    /// Memory limit in KiB, held as bytes
    #[arg(long, value_name = "KB", default_value = "262144", value_parser = parse_kib)]
    mem: u64,

    #[arg(long, value_name = "KB", value_parser = parse_kib)]
    output_limit: Option<u64>,

    #[arg(long, value_name = "KB", value_parser = parse_kib)]
    stack_limit: Option<u64>,

    #[arg(long, value_enum, default_value_t = CompareMode::IgnoreTrailing)]
    mode: CompareMode,

    /// Special judge run as `checker <input> <actual> <expected>`
    #[arg(long, value_name = "path")]
    checker: Option<PathBuf>,

    #[arg(long, requires_all = ["src", "exe"])]
    compile_only: bool,

    /// Parent directory of the per-request workspaces
    #[arg(long, value_name = "path", env = "JUDGER_WORKSPACE")]
    workspace: Option<PathBuf>,

    #[arg(long, short = 'p')]
    pretty: bool,
}

fn parse_seconds(s: &str) -> Result<Duration, String> {
    let secs: f64 = s.parse().map_err(|err| format!("{}", err))?;
    if secs.is_nan() || secs <= 0.0 {
        return Err(format!("time limit must be positive: {}", s));
    }
    Duration::try_from_secs_f64(secs).map_err(|err| format!("{}", err))
}

fn parse_kib(s: &str) -> Result<u64, String> {
    let kib: u64 = s.parse().map_err(|err| format!("{}", err))?;
    kib.checked_mul(1024)
        .ok_or_else(|| format!("limit is too large: {} KiB", s))
}

fn setup_tracing() {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .pretty()
        .with_writer(io::stderr)
        .with_env_filter(EnvFilter::from_default_env())
        .finish()
        .with(ErrorLayer::default())
        .init();
}

fn print_json<T: Serialize>(value: &T, pretty: bool) -> Result<()> {
    let stdout = io::stdout();
    let mut stdout_lock = stdout.lock();
    let out = &mut stdout_lock;
    if pretty {
        serde_json::to_writer_pretty(&mut *out, value)?;
    } else {
        serde_json::to_writer(&mut *out, value)?;
    }
    writeln!(out)?;
    Ok(())
}

fn missing(arg: &str) -> ! {
    Args::command()
        .error(
            clap::error::ErrorKind::MissingRequiredArgument,
            format!("--{} is required", arg),
        )
        .exit()
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    setup_tracing();

    let args = Args::parse();

    let config = JudgeConfig {
        workspace_root: args.workspace.clone(),
        ..JudgeConfig::default()
    };

    let judge = match Judge::new(config) {
        Ok(judge) => judge,
        Err(err) => {
            let outcome = JudgeOutcome {
                verdict: Verdict::system_error(format!("{:#}", err)),
                compiler_message: String::new(),
                actual_output: Vec::new(),
            };
            return print_json(&outcome.report(), args.pretty);
        }
    };

    if args.compile_only {
        let src = args.src.as_deref().unwrap_or_else(|| missing("src"));
        let exe = args.exe.as_deref().unwrap_or_else(|| missing("exe"));
        let report = judge.compile_only(src, &args.lang, exe);
        return print_json(&report, args.pretty);
    }

    let submission = match (args.exe, args.src) {
        (Some(exe), _) => Submission::Executable(exe),
        (None, Some(src)) => Submission::Source(src),
        (None, None) => missing("src"),
    };

    let mut limit = ResourceLimit::new(args.time, args.mem);
    if let Some(bytes) = args.output_limit {
        limit.output = bytes;
    }
    if let Some(bytes) = args.stack_limit {
        limit.stack = bytes;
    }

    let request = JudgeRequest {
        submission,
        language: args.lang,
        input: args.input,
        expected: args.output.unwrap_or_else(|| missing("output")),
        limit,
        mode: args.mode,
        checker: args.checker,
    };

    let outcome = judge.judge(&request);
    print_json(&outcome.report(), args.pretty)
}
