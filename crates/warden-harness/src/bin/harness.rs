//! CLI entrypoint for the warden harness.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use warden_core::elf::{FileHeader, Layout};
use warden_core::{Command as ChildCommand, SpawnFlags};
use warden_harness::HarnessError;
use warden_harness::runner::{DEFAULT_TIMEOUT, IsolatedRun, RunReport};
use warden_harness::structured_log::{
    ArtifactIndex, EmitterLogger, LogEmitter, Outcome, validate_log_file,
};
use warden_runtime::SupervisorConfig;

/// Environment variable holding spawn flags for `run`, e.g.
/// `search-path,new-process-group`.
const ENV_SPAWN_FLAGS: &str = "WARDEN_SPAWN_FLAGS";

/// Test-process tooling for warden.
#[derive(Debug, Parser)]
#[command(name = "warden-harness")]
#[command(about = "Discover and run C/C++ unit tests in isolated child processes")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List global functions defined in a shared object's .text section.
    Scan {
        /// Shared object to scan.
        path: PathBuf,
        /// Only list symbols starting with this prefix (e.g. `test_`).
        #[arg(long)]
        prefix: Option<String>,
        /// Emit a JSON document instead of one name per line.
        #[arg(long)]
        json: bool,
    },
    /// Report whether a file is a loadable ELF shared object.
    Probe { path: PathBuf },
    /// Run one command in isolation and classify the result.
    Run {
        /// Deadline before the child is disposed.
        #[arg(long, default_value_t = DEFAULT_TIMEOUT.as_millis() as u64)]
        timeout_ms: u64,
        /// File whose contents are written to the child's stdin.
        #[arg(long)]
        stdin: Option<PathBuf>,
        /// Structured JSONL log destination (`-` for stdout).
        #[arg(long)]
        log: Option<PathBuf>,
        /// Directory for captured stdout/stderr and an artifact index.
        #[arg(long)]
        artifacts: Option<PathBuf>,
        /// Run id used in trace ids.
        #[arg(long)]
        run_id: Option<String>,
        /// Command and arguments.
        #[arg(last = true, required = true)]
        argv: Vec<String>,
    },
    /// Validate a structured JSONL log file.
    ValidateLog { path: PathBuf },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match dispatch(cli.command) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("warden-harness: {err}");
            ExitCode::from(err.exit_code())
        }
    }
}

fn dispatch(command: Command) -> Result<ExitCode, HarnessError> {
    match command {
        Command::Scan { path, prefix, json } => scan(&path, prefix.as_deref(), json),
        Command::Probe { path } => probe(&path),
        Command::Run {
            timeout_ms,
            stdin,
            log,
            artifacts,
            run_id,
            argv,
        } => {
            let run_id = run_id.unwrap_or_else(|| format!("run-{}", std::process::id()));
            let report = run(
                argv,
                Duration::from_millis(timeout_ms),
                stdin.as_deref(),
                log.as_deref(),
                &run_id,
            )?;
            if let Some(dir) = artifacts {
                write_artifacts(&dir, &run_id, &report)?;
            }
            eprintln!(
                "warden-harness: {} ({}) in {}ms",
                report.outcome.as_str(),
                report
                    .status
                    .map_or_else(|| "not reaped".to_string(), |s| s.to_string()),
                report.duration.as_millis()
            );
            Ok(if report.outcome == Outcome::Pass {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::ValidateLog { path } => {
            let (lines, errors) = validate_log_file(&path)?;
            for err in &errors {
                eprintln!("{err}");
            }
            let mut bad: Vec<usize> = errors.iter().map(|e| e.line_number).collect();
            bad.dedup();
            if bad.is_empty() {
                eprintln!("{}: {lines} lines valid", path.display());
                Ok(ExitCode::SUCCESS)
            } else {
                Err(HarnessError::InvalidLog {
                    lines,
                    invalid: bad.len(),
                })
            }
        }
    }
}

fn scan(path: &Path, prefix: Option<&str>, json: bool) -> Result<ExitCode, HarnessError> {
    if !warden_core::is_shared_object(path) {
        return Err(HarnessError::NotSharedObject(path.to_path_buf()));
    }
    let symbols: Vec<String> = warden_core::scan_function_symbols(path)
        .into_iter()
        .filter(|name| prefix.is_none_or(|p| name.starts_with(p)))
        .collect();

    let mut out = std::io::stdout().lock();
    if json {
        let doc = serde_json::json!({
            "path": path.display().to_string(),
            "prefix": prefix,
            "symbols": symbols,
        });
        writeln!(out, "{}", serde_json::to_string_pretty(&doc)?)?;
    } else {
        for name in &symbols {
            writeln!(out, "{name}")?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn probe(path: &Path) -> Result<ExitCode, HarnessError> {
    let data = std::fs::read(path)?;
    let header = Layout::from_ident(&data)
        .and_then(|layout| FileHeader::parse(&data, &layout).map(|h| (layout, h)));
    match header {
        Ok((layout, header)) if header.is_shared_object() => {
            println!(
                "{}: {:?} {:?} shared object, {} sections",
                path.display(),
                layout.class,
                layout.encoding,
                header.e_shnum
            );
            Ok(ExitCode::SUCCESS)
        }
        Ok((_, header)) => {
            eprintln!("{}: object type {:?}", path.display(), header.e_type);
            Err(HarnessError::NotSharedObject(path.to_path_buf()))
        }
        Err(err) => {
            eprintln!("{}: {err}", path.display());
            Err(HarnessError::NotSharedObject(path.to_path_buf()))
        }
    }
}

fn run(
    argv: Vec<String>,
    timeout: Duration,
    stdin: Option<&Path>,
    log: Option<&Path>,
    run_id: &str,
) -> Result<RunReport, HarnessError> {
    if argv.is_empty() {
        return Err(HarnessError::EmptyCommand);
    }
    let mut command = ChildCommand::from_args(argv);
    if let Ok(raw) = std::env::var(ENV_SPAWN_FLAGS) {
        command.flags(SpawnFlags::from_str_loose(&raw));
    }

    let mut isolated = IsolatedRun::new(command)
        .with_timeout(timeout)
        .with_config(SupervisorConfig::from_env());
    if let Some(path) = stdin {
        isolated = isolated.with_stdin(std::fs::read(path)?);
    }

    let logger = match log {
        Some(path) if path == Path::new("-") => Some(LogEmitter::to_stdout(run_id, "cli")),
        Some(path) => Some(LogEmitter::to_file(path, run_id, "cli")?),
        None => None,
    }
    .map(|emitter| Arc::new(EmitterLogger::new(emitter)));
    if let Some(logger) = &logger {
        isolated = isolated.with_logger(Arc::clone(logger) as Arc<dyn warden_core::Logger>);
    }

    let report = isolated.run()?;

    std::io::stdout().write_all(&report.stdout)?;
    std::io::stderr().write_all(&report.stderr)?;
    if let Some(logger) = logger {
        logger.emit_entry(report.log_entry())?;
        logger.flush()?;
    }
    Ok(report)
}

fn write_artifacts(dir: &Path, run_id: &str, report: &RunReport) -> Result<(), HarnessError> {
    std::fs::create_dir_all(dir)?;
    let mut index = ArtifactIndex::new(run_id, "cli");
    for (name, bytes) in [("stdout.bin", &report.stdout), ("stderr.bin", &report.stderr)] {
        let path = dir.join(name);
        std::fs::write(&path, bytes)?;
        index.add_file(&path, "captured_output")?;
    }
    std::fs::write(dir.join("artifact_index.json"), index.to_json()?)?;
    Ok(())
}
