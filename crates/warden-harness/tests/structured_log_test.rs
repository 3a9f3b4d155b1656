//! Integration test: structured logging contract.
//!
//! Validates that:
//! 1. LogEmitter writes valid JSONL to files with sequential trace ids.
//! 2. The validators catch schema violations with line numbers.
//! 3. ArtifactIndex records SHA-256 digests and sizes of real files.
//! 4. EmitterLogger routes runtime diagnostics from a supervised child.
//!
//! Run: cargo test -p warden-harness --test structured_log_test

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use warden_core::{Command, ExitStatus};
use warden_harness::structured_log::{
    ArtifactIndex, EmitterLogger, LogEmitter, LogEntry, LogLevel, Outcome, StreamKind, sha256_hex,
    validate_log_file, validate_log_line,
};
use warden_runtime::{PollLoop, ProcessSupervisor, SupervisorConfig};

fn unique_tmp_dir(prefix: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time should be after UNIX_EPOCH")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{}-{nanos}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

#[test]
fn emitter_writes_valid_jsonl_file() {
    let dir = unique_tmp_dir("warden-log-file");
    let path = dir.join("run.jsonl");

    let mut emitter = LogEmitter::to_file(&path, "run-7", "suite").unwrap();
    emitter.emit(LogLevel::Info, "suite_start").unwrap();
    emitter
        .emit_entry(
            LogEntry::new(String::new(), LogLevel::Warn, "reaped")
                .with_pid(4321)
                .with_exit_status(ExitStatus::Signaled(15))
                .with_symbol("test_alpha")
                .with_outcome(Outcome::Fail)
                .with_duration_ms(12),
        )
        .unwrap();
    emitter
        .emit_entry(
            LogEntry::new("run-7::suite::custom", LogLevel::Debug, "chunk")
                .with_stream(StreamKind::Stdout)
                .with_bytes(4096),
        )
        .unwrap();
    emitter.flush().unwrap();
    drop(emitter);

    let (lines, errors) = validate_log_file(&path).unwrap();
    assert_eq!(lines, 3);
    assert!(errors.is_empty(), "unexpected errors: {errors:?}");

    let content = std::fs::read_to_string(&path).unwrap();
    let entries: Vec<LogEntry> = content
        .lines()
        .enumerate()
        .map(|(i, line)| validate_log_line(line, i + 1).unwrap())
        .collect();
    assert_eq!(entries[0].trace_id, "run-7::suite::001");
    assert_eq!(entries[1].trace_id, "run-7::suite::002");
    assert_eq!(entries[1].signal, Some(15));
    assert_eq!(entries[1].exit_code, None);
    assert_eq!(entries[1].symbol.as_deref(), Some("test_alpha"));
    // Caller-supplied trace ids are kept and do not consume a sequence number.
    assert_eq!(entries[2].trace_id, "run-7::suite::custom");
    assert_eq!(entries[2].stream, Some(StreamKind::Stdout));
}

#[test]
fn validator_reports_each_bad_line() {
    let dir = unique_tmp_dir("warden-log-bad");
    let path = dir.join("bad.jsonl");
    let good = LogEntry::new("r::s::001", LogLevel::Info, "spawn")
        .to_jsonl()
        .unwrap();
    let content = [
        good.as_str(),
        "",
        r#"{"timestamp":"t","level":"info","event":"no_trace"}"#,
        r#"{"timestamp":"t","trace_id":"r::s::003","level":"loud","event":"x"}"#,
        "not json",
        r#"{"timestamp":"t","trace_id":"r::s::005","level":"info","event":"x","exit_code":1,"signal":9}"#,
    ]
    .join("\n");
    std::fs::write(&path, content).unwrap();

    let (lines, errors) = validate_log_file(&path).unwrap();
    assert_eq!(lines, 5, "blank lines are not counted");
    let fields: Vec<(usize, &str)> = errors
        .iter()
        .map(|e| (e.line_number, e.field.as_str()))
        .collect();
    assert_eq!(
        fields,
        vec![
            (3, "trace_id"),
            (4, "level"),
            (5, "<json>"),
            (6, "exit_code"),
        ]
    );
    assert!(errors[1].to_string().starts_with("line 4: field 'level'"));
}

#[test]
fn trace_id_needs_three_parts() {
    for bad in ["plain", "a::b", "a::b::c::d"] {
        let line = format!(
            r#"{{"timestamp":"t","trace_id":"{bad}","level":"info","event":"x"}}"#
        );
        let errors = validate_log_line(&line, 1).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "trace_id"), "{bad}");
    }
}

#[test]
fn artifact_index_hashes_files() {
    let dir = unique_tmp_dir("warden-artifacts");
    let stdout = dir.join("stdout.bin");
    std::fs::write(&stdout, b"hello").unwrap();

    let mut index = ArtifactIndex::new("run-1", "s0");
    index.add_file(&stdout, "captured_output").unwrap();
    index.add("external.log", "log", "00");
    let parsed: serde_json::Value = serde_json::from_str(&index.to_json().unwrap()).unwrap();

    assert_eq!(parsed["index_version"], 1);
    assert_eq!(parsed["run_id"], "run-1");
    assert_eq!(parsed["session"], "s0");
    let artifacts = parsed["artifacts"].as_array().unwrap();
    assert_eq!(artifacts.len(), 2);
    assert_eq!(
        artifacts[0]["sha256"],
        "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
    );
    assert_eq!(artifacts[0]["sha256"], sha256_hex(b"hello"));
    assert_eq!(artifacts[0]["size_bytes"], 5);
    assert!(artifacts[1].get("size_bytes").is_none());

    assert!(index.add_file(&dir.join("missing"), "log").is_err());
}

#[test]
fn emitter_logger_captures_runtime_diagnostics() {
    let (emitter, buffer) = LogEmitter::to_buffer("run-3", "supervisor");
    let logger = Arc::new(EmitterLogger::new(emitter));
    let supervisor = ProcessSupervisor::new(
        PollLoop::new().shared(),
        logger.clone(),
        SupervisorConfig::default(),
    );

    let handle = supervisor.handle();
    let missing = Command::from_args(["/nonexistent/warden-test-binary"]);
    assert!(handle.spawn(&missing).is_err());

    let handle = supervisor.handle();
    handle.spawn(&Command::from_args(["true"])).unwrap();
    handle.wait(Duration::from_secs(10)).unwrap();
    handle.close();
    logger.flush().unwrap();

    let lines = buffer.lines();
    assert!(!lines.is_empty());
    let entries: Vec<LogEntry> = lines
        .iter()
        .enumerate()
        .map(|(i, line)| validate_log_line(line, i + 1).unwrap())
        .collect();
    assert!(entries.iter().all(|e| e.event == "runtime_log"));
    assert!(entries.iter().any(|e| e.level == LogLevel::Warn));
    for (i, entry) in entries.iter().enumerate() {
        assert_eq!(entry.trace_id, format!("run-3::supervisor::{:03}", i + 1));
    }
}
