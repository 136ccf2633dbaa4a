#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use assert_fs::TempDir;
use assert_fs::prelude::*;
use toolflow_bash_runner::{
    CommandTranslator, ExecError, PatternPolicy, RetryConfig, RetryExecutor, ShellKind,
};
use toolflow_commons::ErrorCategory;
use toolflow_exec_events::{ExecEvent, MemoryEmitter};

fn runner(dir: &TempDir) -> RetryExecutor {
    RetryExecutor::new(dir.path()).with_translator(CommandTranslator::new(ShellKind::Unix))
}

#[tokio::test]
async fn existence_test_runs_against_real_files() {
    let dir = TempDir::new().unwrap();
    dir.child("package.json").write_str("{}").unwrap();
    let mut events = MemoryEmitter::new();

    let result = runner(&dir)
        .execute("test -f package.json", Some(Duration::from_secs(10)), None, &mut events)
        .await
        .unwrap();
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.attempts, 1);

    let err = runner(&dir)
        .execute("test -f missing.json", Some(Duration::from_secs(10)), None, &mut events)
        .await
        .unwrap_err();
    assert_eq!(err.result().and_then(|r| r.exit_code), Some(1));
}

#[tokio::test]
async fn conditional_and_head_produce_expected_output() {
    let dir = TempDir::new().unwrap();
    dir.child("notes.txt").write_str("one\ntwo\nthree\n").unwrap();
    let mut events = MemoryEmitter::new();

    let result = runner(&dir)
        .execute(
            "if [ -f notes.txt ]; then head -n 2 notes.txt; else pwd; fi",
            None,
            None,
            &mut events,
        )
        .await
        .unwrap();
    assert_eq!(result.stdout, "one\ntwo\n");
}

#[tokio::test]
async fn unknown_program_is_not_retried() {
    let dir = TempDir::new().unwrap();
    let mut events = MemoryEmitter::new();
    let retry = RetryConfig::new(3, Duration::from_millis(10));

    let err = runner(&dir)
        .execute("definitely-not-a-real-program-xyz", None, Some(&retry), &mut events)
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::CommandNotFound);
    assert_eq!(err.attempts(), 1);
    assert!(matches!(
        events.events().last(),
        Some(ExecEvent::AttemptsAborted(_))
    ));
}

#[tokio::test]
async fn timeout_is_classified_and_retried() {
    let dir = TempDir::new().unwrap();
    let mut events = MemoryEmitter::new();
    let retry = RetryConfig::new(2, Duration::from_millis(10));

    let err = runner(&dir)
        .execute("sleep 5", Some(Duration::from_millis(150)), Some(&retry), &mut events)
        .await
        .unwrap_err();
    let ExecError::Failed {
        result, category, ..
    } = err
    else {
        panic!("expected a failed execution");
    };
    assert_eq!(category, ErrorCategory::Timeout);
    assert_eq!(result.attempts, 2);
    assert!(result.timed_out);
}

#[tokio::test]
async fn policy_denial_short_circuits() {
    let dir = TempDir::new().unwrap();
    dir.child("keep.txt").write_str("data").unwrap();
    let mut events = MemoryEmitter::new();

    let err = runner(&dir)
        .with_policy(Arc::new(PatternPolicy::new([r"\brm\b"]).unwrap()))
        .execute("rm keep.txt", None, None, &mut events)
        .await
        .unwrap_err();
    assert!(matches!(err, ExecError::Denied { .. }));
    assert_eq!(std::fs::read_to_string(dir.child("keep.txt").path()).unwrap(), "data");
}
