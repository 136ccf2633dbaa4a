use assert_fs::TempDir;
use assert_fs::prelude::*;
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use toolflow::cli::{
    RunCommandOptions, handle_run_command, handle_translate_command, handle_validate_command,
};
use toolflow::startup::StartupContext;
use toolflow_bash_runner::ShellKind;
use toolflow_core::{FlowState, ProviderKind};

fn workspace() -> (TempDir, StartupContext) {
    let dir = TempDir::new().unwrap();
    dir.child("notes.txt").write_str("ship on friday\n").unwrap();
    dir.child("toolflow.toml")
        .write_str("[policy]\ndeny_patterns = [\"rm\\\\s+-rf\"]\n")
        .unwrap();
    let config = dir.child("toolflow.toml");
    let startup = StartupContext::load(dir.path(), Some(config.path())).unwrap();
    (dir, startup)
}

#[cfg(unix)]
#[tokio::test]
async fn run_executes_every_step_kind() {
    let (dir, startup) = workspace();
    dir.child("flow.json")
        .write_str(
            &json!({
                "steps": [
                    {"type": "chat", "id": "plan", "prompt": "what next?"},
                    {"type": "tool_call", "id": "check", "tool": "shell_exec",
                     "args": {"command": "test -f notes.txt", "timeoutMs": 5000}},
                    {"type": "read_file", "id": "notes", "path": "notes.txt"},
                    {"type": "approval", "message": "post {{notes.content}}?"}
                ]
            })
            .to_string(),
        )
        .unwrap();

    let options = RunCommandOptions {
        flow: "flow.json".into(),
        auto_approve: true,
        provider: Some(ProviderKind::Mock),
        ..RunCommandOptions::default()
    };
    let report = handle_run_command(&startup, &options, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.state, FlowState::Completed);
    assert_eq!(report.context.get("plan.text"), Some(&json!("(mock reply)")));
    assert_eq!(report.context.get("check.exitCode"), Some(&json!(0)));
    assert_eq!(
        report.context.get("notes.content"),
        Some(&json!("ship on friday\n"))
    );
}

#[tokio::test]
async fn dry_run_reports_denied_command_without_running_it() {
    let (dir, startup) = workspace();
    dir.child("flow.toml")
        .write_str(
            r#"
[[steps]]
type = "tool_call"
tool = "shell_exec"
args = { command = "rm -rf build" }
"#,
        )
        .unwrap();

    let options = RunCommandOptions {
        flow: "flow.toml".into(),
        dry_run: true,
        ..RunCommandOptions::default()
    };
    let report = handle_run_command(&startup, &options, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.state, FlowState::Failed);
    assert_eq!(report.error.map(|failed| failed.error.attempts()), Some(0));
}

#[test]
fn validate_rejects_out_of_range_retry() {
    let (dir, startup) = workspace();
    dir.child("bad.json")
        .write_str(r#"{"steps": [{"type": "chat", "prompt": "hi", "retry": {"maxAttempts": 42}}]}"#)
        .unwrap();
    dir.child("good.json")
        .write_str(r#"{"steps": [{"type": "read_file", "path": "notes.txt"}]}"#)
        .unwrap();

    let err = handle_validate_command(&startup, "bad.json".as_ref()).unwrap_err();
    assert!(format!("{err:#}").contains("max attempts"), "{err:#}");
    assert_eq!(handle_validate_command(&startup, "good.json".as_ref()).unwrap().len(), 1);
}

#[test]
fn translate_targets_requested_shell_and_checks_policy() {
    let (_dir, startup) = workspace();
    let words = |text: &str| text.split(' ').map(String::from).collect::<Vec<_>>();

    let outcome =
        handle_translate_command(&startup, Some(ShellKind::Windows), &words("head -n 5 log.txt"))
            .unwrap();
    assert_eq!(outcome.native, "Get-Content -LiteralPath 'log.txt' -TotalCount 5");
    assert!(outcome.denied.is_none());

    let denied =
        handle_translate_command(&startup, Some(ShellKind::Unix), &words("rm -rf target")).unwrap();
    assert_eq!(denied.native, "rm -rf target");
    assert!(denied.denied.is_some());
}
