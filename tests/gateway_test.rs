//! Facade behavior: policy precedence, timeouts, truncation, feature
//! toggles, and the uniform envelope.

mod common;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tempfile::TempDir;

use toolgate::sandbox::{ExecLimits, ExecResult, Sandbox, SandboxError, SubprocessSandbox};
use toolgate::{ExecStatus, Gateway};

use common::{gateway, gateway_with, test_config};

/// Sandbox wrapper counting spawns, to observe that blocked executions
/// never reach the runner.
struct CountingSandbox {
    inner: SubprocessSandbox,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Sandbox for CountingSandbox {
    async fn exec(
        &self,
        cmd: &str,
        args: &[String],
        workspace: &Path,
        limits: &ExecLimits,
    ) -> Result<ExecResult, SandboxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.exec(cmd, args, workspace, limits).await
    }

    fn mode(&self) -> &'static str {
        "counting"
    }
}

fn counting_gateway() -> (Gateway, Arc<AtomicUsize>) {
    let tmp = Box::leak(Box::new(TempDir::new().unwrap()));
    let calls = Arc::new(AtomicUsize::new(0));
    let sandbox = Arc::new(CountingSandbox {
        inner: SubprocessSandbox::new(),
        calls: Arc::clone(&calls),
    });
    let gw = Gateway::with_sandbox(test_config(tmp.path().join("workspaces")), sandbox);
    (gw, calls)
}

// ============================================================================
// Policy precedence
// ============================================================================

#[tokio::test]
async fn blocked_import_never_spawns_a_process() {
    let (gw, calls) = counting_gateway();

    let envelope = gw.run_code(Some("s1"), "import subprocess\nprint(1)").await;
    assert_eq!(envelope.status, ExecStatus::Blocked);
    assert!(envelope.stderr.contains("subprocess"));

    // No sandbox involvement, no session side effects.
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(gw.session_count(), 0);
    assert!(gw.history(Some("s1")).await.is_none());
}

#[tokio::test]
async fn blocked_shell_pattern_is_denied() {
    let (gw, calls) = counting_gateway();

    let envelope = gw.run_shell(Some("s1"), "rm -rf /").await;
    assert_eq!(envelope.status, ExecStatus::Blocked);
    assert!(envelope.stderr.contains("rm -rf /"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn allowed_code_executes() {
    let (gw, calls) = counting_gateway();

    let envelope = gw.run_code(Some("s1"), "print('ok')").await;
    assert_eq!(envelope.status, ExecStatus::Success, "{envelope:?}");
    assert_eq!(envelope.stdout.trim(), "ok");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Feature toggles
// ============================================================================

#[tokio::test]
async fn disabled_shell_is_blocked_with_reason() {
    let gw = gateway_with(|cfg| cfg.allow_shell = false);

    let envelope = gw.run_shell(Some("s1"), "echo hi").await;
    assert_eq!(envelope.status, ExecStatus::Blocked);
    assert!(envelope.stderr.contains("feature disabled"));
}

#[tokio::test]
async fn disabled_pip_install_is_blocked() {
    let gw = gateway_with(|cfg| cfg.allow_pip_install = false);

    let envelope = gw.install_packages(Some("s1"), "requests").await;
    assert_eq!(envelope.status, ExecStatus::Blocked);
    assert!(envelope.stderr.contains("feature disabled"));
}

#[tokio::test]
async fn disabled_file_persistence_blocks_writes() {
    let gw = gateway_with(|cfg| cfg.allow_file_persistence = false);

    let envelope = gw.write_file(Some("s1"), "f.txt", "x").await;
    assert_eq!(envelope.status, ExecStatus::Blocked);
}

#[tokio::test]
async fn invalid_package_names_are_rejected_without_running() {
    let (gw, calls) = counting_gateway();

    let envelope = gw.install_packages(Some("s1"), "requests; rm -rf /").await;
    assert_eq!(envelope.status, ExecStatus::Error);
    assert!(envelope.stderr.contains("invalid package names"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

// ============================================================================
// Timeouts and truncation
// ============================================================================

#[tokio::test]
async fn long_running_shell_times_out() {
    let gw = gateway_with(|cfg| cfg.timeout_secs = 1);

    let started = std::time::Instant::now();
    let envelope = gw.run_shell(Some("s1"), "echo before; sleep 30").await;

    assert_eq!(envelope.status, ExecStatus::Timeout);
    // Output captured before termination is preserved and flagged.
    assert_eq!(envelope.stdout.trim(), "before");
    assert!(envelope.truncated);
    assert!(started.elapsed() < std::time::Duration::from_secs(5));

    // The timeout is recorded in history.
    let history = gw.history(Some("s1")).await.unwrap();
    assert_eq!(history.last().unwrap().status, ExecStatus::Timeout);
}

#[tokio::test]
async fn timeout_is_bounded_despite_background_children() {
    let gw = gateway_with(|cfg| cfg.timeout_secs = 1);

    // Orphaned descendants keep the output pipes open long after the kill;
    // the call must still return within the budget plus the drain grace.
    let started = std::time::Instant::now();
    let envelope = gw.run_shell(Some("s1"), "sleep 8 & echo hi; sleep 60").await;

    assert_eq!(envelope.status, ExecStatus::Timeout);
    assert!(envelope.stdout.contains("hi"));
    assert!(
        started.elapsed() < std::time::Duration::from_secs(5),
        "timeout not honored: took {:?}",
        started.elapsed()
    );

    // The session lock was released; the session stays usable.
    let envelope = gw.run_shell(Some("s1"), "echo after").await;
    assert_eq!(envelope.status, ExecStatus::Success);
}

#[tokio::test]
async fn verbose_output_is_truncated_not_killed() {
    let gw = gateway_with(|cfg| cfg.max_output_lines = 5);

    let envelope = gw
        .run_shell(
            Some("s1"),
            "i=0; while [ $i -lt 50 ]; do echo line$i; i=$((i+1)); done",
        )
        .await;

    // The command ran to completion.
    assert_eq!(envelope.status, ExecStatus::Success);
    assert!(envelope.truncated);
    assert_eq!(envelope.stdout.lines().count(), 5);
}

// ============================================================================
// File operations
// ============================================================================

#[tokio::test]
async fn oversized_file_write_is_limit_exceeded() {
    let gw = gateway_with(|cfg| cfg.max_file_size_bytes = 16);

    let envelope = gw
        .write_file(Some("s1"), "big.txt", "this is definitely more than sixteen bytes")
        .await;
    assert_eq!(envelope.status, ExecStatus::LimitExceeded);

    // Nothing was left behind.
    assert!(gw.list_files(Some("s1")).await.unwrap().is_empty());
}

#[tokio::test]
async fn code_scripts_do_not_accumulate_in_the_workspace() {
    let gw = gateway();

    for _ in 0..3 {
        let envelope = gw.run_code(Some("s1"), "print('x')").await;
        assert_eq!(envelope.status, ExecStatus::Success);
    }

    // The transient scripts are cleaned up after each run.
    assert!(gw.list_files(Some("s1")).await.unwrap().is_empty());
}

#[tokio::test]
async fn file_ceiling_above_the_execution_payload_cap_is_honored() {
    let gw = gateway_with(|cfg| cfg.max_file_size_bytes = 3 * 1024 * 1024);

    let big = "x".repeat(2 * 1024 * 1024);
    let envelope = gw.write_file(Some("s1"), "big.bin", &big).await;
    assert_eq!(envelope.status, ExecStatus::Success);

    let over = "x".repeat(3 * 1024 * 1024 + 1);
    let envelope = gw.write_file(Some("s1"), "over.bin", &over).await;
    assert_eq!(envelope.status, ExecStatus::LimitExceeded);
}

#[tokio::test]
async fn path_escape_in_filename_is_blocked() {
    let gw = gateway();

    let envelope = gw.write_file(Some("s1"), "../outside.txt", "x").await;
    assert_eq!(envelope.status, ExecStatus::Blocked);
    assert!(envelope.stderr.contains("escapes"));
}

#[tokio::test]
async fn read_file_reports_available_files() {
    let gw = gateway();

    gw.write_file(Some("s1"), "a.txt", "x").await;
    let envelope = gw.read_file(Some("s1"), "missing.txt").await;

    assert_eq!(envelope.status, ExecStatus::Error);
    assert!(envelope.stderr.contains("missing.txt"));
    assert!(envelope.stderr.contains("a.txt"));
}

#[tokio::test]
async fn large_file_read_is_truncated() {
    let gw = gateway_with(|cfg| cfg.max_output_lines = 3);

    gw.write_file(Some("s1"), "many.txt", "a\nb\nc\nd\ne\n").await;
    let envelope = gw.read_file(Some("s1"), "many.txt").await;

    assert_eq!(envelope.status, ExecStatus::Success);
    assert!(envelope.truncated);
    assert_eq!(envelope.stdout.lines().count(), 3);
}

// ============================================================================
// Input validation
// ============================================================================

#[tokio::test]
async fn empty_payloads_are_rejected() {
    let gw = gateway();

    let envelope = gw.run_code(Some("s1"), "   ").await;
    assert_eq!(envelope.status, ExecStatus::Error);
    assert!(envelope.stderr.contains("no code provided"));

    let envelope = gw.run_shell(Some("s1"), "").await;
    assert_eq!(envelope.status, ExecStatus::Error);

    let envelope = gw.install_packages(Some("s1"), " , ").await;
    assert_eq!(envelope.status, ExecStatus::Error);
}

// ============================================================================
// Introspection
// ============================================================================

#[tokio::test]
async fn session_info_tracks_activity() {
    let gw = gateway();

    gw.run_shell(Some("s1"), "echo one").await;
    gw.run_shell(Some("s1"), "echo two").await;
    gw.write_file(Some("s1"), "f.txt", "x").await;

    let info = gw.session_info(Some("s1")).await.unwrap();
    assert_eq!(info.session_id, "s1");
    // File writes refresh activity but are not executions.
    assert_eq!(info.execution_count, 2);
    assert_eq!(info.file_count, 1);
    assert!(info.last_active >= info.created_at);
}

#[tokio::test]
async fn environment_info_reports_capabilities() {
    let gw = gateway_with(|cfg| {
        cfg.allow_shell = false;
        cfg.timeout_secs = 7;
    });

    let report = gw.environment_info().await;
    assert_eq!(report.sandbox_mode, "subprocess");
    assert!(!report.shell_enabled);
    assert!(report.pip_install_enabled);
    assert_eq!(report.timeout_secs, 7);
    assert_eq!(report.active_sessions, 0);
}

#[tokio::test]
async fn reload_swaps_configuration_atomically() {
    let gw = gateway();

    let envelope = gw.run_shell(Some("s1"), "echo hi").await;
    assert_eq!(envelope.status, ExecStatus::Success);

    let mut config = gw.config().await.as_ref().clone();
    config.allow_shell = false;
    gw.reload_config(config).await;

    let envelope = gw.run_shell(Some("s1"), "echo hi").await;
    assert_eq!(envelope.status, ExecStatus::Blocked);
}

#[tokio::test]
async fn python_failures_surface_stderr() {
    let gw = gateway();

    let envelope = gw.run_code(Some("s1"), "raise ValueError('boom')").await;
    assert_eq!(envelope.status, ExecStatus::Error);
    assert!(envelope.stderr.contains("boom"));
}

#[tokio::test]
async fn missing_interpreter_is_an_error_envelope() {
    let gw = gateway_with(|cfg| cfg.python_cmd = "definitely_not_a_python_9000".to_string());

    let envelope = gw.run_code(Some("s1"), "print(1)").await;
    assert_eq!(envelope.status, ExecStatus::Error);
    assert!(envelope.stderr.contains("definitely_not_a_python_9000"));
}
