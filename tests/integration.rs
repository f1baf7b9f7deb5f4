//! Integration tests that drive the compiled `schedarray` binary.
//!
//! Each test owns an isolated database in a temporary directory, selected
//! through the `SCHEDARRAY_DB` environment variable, and validates the CLI
//! contract: JSON documents under `--json`, exit codes, and the end-to-end
//! behavior of a foreground service.

use std::path::PathBuf;
use std::process::{Command, Output, Stdio};
use std::time::{Duration, Instant};

/// Path to the compiled binary.
fn binary() -> PathBuf {
    // Prefer the current exe's directory (works inside cargo test).
    let mut p = std::env::current_exe().expect("current exe");
    p.pop(); // remove test binary name
    if p.ends_with("deps") {
        p.pop();
    }
    p.push("schedarray");
    if cfg!(windows) {
        p.set_extension("exe");
    }
    p
}

/// Test harness that owns an isolated scheduler database.
struct TestHarness {
    _tmp: tempfile::TempDir,
    db: String,
}

impl TestHarness {
    fn new() -> Self {
        let tmp = tempfile::tempdir().expect("create tempdir");
        let db = tmp
            .path()
            .join("scheduler.db")
            .to_str()
            .expect("tempdir path is valid UTF-8")
            .to_string();
        Self { _tmp: tmp, db }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(binary());
        cmd.args(args);
        cmd.env("SCHEDARRAY_DB", &self.db);
        cmd
    }

    fn run(&self, args: &[&str]) -> Output {
        self.command(args).output().expect("run binary")
    }

    /// Run with `--json` appended and parse stdout as one JSON document.
    fn run_json(&self, args: &[&str]) -> (serde_json::Value, i32) {
        let mut args = args.to_vec();
        args.push("--json");
        let output = self.run(&args);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let value = serde_json::from_str(stdout.trim()).unwrap_or_else(|e| {
            panic!("stdout is not valid JSON: {e}\nstdout: {stdout}\nstderr: {stderr}\nargs: {args:?}")
        });
        (value, output.status.code().unwrap_or(-1))
    }

    fn submit(&self, extra: &[&str]) -> String {
        let mut args = vec!["submit"];
        args.extend_from_slice(extra);
        let (v, code) = self.run_json(&args);
        assert_eq!(code, 0, "submit failed: {v}");
        v["job_id"].as_str().expect("job_id in submit output").to_string()
    }

    /// Poll `status --json` until the predicate holds or the deadline passes.
    fn wait_for(
        &self,
        job_id: &str,
        deadline: Duration,
        predicate: impl Fn(&serde_json::Value) -> bool,
    ) -> serde_json::Value {
        let end = Instant::now() + deadline;
        loop {
            let (v, code) = self.run_json(&["status", job_id]);
            assert_eq!(code, 0, "status failed: {v}");
            if predicate(&v) {
                return v;
            }
            assert!(
                Instant::now() < end,
                "timed out waiting on job {job_id}; last: {v}"
            );
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}

fn state_of(v: &serde_json::Value) -> &str {
    v["state"].as_str().unwrap_or("")
}

fn is_terminal(v: &serde_json::Value) -> bool {
    matches!(
        state_of(v),
        "completed" | "failed" | "cancelled" | "timeout"
    )
}

// ── submit / status ────────────────────────────────────────────────────────────

#[test]
fn submit_then_status_round_trips() {
    let h = TestHarness::new();
    let job_id = h.submit(&[
        "--command",
        "echo hi",
        "--job-name",
        "roundtrip",
        "--priority",
        "5",
        "--timeout",
        "60",
        "--memory",
        "4G",
        "--cpus",
        "2",
    ]);

    let (v, code) = h.run_json(&["status", &job_id]);
    assert_eq!(code, 0);
    assert_eq!(v["job_id"], job_id.as_str());
    assert_eq!(v["job_name"], "roundtrip");
    assert_eq!(v["command"], "echo hi");
    assert_eq!(v["state"], "pending");
    assert_eq!(v["priority"], 5);
    assert_eq!(v["timeout"], 60);
    assert_eq!(v["memory_limit"], "4G");
    assert_eq!(v["cpu_limit"], 2);
    assert_eq!(v["max_retries"], 3);
    assert_eq!(v["retry_count"], 0);
    assert!(v["submitted_at"].as_str().is_some());
    assert!(v["started_at"].is_null());
    assert!(v["return_code"].is_null());
}

#[test]
fn submit_without_command_or_script_is_an_arg_error() {
    let h = TestHarness::new();
    let output = h.run(&["submit"]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Error:"), "stderr: {stderr}");

    // Under --json the error is also emitted as a document.
    let (v, code) = h.run_json(&["submit"]);
    assert_eq!(code, 1);
    assert!(v["error"].as_str().is_some(), "no error field: {v}");
}

#[test]
fn submit_reads_script_file() {
    let h = TestHarness::new();
    let script = h._tmp.path().join("job.sh");
    std::fs::write(&script, "echo scripted\n").unwrap();

    let job_id = h.submit(&["--script", script.to_str().unwrap()]);
    let (v, _) = h.run_json(&["status", &job_id]);
    assert_eq!(v["command"], "echo scripted\n");
}

#[test]
fn submit_human_output_names_the_job() {
    let h = TestHarness::new();
    let output = h.run(&["submit", "--command", "true"]);
    assert_eq!(output.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Submitted job "), "stdout: {stdout}");
}

#[test]
fn status_of_unknown_job_exits_one() {
    let h = TestHarness::new();
    let output = h.run(&["status", "no-such-job"]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("not found"), "stderr: {stderr}");
}

// ── list / counts ──────────────────────────────────────────────────────────────

#[test]
fn list_returns_jobs_in_priority_order() {
    let h = TestHarness::new();
    let low = h.submit(&["--command", "true"]);
    let high = h.submit(&["--command", "true", "--priority", "9"]);

    let (v, code) = h.run_json(&["list"]);
    assert_eq!(code, 0);
    let jobs = v.as_array().expect("list emits an array");
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0]["job_id"], high.as_str());
    assert_eq!(jobs[1]["job_id"], low.as_str());

    let (v, _) = h.run_json(&["list", "--state", "running"]);
    assert!(v.as_array().unwrap().is_empty());

    let (v, _) = h.run_json(&["list", "--limit", "1"]);
    assert_eq!(v.as_array().unwrap().len(), 1);
}

#[test]
fn counts_reports_per_state_totals() {
    let h = TestHarness::new();
    h.submit(&["--command", "true"]);
    h.submit(&["--command", "true"]);

    let (v, code) = h.run_json(&["counts"]);
    assert_eq!(code, 0);
    assert_eq!(v["pending"], 2);
}

// ── cancel / delete / cleanup ──────────────────────────────────────────────────

#[test]
fn cancel_then_delete_pending_job() {
    let h = TestHarness::new();
    let job_id = h.submit(&["--command", "sleep 60"]);

    let (v, code) = h.run_json(&["cancel", &job_id]);
    assert_eq!(code, 0);
    assert_eq!(v["cancelled"], true);

    // A second cancel is refused.
    let (v, code) = h.run_json(&["cancel", &job_id]);
    assert_eq!(code, 1);
    assert_eq!(v["cancelled"], false);

    let (v, code) = h.run_json(&["delete", &job_id]);
    assert_eq!(code, 0);
    assert_eq!(v["deleted"], true);

    let output = h.run(&["status", &job_id]);
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn cleanup_sweeps_terminal_jobs() {
    let h = TestHarness::new();
    let job_id = h.submit(&["--command", "true"]);
    let (_, code) = h.run_json(&["cancel", &job_id]);
    assert_eq!(code, 0);
    let survivor = h.submit(&["--command", "true"]);

    let (v, code) = h.run_json(&["cleanup"]);
    assert_eq!(code, 0);
    assert_eq!(v["deleted"], 1);
    assert_eq!(v["failed"], 0);

    let (v, _) = h.run_json(&["counts"]);
    assert_eq!(v["pending"], 1);
    assert!(v["cancelled"].is_null());
    let (_, code) = h.run_json(&["status", &survivor]);
    assert_eq!(code, 0);
}

// ── service ────────────────────────────────────────────────────────────────────

#[test]
fn service_status_without_a_running_service() {
    let h = TestHarness::new();
    h.submit(&["--command", "true"]);

    let (v, code) = h.run_json(&["service", "status"]);
    assert_eq!(code, 0);
    assert_eq!(v["running"], false);
    assert!(v["workers"]["total"].as_u64().unwrap() >= 1);
    assert_eq!(v["jobs"]["pending"], 1);
}

#[test]
fn service_stop_is_a_quiet_no_op() {
    let h = TestHarness::new();
    let (v, code) = h.run_json(&["service", "stop"]);
    assert_eq!(code, 0);
    assert_eq!(v["stopped"], true);
}

#[cfg(unix)]
mod service_e2e {
    use super::*;

    fn spawn_service(h: &TestHarness, max_workers: &str) -> std::process::Child {
        h.command(&[
            "service",
            "start",
            "--max-workers",
            max_workers,
            "--poll-interval",
            "0.1",
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn service")
    }

    fn terminate(child: &mut std::process::Child) -> i32 {
        // SAFETY: kill(2) with a pid we own and a valid signal number.
        unsafe {
            libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
        }
        let status = child.wait().expect("wait for service");
        status.code().unwrap_or(-1)
    }

    #[test]
    fn happy_path_runs_a_job_to_completion() {
        let h = TestHarness::new();
        let mut service = spawn_service(&h, "1");

        let job_id = h.submit(&["--command", "echo hi"]);
        let v = h.wait_for(&job_id, Duration::from_secs(15), is_terminal);
        assert_eq!(state_of(&v), "completed");
        assert_eq!(v["return_code"], 0);
        let stdout = v["metadata"]["stdout"].as_str().expect("captured stdout");
        assert!(stdout.contains("hi"), "stdout: {stdout:?}");

        // SIGTERM stops the service cleanly with exit code 0.
        assert_eq!(terminate(&mut service), 0);
    }

    #[test]
    fn higher_priority_job_starts_first() {
        let h = TestHarness::new();
        // Submit before starting the service so both are pending together.
        let low = h.submit(&["--command", "true", "--priority", "0"]);
        let high = h.submit(&["--command", "true", "--priority", "10"]);

        let mut service = spawn_service(&h, "1");
        let low_v = h.wait_for(&low, Duration::from_secs(15), is_terminal);
        let high_v = h.wait_for(&high, Duration::from_secs(15), is_terminal);
        terminate(&mut service);

        let low_started = low_v["started_at"].as_str().expect("low started_at");
        let high_started = high_v["started_at"].as_str().expect("high started_at");
        assert!(
            high_started < low_started,
            "high started {high_started}, low started {low_started}"
        );
    }

    #[test]
    fn cancelling_a_running_job_kills_its_process() {
        let h = TestHarness::new();
        let mut service = spawn_service(&h, "1");

        let job_id = h.submit(&["--command", "sleep 60"]);
        h.wait_for(&job_id, Duration::from_secs(15), |v| {
            state_of(v) == "running"
        });

        let (_, code) = h.run_json(&["cancel", &job_id]);
        assert_eq!(code, 0);

        let v = h.wait_for(&job_id, Duration::from_secs(15), is_terminal);
        assert_eq!(state_of(&v), "cancelled");
        assert!(v["completed_at"].as_str().is_some());

        terminate(&mut service);
    }

    #[test]
    fn timeout_becomes_a_distinct_terminal_state() {
        let h = TestHarness::new();
        let mut service = spawn_service(&h, "1");

        let job_id = h.submit(&["--command", "sleep 30", "--timeout", "1"]);
        let v = h.wait_for(&job_id, Duration::from_secs(15), is_terminal);
        assert_eq!(state_of(&v), "timeout");
        assert!(v["completed_at"].as_str().is_some());

        terminate(&mut service);
    }

    #[test]
    fn sigkilled_service_leaves_an_orphan_that_the_next_service_repairs() {
        let h = TestHarness::new();
        let mut service = spawn_service(&h, "1");

        let job_id = h.submit(&["--command", "sleep 60"]);
        h.wait_for(&job_id, Duration::from_secs(15), |v| {
            state_of(v) == "running"
        });

        // Hard-kill the service; the row stays RUNNING with a dead worker.
        service.kill().expect("SIGKILL service");
        let _ = service.wait();

        let mut restarted = spawn_service(&h, "1");
        let v = h.wait_for(&job_id, Duration::from_secs(15), is_terminal);
        assert_eq!(state_of(&v), "failed");

        terminate(&mut restarted);
    }

    #[test]
    fn delete_refuses_running_then_accepts_cancelled() {
        let h = TestHarness::new();
        let mut service = spawn_service(&h, "1");

        let job_id = h.submit(&["--command", "sleep 60"]);
        h.wait_for(&job_id, Duration::from_secs(15), |v| {
            state_of(v) == "running"
        });

        let (v, code) = h.run_json(&["delete", &job_id]);
        assert_eq!(code, 1);
        assert_eq!(v["deleted"], false);
        let (_, code) = h.run_json(&["status", &job_id]);
        assert_eq!(code, 0, "job must survive the refused delete");

        let (_, code) = h.run_json(&["cancel", &job_id]);
        assert_eq!(code, 0);
        h.wait_for(&job_id, Duration::from_secs(15), |v| {
            state_of(v) == "cancelled"
        });

        let (v, code) = h.run_json(&["delete", &job_id]);
        assert_eq!(code, 0, "delete after terminal state: {v}");
        let output = h.run(&["status", &job_id]);
        assert_eq!(output.status.code(), Some(1));

        terminate(&mut service);
    }
}
