//! Integration tests for the supervisor run loop against real children.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use jobrunner::artifacts::{ArtifactDir, CommandRecord};
use jobrunner::config::{ContainerConfig, ExpectPrompt, RunnerMode};
use jobrunner::events::{Event, EventError, EventSink};
use jobrunner::supervisor::{
    JobOutcome, JobStatus, ProcessSupervisor, StatusNotifier, RC_NOT_FOUND, RC_TIMEOUT,
};
use tempfile::TempDir;

#[derive(Default)]
struct Collect(Mutex<Vec<Event>>);

impl EventSink for Collect {
    fn on_event(&self, event: Event) -> Result<(), EventError> {
        if !event.is_eof() {
            self.0.lock().unwrap().push(event);
        }
        Ok(())
    }
}

impl Collect {
    fn stdout(&self) -> Vec<String> {
        self.0.lock().unwrap().iter().map(|e| e.stdout.clone()).collect()
    }
}

fn sh(dir: &TempDir, script: &str, args: &[&str]) -> (Arc<Collect>, ProcessSupervisor) {
    let mut command = vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()];
    if !args.is_empty() {
        command.push("sh".to_string());
        command.extend(args.iter().map(|a| (*a).to_string()));
    }
    let sink = Arc::new(Collect::default());
    let supervisor = ProcessSupervisor::new(
        CommandRecord {
            command,
            ..Default::default()
        },
        ArtifactDir::new(dir.path().join("job")),
        sink.clone(),
        StatusNotifier::new("job"),
    )
    .poll_interval(Duration::from_millis(50));
    (sink, supervisor)
}

/// True once `pid` has exited (gone or a zombie awaiting reaping).
fn process_gone(pid: i32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Err(_) => true,
        Ok(stat) => stat
            .rsplit_once(')')
            .is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')),
    }
}

fn wait_gone(pid: i32) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if process_gone(pid) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

fn read_pid(path: &Path) -> i32 {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(text) = std::fs::read_to_string(path) {
            if let Ok(pid) = text.trim().parse() {
                return pid;
            }
        }
        assert!(Instant::now() < deadline, "child never wrote its pid");
        std::thread::sleep(Duration::from_millis(20));
    }
}

/// An engine executable that appends its arguments to `engine.log`.
fn fake_engine(dir: &TempDir) -> (ContainerConfig, PathBuf) {
    let engine = dir.path().join("engine");
    let log = dir.path().join("engine.log");
    std::fs::write(
        &engine,
        format!("#!/bin/sh\necho \"$@\" >> '{}'\n", log.display()),
    )
    .unwrap();
    let mut perms = std::fs::metadata(&engine).unwrap().permissions();
    std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
    std::fs::set_permissions(&engine, perms).unwrap();
    let container = ContainerConfig {
        executable: engine.to_string_lossy().into_owned(),
        name: "c1".to_string(),
    };
    (container, log)
}

fn engine_calls(log: &Path) -> String {
    std::fs::read_to_string(log).unwrap_or_default()
}

#[tokio::test]
async fn echo_hello_is_one_verbose_event() {
    let dir = TempDir::new().unwrap();
    let (sink, mut supervisor) = sh(&dir, "echo hello", &[]);

    let outcome = supervisor.run(RunnerMode::Interactive).await.unwrap();

    assert_eq!(
        outcome,
        JobOutcome {
            status: JobStatus::Successful,
            rc: 0
        }
    );
    let events = sink.0.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert!(events[0].is_verbose());
    assert_eq!(events[0].stdout, "hello");
    assert_eq!(events[0].counter, 1);
    assert!(events[0].pid.is_some());
    assert_eq!(
        std::fs::read_to_string(dir.path().join("job/rc")).unwrap(),
        "0"
    );
}

#[tokio::test]
async fn idle_timeout_kills_silent_child() {
    let dir = TempDir::new().unwrap();
    let (sink, supervisor) = sh(&dir, "echo started; sleep 30", &[]);
    let mut supervisor = supervisor.idle_timeout(Some(Duration::from_millis(500)));

    let start = Instant::now();
    let outcome = supervisor.run(RunnerMode::Interactive).await.unwrap();

    assert!(start.elapsed() < Duration::from_secs(5), "{:?}", start.elapsed());
    assert_eq!(
        outcome,
        JobOutcome {
            status: JobStatus::Timeout,
            rc: RC_TIMEOUT
        }
    );
    assert_eq!(sink.stdout(), ["started"]);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("job/status")).unwrap(),
        "timeout"
    );
}

#[tokio::test]
async fn job_timeout_kills_chatty_child() {
    let dir = TempDir::new().unwrap();
    let (sink, supervisor) = sh(&dir, "while true; do echo tick; sleep 0.05; done", &[]);
    let mut supervisor = supervisor
        .idle_timeout(Some(Duration::from_secs(10)))
        .job_timeout(Some(Duration::from_millis(500)));

    let start = Instant::now();
    let outcome = supervisor.run(RunnerMode::Interactive).await.unwrap();

    assert!(start.elapsed() < Duration::from_secs(5), "{:?}", start.elapsed());
    assert_eq!(outcome.status, JobStatus::Timeout);
    assert_eq!(outcome.rc, RC_TIMEOUT);
    assert!(sink.stdout().len() > 1);
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn cancel_on_second_poll_kills_process_group() {
    let dir = TempDir::new().unwrap();
    let pid_file = dir.path().join("grandchild.pid");
    let (_sink, supervisor) = sh(
        &dir,
        "sleep 30 & echo $! > \"$1\"; wait",
        &[pid_file.to_str().unwrap()],
    );
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = calls.clone();
    let mut supervisor = supervisor
        .poll_interval(Duration::from_millis(300))
        .cancel_callback(Box::new(move || {
            Ok(counted.fetch_add(1, Ordering::SeqCst) + 1 >= 2)
        }));

    let outcome = supervisor.run(RunnerMode::Interactive).await.unwrap();

    assert_eq!(
        outcome,
        JobOutcome {
            status: JobStatus::Canceled,
            rc: RC_TIMEOUT
        }
    );
    assert!(calls.load(Ordering::SeqCst) >= 2);
    let grandchild = read_pid(&pid_file);
    assert!(wait_gone(grandchild), "grandchild {grandchild} survived cancel");
}

#[tokio::test]
async fn output_written_at_exit_is_kept() {
    for _ in 0..10 {
        let dir = TempDir::new().unwrap();
        let (sink, mut supervisor) = sh(&dir, "echo one; printf 'last words'", &[]);

        let outcome = supervisor.run(RunnerMode::Interactive).await.unwrap();

        assert_eq!(outcome.status, JobStatus::Successful);
        assert_eq!(sink.stdout(), ["one", "last words"]);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("job/stdout")).unwrap(),
            "one\nlast words\n"
        );
    }
}

#[tokio::test]
async fn spawn_failure_reports_not_found() {
    let dir = TempDir::new().unwrap();
    let sink = Arc::new(Collect::default());
    let mut supervisor = ProcessSupervisor::new(
        CommandRecord {
            command: vec!["/definitely/not/here".to_string()],
            ..Default::default()
        },
        ArtifactDir::new(dir.path().join("job")),
        sink.clone(),
        StatusNotifier::new("job"),
    );

    let outcome = supervisor.run(RunnerMode::Interactive).await.unwrap();

    assert_eq!(
        outcome,
        JobOutcome {
            status: JobStatus::Failed,
            rc: RC_NOT_FOUND
        }
    );
    let stdout = sink.stdout();
    assert_eq!(stdout.len(), 1);
    assert!(stdout[0].contains("/definitely/not/here"));
    assert!(dir.path().join("job/command").exists());
}

#[tokio::test]
async fn stderr_is_interleaved_in_interactive_mode() {
    let dir = TempDir::new().unwrap();
    let (sink, mut supervisor) = sh(&dir, "echo out; sleep 0.1; echo err >&2", &[]);

    supervisor.run(RunnerMode::Interactive).await.unwrap();

    assert_eq!(sink.stdout(), ["out", "err"]);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("job/stderr")).unwrap(),
        ""
    );
}

#[tokio::test]
async fn prompt_on_controlling_terminal_is_answered() {
    let dir = TempDir::new().unwrap();
    let (sink, supervisor) = sh(
        &dir,
        "[ -t 0 ] && echo stdin-is-tty; printf 'Password: ' >/dev/tty; read pw </dev/tty; echo \"got $pw\"",
        &[],
    );
    let mut supervisor = supervisor
        .prompts(vec![ExpectPrompt {
            pattern: "Password:".to_string(),
            response: "hunter2".to_string(),
        }])
        .job_timeout(Some(Duration::from_secs(10)));

    let outcome = supervisor.run(RunnerMode::Interactive).await.unwrap();

    assert_eq!(outcome.status, JobStatus::Successful);
    assert_eq!(sink.stdout(), ["stdin-is-tty", "Password: got hunter2"]);
}

#[tokio::test]
async fn cancel_kills_container() {
    let dir = TempDir::new().unwrap();
    let (container, log) = fake_engine(&dir);
    let (_sink, supervisor) = sh(&dir, "sleep 30", &[]);
    let mut supervisor = supervisor
        .container(Some(container))
        .cancel_callback(Box::new(|| Ok(true)));

    let outcome = supervisor.run(RunnerMode::Interactive).await.unwrap();

    assert_eq!(outcome.status, JobStatus::Canceled);
    assert_eq!(engine_calls(&log), "kill c1\n");
}

#[tokio::test]
async fn idle_timeout_kills_container() {
    let dir = TempDir::new().unwrap();
    let (container, log) = fake_engine(&dir);
    let (_sink, supervisor) = sh(&dir, "sleep 30", &[]);
    let mut supervisor = supervisor
        .container(Some(container))
        .idle_timeout(Some(Duration::from_millis(300)));

    let outcome = supervisor.run(RunnerMode::Interactive).await.unwrap();

    assert_eq!(outcome.status, JobStatus::Timeout);
    assert_eq!(engine_calls(&log), "kill c1\n");
}

#[tokio::test]
async fn subprocess_timeout_kills_container() {
    let dir = TempDir::new().unwrap();
    let (container, log) = fake_engine(&dir);
    let (_sink, supervisor) = sh(&dir, "sleep 30", &[]);
    let mut supervisor = supervisor
        .container(Some(container))
        .subprocess_timeout(Some(Duration::from_millis(300)));

    let outcome = supervisor.run(RunnerMode::Subprocess).await.unwrap();

    assert_eq!(outcome.status, JobStatus::Timeout);
    assert_eq!(engine_calls(&log), "kill c1\n");
}

#[tokio::test]
async fn ordinary_failure_leaves_container_alone() {
    for mode in [RunnerMode::Subprocess, RunnerMode::Interactive] {
        let dir = TempDir::new().unwrap();
        let (container, log) = fake_engine(&dir);
        let (_sink, supervisor) = sh(&dir, "exit 2", &[]);
        let mut supervisor = supervisor.container(Some(container));

        let outcome = supervisor.run(mode).await.unwrap();

        assert_eq!(
            outcome,
            JobOutcome {
                status: JobStatus::Failed,
                rc: 2
            }
        );
        assert_eq!(engine_calls(&log), "", "{mode:?}");
    }
}

#[tokio::test]
async fn subprocess_timeout_keeps_output_read_so_far() {
    let dir = TempDir::new().unwrap();
    let (sink, supervisor) = sh(&dir, "echo before; echo oops >&2; sleep 30", &[]);
    let mut supervisor = supervisor.subprocess_timeout(Some(Duration::from_millis(500)));

    let outcome = supervisor.run(RunnerMode::Subprocess).await.unwrap();

    assert_eq!(outcome.status, JobStatus::Timeout);
    assert_eq!(sink.stdout(), ["before", "oops"]);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("job/stdout")).unwrap(),
        "before\n"
    );
    assert_eq!(
        std::fs::read_to_string(dir.path().join("job/stderr")).unwrap(),
        "oops\n"
    );
}
