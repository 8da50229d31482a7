//! End-to-end tests driving `Runner` with real children that speak the
//! marker protocol.

use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use jobrunner::config::{RunnerConfig, RunnerMode};
use jobrunner::events::{Event, EventMarkerCodec, MissingPartialPolicy};
use jobrunner::job::{Runner, RunnerError};
use jobrunner::plugins::{PluginError, RunnerPlugin, StatusUpdate};
use jobrunner::supervisor::{JobStatus, RC_TIMEOUT};
use serde_json::{json, Value};
use tempfile::TempDir;

fn marker(payload: &Value) -> String {
    EventMarkerCodec::new().encode(payload).unwrap()
}

/// A config whose child prints `stream` verbatim.
fn printing(dir: &TempDir, stream: &str) -> RunnerConfig {
    RunnerConfig {
        ident: Some("job".to_string()),
        artifact_dir: dir.path().to_path_buf(),
        command: vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "printf '%s' \"$1\"".to_string(),
            "sh".to_string(),
            stream.to_string(),
        ],
        suppress_output: true,
        poll_interval_ms: 50,
        ..Default::default()
    }
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
    statuses: Mutex<Vec<JobStatus>>,
}

impl RunnerPlugin for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn event_handler(&self, event: &Event) -> Result<(), PluginError> {
        self.events.lock().unwrap().push(event.uuid.clone());
        Ok(())
    }

    fn status_handler(&self, update: &StatusUpdate) -> Result<(), PluginError> {
        self.statuses.lock().unwrap().push(update.status);
        Ok(())
    }
}

#[tokio::test]
async fn echo_hello_end_to_end() {
    let dir = TempDir::new().unwrap();
    let mut config = printing(&dir, "");
    config.command = vec!["echo".to_string(), "hello".to_string()];
    let runner = Runner::new(config).unwrap();
    let handle = runner.handle();

    let outcome = runner.run().await.unwrap();

    assert_eq!(outcome.status, JobStatus::Successful);
    assert_eq!(outcome.rc, 0);
    assert_eq!(handle.rc().unwrap(), 0);
    assert_eq!(handle.stdout().unwrap(), "hello\n");

    let events = handle.all_events().await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event, "verbose");
    assert_eq!(events[0].stdout, "hello");
    assert_eq!(events[0].extra.get("runner_ident"), Some(&json!("job")));
}

#[tokio::test]
async fn marker_events_from_child_are_persisted_in_order() {
    let dir = TempDir::new().unwrap();
    let stream = format!(
        "PLAY [all]\n{}TASK [ping]\n{}{}ok: [web1]\n{}",
        marker(&json!({"uuid": "task-1", "event": "playbook_on_task_start"})),
        marker(&json!({})),
        marker(&json!({"uuid": "ok-1", "event": "runner_on_ok"})),
        marker(&json!({})),
    );
    let recorder = Arc::new(Recorder::default());
    let runner = Runner::new(printing(&dir, &stream))
        .unwrap()
        .with_plugin(recorder.clone());
    let handle = runner.handle();

    runner.run().await.unwrap();

    let events = handle.all_events().await.unwrap();
    let summary: Vec<_> = events
        .iter()
        .map(|e| (e.counter, e.event.as_str(), e.stdout.as_str()))
        .collect();
    assert_eq!(
        summary,
        [
            (1, "verbose", "PLAY [all]"),
            (2, "playbook_on_task_start", "TASK [ping]"),
            (3, "runner_on_ok", "ok: [web1]"),
        ]
    );
    assert_eq!(recorder.events.lock().unwrap().len(), 3);
    assert_eq!(
        recorder.statuses.lock().unwrap().as_slice(),
        [JobStatus::Starting, JobStatus::Running, JobStatus::Successful]
    );
    assert_eq!(
        handle.stdout().unwrap(),
        "PLAY [all]\nTASK [ping]\nok: [web1]\n"
    );
}

#[tokio::test]
async fn duplicate_uuid_from_child_is_rewritten() {
    let dir = TempDir::new().unwrap();
    let stream = format!(
        "{}first\n{}{}second\n{}",
        marker(&json!({"uuid": "U", "event": "runner_on_ok"})),
        marker(&json!({})),
        marker(&json!({"uuid": "U", "event": "runner_on_ok"})),
        marker(&json!({})),
    );
    let runner = Runner::new(printing(&dir, &stream)).unwrap();
    let handle = runner.handle();

    runner.run().await.unwrap();

    let events = handle.all_events().await.unwrap();
    let uuids: Vec<_> = events.iter().map(|e| e.uuid.as_str()).collect();
    assert_eq!(uuids, ["U", "U_2"]);
    assert!(handle
        .artifact_dir()
        .join("job_events/2-U_2.json")
        .exists());
}

#[tokio::test]
async fn strict_missing_partial_fails_job() {
    let dir = TempDir::new().unwrap();
    let stream = format!(
        "{}ok\n{}",
        marker(&json!({"uuid": "U", "event": "runner_on_ok"})),
        marker(&json!({})),
    );
    let mut config = printing(&dir, &stream);
    config.missing_partial = MissingPartialPolicy::FailJob;
    let runner = Runner::new(config).unwrap();
    let handle = runner.handle();

    let outcome = runner.run().await.unwrap();

    assert_eq!(outcome.status, JobStatus::Failed);
    assert!(handle.all_events().await.unwrap().is_empty());
}

#[tokio::test]
async fn partial_written_by_child_is_merged() {
    let dir = TempDir::new().unwrap();
    let begin = marker(&json!({"uuid": "U"}));
    let end = marker(&json!({}));
    let script = r#"printf '%s' '{"event":"runner_on_ok","event_data":{"host":"web1"}}' > "$AWX_ISOLATED_DATA_DIR/job_events/U-partial.json"; printf '%s' "$1""#;
    let mut config = printing(&dir, &format!("{begin}ok: [web1]\n{end}"));
    config.command[2] = script.to_string();
    let runner = Runner::new(config).unwrap();
    let handle = runner.handle();

    runner.run().await.unwrap();

    let events = handle.host_events("web1").await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event, "runner_on_ok");
    assert_eq!(events[0].stdout, "ok: [web1]");
    assert!(!handle
        .artifact_dir()
        .join("job_events/U-partial.json")
        .exists());
}

#[tokio::test]
async fn events_stream_follows_running_job() {
    let dir = TempDir::new().unwrap();
    let mut config = printing(&dir, "");
    config.command = vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        "for i in 1 2 3; do echo line $i; sleep 0.1; done".to_string(),
    ];
    let runner = Runner::new(config).unwrap();
    let handle = runner.handle();

    let reader = handle.clone();
    let consumer = tokio::spawn(async move {
        let stream = reader.events();
        futures_util::pin_mut!(stream);
        let mut seen = Vec::new();
        while let Some(event) = stream.next().await {
            seen.push(event.unwrap().stdout);
        }
        seen
    });

    let outcome = runner.run().await.unwrap();
    assert_eq!(outcome.status, JobStatus::Successful);
    assert_eq!(consumer.await.unwrap(), ["line 1", "line 2", "line 3"]);
    assert_eq!(handle.wait().await, JobStatus::Successful);
}

#[tokio::test]
async fn cancel_callback_error_is_raised() {
    let dir = TempDir::new().unwrap();
    let mut config = printing(&dir, "");
    config.command = vec!["sleep".to_string(), "30".to_string()];
    let runner = Runner::new(config)
        .unwrap()
        .with_cancel_callback(Box::new(|| Err("control plane unreachable".into())));
    let handle = runner.handle();

    let err = runner.run().await.unwrap_err();

    assert!(matches!(err, RunnerError::Supervisor(_)));
    assert!(err.is_callback());
    assert_eq!(handle.status(), JobStatus::Failed);
}

#[tokio::test]
async fn subprocess_mode_times_out() {
    let dir = TempDir::new().unwrap();
    let mut config = printing(&dir, "");
    config.command = vec!["sleep".to_string(), "30".to_string()];
    config.mode = RunnerMode::Subprocess;
    config.subprocess_timeout = Some(0.3);
    let runner = Runner::new(config).unwrap();
    let handle = runner.handle();

    let outcome = runner.run().await.unwrap();

    assert_eq!(outcome.status, JobStatus::Timeout);
    assert_eq!(handle.rc().unwrap(), RC_TIMEOUT);
    assert_eq!(handle.stderr().unwrap(), "");
}
