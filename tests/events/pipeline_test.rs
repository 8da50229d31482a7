//! Scanner, partial store and persister working together on a real directory.

use std::sync::Arc;

use jobrunner::artifacts::ArtifactDir;
use jobrunner::events::{
    Event, EventDirReader, EventMarkerCodec, EventPersister, PartialEventStore,
    StreamEventScanner,
};
use serde_json::{json, Value};
use tempfile::TempDir;

fn marker(payload: &Value) -> String {
    EventMarkerCodec::new().encode(payload).unwrap()
}

struct Pipeline {
    _dir: TempDir,
    artifacts: ArtifactDir,
    partials: PartialEventStore,
    scanner: StreamEventScanner<Arc<EventPersister>>,
}

fn pipeline() -> Pipeline {
    let dir = TempDir::new().unwrap();
    let artifacts = ArtifactDir::new(dir.path().join("job"));
    artifacts.prepare().unwrap();
    let persister = Arc::new(EventPersister::new(artifacts.root(), "job"));
    Pipeline {
        partials: PartialEventStore::new(artifacts.root()),
        scanner: StreamEventScanner::new(persister),
        artifacts,
        _dir: dir,
    }
}

async fn persisted(artifacts: &ArtifactDir) -> Vec<Event> {
    EventDirReader::new(artifacts.events_dir())
        .read_new_events()
        .await
        .unwrap()
}

#[tokio::test]
async fn partial_written_before_stream_event_is_merged() {
    let mut p = pipeline();
    p.partials
        .set("U", &json!({"uuid": "U", "event": "runner_on_ok", "event_data": {"k": 1}}))
        .unwrap();

    p.scanner
        .write(&format!("{}hello\n{}", marker(&json!({"uuid": "U"})), marker(&json!({}))));
    p.scanner.close();

    let events = persisted(&p.artifacts).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].stdout, "hello");
    assert_eq!(events[0].event, "runner_on_ok");
    assert_eq!(events[0].event_data, Some(json!({"k": 1})));
    assert!(!p.partials.path_for("U").exists());
}

#[tokio::test]
async fn partial_written_while_event_is_open_is_merged() {
    let mut p = pipeline();
    p.scanner
        .write(&format!("{}hello\n", marker(&json!({"uuid": "U"}))));
    p.partials
        .set("U", &json!({"uuid": "U", "event_data": {"k": 1}}))
        .unwrap();
    p.scanner.write(&marker(&json!({})));
    p.scanner.close();

    let events = persisted(&p.artifacts).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].stdout, "hello");
    assert_eq!(events[0].event_data, Some(json!({"k": 1})));
}

#[tokio::test]
async fn missing_partial_still_persists() {
    let mut p = pipeline();
    p.scanner
        .write(&format!("{}hello\n{}", marker(&json!({"uuid": "U"})), marker(&json!({}))));
    p.scanner.close();

    let events = persisted(&p.artifacts).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].uuid, "U");
    assert_eq!(events[0].event_data, None);
    assert!(events[0].created.is_some());
}

#[tokio::test]
async fn duplicate_uuids_persist_as_distinct_events() {
    let mut p = pipeline();
    for (uuid, text) in [("U", "first"), ("U", "second")] {
        p.partials
            .set(uuid, &json!({"event": "runner_on_ok", "event_data": {"text": text}}))
            .unwrap();
        p.scanner.write(&format!(
            "{}{text}\n{}",
            marker(&json!({"uuid": uuid})),
            marker(&json!({}))
        ));
    }
    p.scanner.close();

    let events = persisted(&p.artifacts).await;
    let uuids: Vec<_> = events.iter().map(|e| e.uuid.as_str()).collect();
    assert_eq!(uuids, ["U", "U_2"]);
    assert_eq!(events[1].stdout, "second");
    assert_eq!(events[1].event, "runner_on_ok");
}

#[tokio::test]
async fn counters_on_disk_are_gap_free() {
    let mut p = pipeline();
    let mut stream = String::from("preamble\n");
    for i in 0..5 {
        stream.push_str(&marker(&json!({"uuid": format!("E{i}")})));
        stream.push_str(&format!("task {i}\nmore output\n"));
        stream.push_str(&marker(&json!({})));
        stream.push_str("between\n");
    }
    for chunk in stream.as_bytes().chunks(7) {
        p.scanner.write(std::str::from_utf8(chunk).unwrap());
    }
    p.scanner.close();

    let events = persisted(&p.artifacts).await;
    let counters: Vec<u64> = events.iter().map(|e| e.counter).collect();
    let expected: Vec<u64> = (1..=u64::try_from(events.len()).unwrap()).collect();
    assert_eq!(counters, expected);
    assert_eq!(events.iter().filter(|e| e.uuid.starts_with('E')).count(), 5);
    assert!(events
        .iter()
        .all(|e| e.extra.get("runner_ident") == Some(&json!("job"))));
}
