//! Event pipeline tests.

mod pipeline_test;

/// Verify the public event types are exported from the library.
#[test]
fn test_all_event_types_exported() {
    use jobrunner::events::{
        DecodeError, Event, EventCounter, EventDataPolicy, EventDirReader, EventError,
        EventMarkerCodec, EventPersister, MissingPartialPolicy, PartialEventStore, Stats,
        StreamEventScanner, ERASE_LINE,
    };

    let _ = EventMarkerCodec::new();
    let _ = EventCounter::new();
    let _ = EventDataPolicy::default();
    let _ = MissingPartialPolicy::default();
    let _ = Stats::default();
    let _ = PartialEventStore::new("/tmp");
    let _ = EventPersister::new("/tmp", "ident");
    let _ = EventDirReader::new("/tmp");
    let _ = StreamEventScanner::new(std::sync::Arc::new(EventPersister::new("/tmp", "x")));
    let _: fn() -> EventError = || EventError::DirectoryMissing("/tmp".into());
    let _: fn() -> DecodeError = || DecodeError::NotAnObject;
    assert!(Event::eof().is_eof());
    assert_eq!(ERASE_LINE, "\x1b[K");
}
