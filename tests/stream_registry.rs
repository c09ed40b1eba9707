//! P2: a stream reaches exactly one terminal event. P3: registration
//! respects the active-stream cap.

use engine_core::stream_registry::{StreamEvent, StreamRegistry, StreamRegistryConfig, StreamStatus};
use engine_core::time::MockClock;
use engine_core::StreamId;
use std::sync::Arc;
use std::time::Duration;

fn registry() -> StreamRegistry {
    StreamRegistry::new(
        StreamRegistryConfig {
            backpressure_threshold: 4,
            stream_timeout: Duration::from_secs(60),
        },
        Arc::new(MockClock::new()),
    )
}

#[test]
fn registration_respects_the_active_cap() {
    let registry = registry();
    let _a = registry.register(StreamId::new(), "tenant-a", 2).unwrap();
    let _b = registry.register(StreamId::new(), "tenant-a", 2).unwrap();
    let rejected = registry.register(StreamId::new(), "tenant-a", 2);
    assert!(rejected.is_err());
    assert_eq!(registry.active_count(), 2);
}

#[test]
fn completion_is_terminal_exactly_once() {
    let registry = registry();
    let stream_id = StreamId::new();
    let _handle = registry.register(stream_id, "tenant-a", 4).unwrap();

    registry.on_completed(stream_id);
    assert_eq!(registry.active_count(), 0);
    assert_eq!(registry.status(stream_id), Some(StreamStatus::Completed));

    // a second terminal event must not double-decrement active_count or
    // change the recorded status
    registry.on_error(stream_id, "late error".to_string());
    assert_eq!(registry.active_count(), 0);
    assert_eq!(registry.status(stream_id), Some(StreamStatus::Completed));
}

#[test]
fn cancel_all_terminates_every_active_stream_and_spares_finished_ones() {
    let registry = registry();
    let already_done = StreamId::new();
    registry.register(already_done, "tenant-a", 4).unwrap();
    registry.on_completed(already_done);

    let still_running = StreamId::new();
    registry.register(still_running, "tenant-a", 4).unwrap();

    registry.cancel_all();

    assert_eq!(registry.status(already_done), Some(StreamStatus::Completed));
    assert_eq!(registry.status(still_running), Some(StreamStatus::Cancelled));
    assert_eq!(registry.active_count(), 0);
}

#[test]
fn cancel_delivers_a_terminal_event_to_the_consumer() {
    let registry = registry();
    let stream_id = StreamId::new();
    let mut handle = registry.register(stream_id, "tenant-a", 4).unwrap();

    registry.cancel(stream_id);

    assert_eq!(registry.status(stream_id), Some(StreamStatus::Cancelled));
    let event = handle.receiver.try_recv().expect("consumer must receive a terminal event");
    assert!(matches!(event, StreamEvent::Error { .. }));

    // a second cancel on an already-terminal stream must not send again
    registry.cancel(stream_id);
    assert!(handle.receiver.try_recv().is_err());
}

#[test]
fn time_to_first_token_is_recorded_on_first_chunk_only() {
    let clock = Arc::new(MockClock::new());
    let registry = StreamRegistry::new(
        StreamRegistryConfig {
            backpressure_threshold: 4,
            stream_timeout: Duration::from_secs(60),
        },
        clock.clone(),
    );
    let stream_id = StreamId::new();
    registry.register(stream_id, "tenant-a", 4).unwrap();

    clock.advance(Duration::from_millis(42));
    registry.on_chunk(stream_id, "hello".to_string(), None);
    clock.advance(Duration::from_millis(100));
    registry.on_chunk(stream_id, "world".to_string(), None);

    let ttft = registry.time_to_first_token(stream_id).unwrap();
    assert_eq!(ttft, Duration::from_millis(42));

    let average = registry.take_average_ttft_ms().unwrap();
    assert!((average - 42.0).abs() < 0.001);
    assert!(registry.take_average_ttft_ms().is_none());
}

#[test]
fn acknowledge_chunk_releases_backpressure_credit() {
    let registry = registry();
    let stream_id = StreamId::new();
    registry.register(stream_id, "tenant-a", 4).unwrap();

    registry.on_chunk(stream_id, "a".to_string(), None);
    registry.on_chunk(stream_id, "b".to_string(), None);
    assert_eq!(registry.unacked(stream_id), 2);

    registry.acknowledge_chunk(stream_id);
    assert_eq!(registry.unacked(stream_id), 1);
}
