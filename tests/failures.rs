mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use camsync::capture::DeviceSource;
use camsync::{CameraConfigs, CaptureError, FailureKind, GroupManager, GroupSinks, RecordingMessage};
use common::{camera, cameras, init_tracing, thread_settings, Fault, FaultyFactory};

const CYCLE_WAIT: Duration = Duration::from_secs(10);

fn faulty_group(fault: Fault, trigger_timeout_ms: u64) -> GroupManager {
    let mut settings = thread_settings();
    settings.trigger_timeout_ms = trigger_timeout_ms;
    GroupManager::with_device_factory(
        settings,
        GroupSinks::none(),
        Arc::new(FaultyFactory {
            camera_id: 1,
            at_frame: 3,
            fault,
        }),
    )
}

#[test]
fn stalled_grab_times_out_naming_the_camera() {
    init_tracing();
    let mut group = faulty_group(Fault::Hang(Duration::from_millis(2_500)), 1_000);
    group.start(cameras(&[0, 1])).unwrap();
    assert!(group.wait_until_stopped(Some(CYCLE_WAIT)));

    let outcome = group.close();
    let failure = outcome.failure.expect("group should have failed");
    assert_eq!(failure.kind, FailureKind::Timeout);
    assert_eq!(failure.camera_id, Some(1));
    assert_eq!(outcome.cycles_completed, 3);
}

#[test]
fn device_error_stops_the_group() {
    init_tracing();
    let mut group = faulty_group(Fault::GrabError, 2_000);
    group.start(cameras(&[0, 1])).unwrap();
    assert!(group.wait_until_stopped(Some(CYCLE_WAIT)));

    let outcome = group.close();
    let failure = outcome.failure.expect("group should have failed");
    assert_eq!(failure.kind, FailureKind::Device);
    assert_eq!(failure.camera_id, Some(1));
    assert!(failure.message.contains("sensor disconnected"), "{}", failure.message);
    assert_eq!(outcome.cycles_completed, 3);
}

#[test]
fn device_that_cannot_open_fails_startup() {
    init_tracing();
    let mut group = GroupManager::new(thread_settings(), GroupSinks::none());
    let broken = camera(1).with_source(DeviceSource::V4l2 {
        path: "/dev/camsync-missing".into(),
    });
    let configs = CameraConfigs::new([camera(0), broken]).unwrap();

    match group.start(configs) {
        Err(CaptureError::GroupFailed(failure)) => {
            assert_eq!(failure.kind, FailureKind::Device);
            assert_eq!(failure.camera_id, Some(1));
        }
        other => panic!("expected a startup failure, got {other:?}"),
    }
    assert!(!group.is_running());
}

#[test]
fn recording_window_ends_with_one_finalize() {
    init_tracing();
    let (sinks, receivers) = GroupSinks::bounded(8, 1);
    let mut group = GroupManager::new(thread_settings(), sinks);
    group.start(cameras(&[0, 1])).unwrap();

    let recording = receivers.recording.clone();
    let consumer = thread::spawn(move || {
        let mut messages = Vec::new();
        while let Ok(message) = recording.recv_timeout(CYCLE_WAIT) {
            let done = matches!(message, RecordingMessage::Finalize);
            messages.push(message);
            if done {
                break;
            }
        }
        messages
    });

    group.start_recording();
    assert!(group.is_recording());
    let from = group.cycles_completed();
    group.wait_for_cycles(from + 5, CYCLE_WAIT).unwrap();
    group.stop_recording();
    let from = group.cycles_completed();
    group.wait_for_cycles(from + 3, CYCLE_WAIT).unwrap();

    let outcome = group.close();
    assert!(outcome.is_clean(), "{outcome:?}");
    assert!(!outcome.recording_failed);

    let messages = consumer.join().unwrap();
    assert!(matches!(messages.last(), Some(RecordingMessage::Finalize)));
    let payloads: Vec<u64> = messages
        .iter()
        .filter_map(|message| match message {
            RecordingMessage::Payload(payload) => Some(payload.cycle_number),
            RecordingMessage::Finalize => None,
        })
        .collect();
    assert!(payloads.len() >= 5);
    assert!(payloads.windows(2).all(|pair| pair[1] == pair[0] + 1));
    // Nothing after the finalize, not even on shutdown
    assert_eq!(receivers.recording.try_iter().count(), 0);
}

#[test]
fn lost_recording_sink_marks_recording_failed_but_capture_continues() {
    init_tracing();
    let (sinks, receivers) = GroupSinks::bounded(8, 1);
    drop(receivers.recording);
    let mut group = GroupManager::new(thread_settings(), sinks);
    group.start(cameras(&[0])).unwrap();

    group.start_recording();
    let from = group.cycles_completed();
    group.wait_for_cycles(from + 5, CYCLE_WAIT).unwrap();
    assert!(group.recording_failed());
    assert!(!group.is_recording());
    assert!(group.is_running());

    let outcome = group.close();
    assert!(outcome.is_clean(), "{outcome:?}");
    assert!(outcome.recording_failed);
}

#[test]
fn slow_recorder_still_receives_the_last_cycle() {
    init_tracing();
    let mut settings = thread_settings();
    settings.max_cycles = Some(2);
    let (sinks, receivers) = GroupSinks::bounded(1, 1);
    let mut group = GroupManager::new(settings, sinks);
    group.start_recording();

    let recording = receivers.recording.clone();
    let consumer = thread::spawn(move || {
        // Start late so the last payload is still queued when the group stops
        thread::sleep(Duration::from_millis(200));
        let mut messages = Vec::new();
        while let Ok(message) = recording.recv_timeout(CYCLE_WAIT) {
            let done = matches!(message, RecordingMessage::Finalize);
            messages.push(message);
            if done {
                break;
            }
        }
        messages
    });

    group.start(cameras(&[0, 1])).unwrap();
    assert!(group.wait_until_stopped(Some(CYCLE_WAIT)));
    let outcome = group.close();
    assert!(outcome.is_clean(), "{outcome:?}");
    assert!(!outcome.recording_failed);
    assert_eq!(outcome.payloads_routed, 2);

    let recorded: Vec<Option<u64>> = consumer
        .join()
        .unwrap()
        .iter()
        .map(|message| match message {
            RecordingMessage::Payload(payload) => Some(payload.cycle_number),
            RecordingMessage::Finalize => None,
        })
        .collect();
    assert_eq!(recorded, vec![Some(0), Some(1), None]);
}

#[test]
fn stalled_recorder_on_shutdown_marks_recording_failed() {
    init_tracing();
    let mut settings = thread_settings();
    settings.max_cycles = Some(2);
    let (sinks, receivers) = GroupSinks::bounded(1, 1);
    let mut group = GroupManager::new(settings, sinks);
    group.start_recording();

    group.start(cameras(&[0])).unwrap();
    assert!(group.wait_until_stopped(Some(CYCLE_WAIT)));
    let outcome = group.close();
    assert!(outcome.is_clean(), "{outcome:?}");
    assert!(outcome.recording_failed);
    // Only the payload that fit in the queue was delivered
    assert_eq!(receivers.recording.try_iter().count(), 1);
}
