mod common;

use std::time::Duration;

use camsync::capture::synthetic::pattern_byte;
use camsync::{GroupManager, GroupSinks};
use common::{cameras, init_tracing, thread_settings, HEIGHT, WIDTH};

#[test]
fn two_cameras_deliver_every_cycle_in_order() {
    init_tracing();
    let mut settings = thread_settings();
    settings.max_cycles = Some(10);
    let (sinks, receivers) = GroupSinks::bounded(16, 16);

    let mut group = GroupManager::new(settings, sinks);
    group.start(cameras(&[0, 1])).unwrap();
    assert_eq!(group.active_camera_ids(), vec![0, 1]);
    assert!(group.wait_until_stopped(Some(Duration::from_secs(20))));

    for snapshot in group.trigger_snapshot() {
        assert!(snapshot.is_quiescent(), "{snapshot:?}");
        assert_eq!(snapshot.fault, None);
    }

    let outcome = group.close();
    assert!(outcome.is_clean(), "{outcome:?}");
    assert_eq!(outcome.cycles_completed, 10);
    assert_eq!(outcome.payloads_routed, 10);
    assert_eq!(group.close(), outcome);

    let payloads: Vec<_> = receivers.live_view.try_iter().collect();
    assert_eq!(payloads.len(), 10);
    let image_len = (WIDTH * HEIGHT * 3) as usize;
    for (cycle, payload) in payloads.iter().enumerate() {
        assert_eq!(payload.cycle_number, cycle as u64);
        assert_eq!(payload.camera_ids().collect::<Vec<_>>(), vec![0, 1]);
        for camera_id in [0, 1] {
            let frame = payload.get(camera_id).unwrap();
            let metadata = frame.metadata;
            assert_eq!(metadata.camera_id, camera_id as u64);
            assert_eq!(metadata.frame_number, cycle as u64);
            assert_eq!(frame.image.len(), image_len);
            assert!(metadata.pre_grab_ns <= metadata.post_grab_ns);
            assert!(metadata.post_grab_ns <= metadata.pre_retrieve_ns);
            assert!(metadata.copied_to_buffer_ns <= metadata.copied_from_buffer_ns);
            for index in [0, 1, image_len / 2, image_len - 1] {
                assert_eq!(
                    frame.image[index],
                    pattern_byte(camera_id, cycle as u64, index)
                );
            }
        }
    }
    // Nothing was recording
    assert!(receivers.recording.try_recv().is_err());
}

#[test]
fn single_camera_group_runs_to_its_limit() {
    init_tracing();
    let mut settings = thread_settings();
    settings.max_cycles = Some(3);
    let mut group = GroupManager::new(settings, GroupSinks::none());

    group.start(cameras(&[7])).unwrap();
    assert!(group.wait_until_stopped(Some(Duration::from_secs(20))));
    let outcome = group.close();
    assert!(outcome.is_clean(), "{outcome:?}");
    assert_eq!(outcome.cycles_completed, 3);
    assert!(group.frame_buffer_names().is_empty());
}

#[test]
fn start_rejects_groups_without_cameras() {
    let mut group = GroupManager::new(thread_settings(), GroupSinks::none());
    let mut off = common::camera(0);
    off.enabled = false;
    let configs = camsync::CameraConfigs::new([off]).unwrap();
    assert!(matches!(
        group.start(configs),
        Err(camsync::CaptureError::Config(camsync::ConfigError::NoEnabledCameras))
    ));
}

#[test]
fn kill_switch_stops_a_free_running_group() {
    init_tracing();
    let mut group = GroupManager::new(thread_settings(), GroupSinks::none());
    group.start(cameras(&[0, 1])).unwrap();
    group.wait_for_cycles(5, Duration::from_secs(10)).unwrap();

    group.kill_switch().trigger();
    assert!(group.wait_until_stopped(Some(Duration::from_secs(10))));
    let outcome = group.close();
    assert!(outcome.is_clean(), "{outcome:?}");
    assert!(outcome.cycles_completed >= 5);
}
