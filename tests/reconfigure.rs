mod common;

use std::sync::Arc;
use std::time::Duration;

use camsync::capture::CameraConfigs;
use camsync::{GroupManager, GroupSinks, UpdateMode};
use common::{camera, cameras, init_tracing, thread_settings, SharedTracking, TrackingFactory};

const CYCLE_WAIT: Duration = Duration::from_secs(10);

fn tracked_group(factory: &Arc<TrackingFactory>) -> GroupManager {
    GroupManager::with_device_factory(
        thread_settings(),
        GroupSinks::none(),
        Arc::new(SharedTracking(factory.clone())),
    )
}

#[test]
fn swapping_cameras_rebuilds_the_group() {
    init_tracing();
    let factory = Arc::new(TrackingFactory::default());
    let mut group = tracked_group(&factory);
    group.start(cameras(&[0, 1])).unwrap();
    group.wait_for_cycles(3, CYCLE_WAIT).unwrap();
    let before = group.cycles_completed();

    let report = group.update_configs(cameras(&[1, 2])).unwrap();
    assert_eq!(report.mode, UpdateMode::FullReset { fallback: false });
    assert_eq!(report.diff.to_close, vec![0]);
    assert_eq!(report.diff.to_create, vec![2]);
    assert_eq!(group.active_camera_ids(), vec![1, 2]);

    group.wait_for_cycles(before + 3, CYCLE_WAIT).unwrap();
    let outcome = group.close();
    assert!(outcome.is_clean(), "{outcome:?}");
    assert!(outcome.cycles_completed >= before + 3);
    // Two devices per session
    assert_eq!(factory.opened.load(std::sync::atomic::Ordering::SeqCst), 4);
}

#[test]
fn exposure_change_applies_in_place() {
    init_tracing();
    let factory = Arc::new(TrackingFactory::default());
    let mut group = tracked_group(&factory);
    group.start(cameras(&[0, 1])).unwrap();
    group.wait_for_cycles(3, CYCLE_WAIT).unwrap();
    let names = group.frame_buffer_names();

    let updated = CameraConfigs::new([camera(0).with_exposure(-5), camera(1)]).unwrap();
    let report = group.update_configs(updated).unwrap();
    assert_eq!(report.mode, UpdateMode::InPlace);
    assert_eq!(report.diff.changed, vec![0]);

    // Same shared memory, same devices
    assert_eq!(group.frame_buffer_names(), names);
    assert_eq!(factory.opened.load(std::sync::atomic::Ordering::SeqCst), 2);
    let applied = factory.applied_for(0);
    assert_eq!(applied.len(), 2);
    assert_eq!(applied[0].exposure, -7);
    assert_eq!(applied[1].exposure, -5);
    assert_eq!(factory.applied_for(1).len(), 1);
    assert_eq!(group.configs().get(0).unwrap().exposure, -5);

    let resumed_from = group.cycles_completed();
    group.wait_for_cycles(resumed_from + 3, CYCLE_WAIT).unwrap();
    assert!(group.close().is_clean());
}

#[test]
fn removing_a_camera_closes_only_that_worker() {
    init_tracing();
    let factory = Arc::new(TrackingFactory::default());
    let (sinks, receivers) = GroupSinks::bounded(4, 256);
    let mut group = GroupManager::with_device_factory(
        thread_settings(),
        GroupSinks {
            recording: None,
            ..sinks
        },
        Arc::new(SharedTracking(factory.clone())),
    );
    group.start(cameras(&[0, 1, 2])).unwrap();
    group.wait_for_cycles(3, CYCLE_WAIT).unwrap();

    let report = group.update_configs(cameras(&[0, 2])).unwrap();
    assert_eq!(report.mode, UpdateMode::InPlace);
    assert_eq!(report.diff.to_close, vec![1]);
    assert_eq!(group.active_camera_ids(), vec![0, 2]);
    assert!(!group.frame_buffer_names().contains_key(&1));

    // Skip what was routed before the removal
    let _ = receivers.live_view.drain().count();
    let resumed_from = group.cycles_completed();
    group.wait_for_cycles(resumed_from + 3, CYCLE_WAIT).unwrap();
    let outcome = group.close();
    assert!(outcome.is_clean(), "{outcome:?}");
    assert_eq!(factory.opened.load(std::sync::atomic::Ordering::SeqCst), 3);

    let after: Vec<_> = receivers.live_view.try_iter().collect();
    assert!(after.len() >= 3);
    for payload in after {
        assert_eq!(payload.camera_ids().collect::<Vec<_>>(), vec![0, 2]);
    }
}

#[test]
fn rejected_update_falls_back_to_full_reset() {
    init_tracing();
    let factory = Arc::new(TrackingFactory::rejecting_updates());
    let mut group = tracked_group(&factory);
    group.start(cameras(&[0, 1])).unwrap();
    group.wait_for_cycles(2, CYCLE_WAIT).unwrap();

    let updated = CameraConfigs::new([camera(0), camera(1).with_exposure(-4)]).unwrap();
    let report = group.update_configs(updated).unwrap();
    assert_eq!(report.mode, UpdateMode::FullReset { fallback: true });
    assert_eq!(report.diff.changed, vec![1]);
    assert_eq!(group.configs().get(1).unwrap().exposure, -4);

    // The rebuilt group opened fresh devices with the new exposure at startup
    let applied = factory.applied_for(1);
    assert_eq!(applied.last().unwrap().exposure, -4);

    let resumed_from = group.cycles_completed();
    group.wait_for_cycles(resumed_from + 2, CYCLE_WAIT).unwrap();
    assert!(group.close().is_clean());
}

#[test]
fn back_to_back_in_place_updates_each_pause_the_group() {
    init_tracing();
    let factory = Arc::new(TrackingFactory::default());
    let mut group = tracked_group(&factory);
    group.start(cameras(&[0, 1])).unwrap();
    group.wait_for_cycles(2, CYCLE_WAIT).unwrap();

    for exposure in [-5, -3, -6] {
        let updated = CameraConfigs::new([camera(0).with_exposure(exposure), camera(1)]).unwrap();
        let report = group.update_configs(updated).unwrap();
        assert_eq!(report.mode, UpdateMode::InPlace);
    }
    let exposures: Vec<i32> = factory.applied_for(0).iter().map(|c| c.exposure).collect();
    assert_eq!(exposures, vec![-7, -5, -3, -6]);
    assert_eq!(factory.opened.load(std::sync::atomic::Ordering::SeqCst), 2);

    let resumed_from = group.cycles_completed();
    group.wait_for_cycles(resumed_from + 3, CYCLE_WAIT).unwrap();
    let outcome = group.close();
    assert!(outcome.is_clean(), "{outcome:?}");
}

#[test]
fn updates_before_start_are_stored() {
    let mut group = GroupManager::new(thread_settings(), GroupSinks::none());
    let report = group.update_configs(cameras(&[3])).unwrap();
    assert_eq!(report.mode, UpdateMode::Stored);
    assert_eq!(group.configs().enabled_ids(), vec![3]);
}
