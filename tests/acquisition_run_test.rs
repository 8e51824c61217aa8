//! End-to-end runs of the acquisition worker against simulated hardware.

use magnetometer_daq::acquisition::{
    validate, AcquisitionSequence, AcquisitionWorker, DeviceLimits, SequenceParams, Waypoint,
    WorkerConfig,
};
use magnetometer_daq::core::{DeviceKind, StateEvent, WorkerState};
use magnetometer_daq::error::{DeviceError, RunFault};
use magnetometer_daq::hardware::mock::{
    DeviceCall, FaultPlan, SimulatedCamera, SimulatedRig, SimulatedStage, SimulatedTrigger,
};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

fn test_config() -> WorkerConfig {
    WorkerConfig {
        camera_guard: Duration::from_millis(20),
        trigger_timeout: Duration::from_millis(50),
        open_timeout: Duration::from_millis(200),
        close_timeout: Duration::from_millis(100),
        ..WorkerConfig::default()
    }
}

fn sequence(count: u32, interval_ms: u64, waypoints: Vec<Waypoint>) -> AcquisitionSequence {
    let params = SequenceParams {
        trigger_count: count,
        trigger_interval: Duration::from_millis(interval_ms),
        pulse_width: Duration::from_micros(5),
        exposure: Duration::from_millis(2),
        width: 32,
        height: 32,
        waypoints,
        late_trigger_tolerance: Duration::from_millis(50),
        ..SequenceParams::default()
    };
    validate(&params, &DeviceLimits::default()).unwrap()
}

fn fast_stage_rig() -> SimulatedRig {
    SimulatedRig::from_devices(
        SimulatedTrigger::new(),
        SimulatedCamera::default(),
        SimulatedStage::new().with_speed(100_000.0),
    )
}

/// Collect states until the worker reports `Idle`.
async fn states_until_idle(mut events: broadcast::Receiver<StateEvent>) -> Vec<WorkerState> {
    let mut states = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("worker never returned to Idle")
            .expect("event stream closed");
        states.push(event.state);
        if event.state == WorkerState::Idle {
            return states;
        }
    }
}

async fn wait_for_state(worker: &AcquisitionWorker, target: WorkerState) {
    let mut state = worker.watch_state();
    tokio::time::timeout(Duration::from_secs(2), state.wait_for(|s| *s == target))
        .await
        .expect("state not reached")
        .expect("worker dropped");
}

#[tokio::test]
async fn test_five_triggers_five_frames() {
    let rig = SimulatedRig::new();
    let counter = rig.counter();
    let mut worker = AcquisitionWorker::new(rig.into_device_set(), test_config());
    let events = worker.subscribe();

    let run_id = worker.start(sequence(5, 20, Vec::new())).unwrap();
    let states = states_until_idle(events).await;
    let summary = worker.join().await.unwrap();

    assert_eq!(
        states,
        vec![
            WorkerState::Arming,
            WorkerState::Running,
            WorkerState::Stopping,
            WorkerState::Idle
        ]
    );
    assert_eq!(summary.transitions, states);
    assert_eq!(summary.run_id, run_id);
    assert_eq!(summary.frames_captured, 5);
    assert_eq!(summary.dropped_frames, 0);
    assert!(summary.is_complete());

    let frames = worker.channel().drain();
    let indices: Vec<u32> = frames.iter().map(|f| f.index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    assert!(frames.iter().all(|f| f.run_id == run_id));
    assert!(frames.iter().all(|f| f.image.pixel_count() == 32 * 32));
    assert_eq!(counter.open_count(), 0);
}

#[tokio::test]
async fn test_triggers_follow_the_schedule() {
    let mut worker = AcquisitionWorker::new(SimulatedRig::new().into_device_set(), test_config());

    let started = Instant::now();
    worker.start(sequence(5, 20, Vec::new())).unwrap();
    let summary = worker.join().await.unwrap();

    // Last trigger is scheduled at 4 x 20 ms
    assert!(started.elapsed() >= Duration::from_millis(80));
    assert!(summary.elapsed >= Duration::from_millis(80));
}

#[tokio::test]
async fn test_camera_timeouts_fault_the_run() {
    let rig = SimulatedRig::new().camera_faults(FaultPlan::hang_always());
    let counter = rig.counter();
    let mut worker = AcquisitionWorker::new(rig.into_device_set(), test_config());
    let events = worker.subscribe();

    worker.start(sequence(5, 20, Vec::new())).unwrap();
    let states = states_until_idle(events).await;
    let summary = worker.join().await.unwrap();

    assert_eq!(
        states,
        vec![
            WorkerState::Arming,
            WorkerState::Running,
            WorkerState::Faulted,
            WorkerState::Idle
        ]
    );
    let fault = summary.fault.clone().unwrap();
    assert!(fault.is_timeout(), "unexpected fault: {fault}");
    assert!(matches!(
        fault,
        RunFault::Device(DeviceError::Timeout {
            device: DeviceKind::Camera,
            ..
        })
    ));
    assert_eq!(summary.dropped_frames, 3);
    assert!(summary.frames_captured < 5);
    assert!(worker.channel().is_empty());
    assert_eq!(counter.open_count(), 0);
    assert_eq!(worker.status(), WorkerState::Idle);
}

#[tokio::test]
async fn test_isolated_timeout_drops_one_frame() {
    let rig = SimulatedRig::new().camera_faults(FaultPlan::hang_on([1]));
    let mut worker = AcquisitionWorker::new(rig.into_device_set(), test_config());

    worker.start(sequence(5, 20, Vec::new())).unwrap();
    let summary = worker.join().await.unwrap();

    assert!(summary.fault.is_none());
    assert_eq!(summary.frames_captured, 4);
    assert_eq!(summary.dropped_frames, 1);
    let indices: Vec<u32> = worker.channel().drain().iter().map(|f| f.index).collect();
    assert_eq!(indices, vec![0, 2, 3, 4]);
}

#[tokio::test]
async fn test_trigger_timeouts_count_as_dropped_frames() {
    let rig = SimulatedRig::new().trigger_faults(FaultPlan::hang_always());
    let counter = rig.counter();
    let log = rig.call_log();
    let mut worker = AcquisitionWorker::new(rig.into_device_set(), test_config());

    worker.start(sequence(5, 20, Vec::new())).unwrap();
    let summary = worker.join().await.unwrap();

    assert!(matches!(
        summary.fault,
        Some(RunFault::Device(DeviceError::Timeout {
            device: DeviceKind::Trigger,
            ..
        }))
    ));
    assert_eq!(summary.dropped_frames, 3);
    assert_eq!(summary.frames_captured, 0);
    // No pulse, no frame read
    assert_eq!(log.executions(DeviceKind::Camera), 0);
    assert_eq!(counter.open_count(), 0);
}

#[tokio::test]
async fn test_timeouts_below_threshold_complete_the_run() {
    // Two back-to-back drops stay under the default threshold of three
    let rig = SimulatedRig::new().trigger_faults(FaultPlan::hang_on([1, 2]));
    let mut worker = AcquisitionWorker::new(rig.into_device_set(), test_config());

    worker.start(sequence(5, 20, Vec::new())).unwrap();
    let summary = worker.join().await.unwrap();

    assert!(summary.fault.is_none(), "{summary:?}");
    assert_eq!(summary.dropped_frames, 2);
    assert_eq!(summary.frames_captured, 3);
    assert!(!summary.is_complete());
    let indices: Vec<u32> = worker.channel().drain().iter().map(|f| f.index).collect();
    assert_eq!(indices, vec![0, 3, 4]);
}

#[tokio::test]
async fn test_trigger_and_camera_timeouts_share_the_count() {
    // Trigger call 1 (index 1) hangs, then camera call 1 (index 2) hangs
    let rig = SimulatedRig::new()
        .trigger_faults(FaultPlan::hang_on([1]))
        .camera_faults(FaultPlan::hang_on([1]));
    let counter = rig.counter();
    let config = WorkerConfig {
        max_consecutive_timeouts: 2,
        ..test_config()
    };
    let mut worker = AcquisitionWorker::new(rig.into_device_set(), config);

    worker.start(sequence(5, 20, Vec::new())).unwrap();
    let summary = worker.join().await.unwrap();

    assert!(matches!(
        summary.fault,
        Some(RunFault::Device(DeviceError::Timeout {
            device: DeviceKind::Camera,
            ..
        }))
    ));
    assert_eq!(summary.dropped_frames, 2);
    assert_eq!(summary.frames_captured, 1);
    let indices: Vec<u32> = worker.channel().drain().iter().map(|f| f.index).collect();
    assert_eq!(indices, vec![0]);
    assert_eq!(counter.open_count(), 0);
}

#[tokio::test]
async fn test_worker_is_reusable_after_fault() {
    let rig = SimulatedRig::new().trigger_faults(FaultPlan::fault_on(2));
    let counter = rig.counter();
    let mut worker = AcquisitionWorker::new(rig.into_device_set(), test_config());

    worker.start(sequence(5, 10, Vec::new())).unwrap();
    let faulted = worker.join().await.unwrap();
    assert!(matches!(
        faulted.fault,
        Some(RunFault::Device(DeviceError::Fault {
            device: DeviceKind::Trigger,
            ..
        }))
    ));
    assert_eq!(faulted.frames_captured, 2);
    assert_eq!(counter.open_count(), 0);

    // Trigger call numbering restarts when the device is reopened
    worker.start(sequence(2, 10, Vec::new())).unwrap();
    let retried = worker.join().await.unwrap();
    assert!(retried.is_complete(), "{retried:?}");
    assert_ne!(retried.run_id, faulted.run_id);
}

#[tokio::test]
async fn test_busy_device_faults_during_arming() {
    let rig = SimulatedRig::new().trigger_faults(FaultPlan::busy());
    let counter = rig.counter();
    let log = rig.call_log();
    let mut worker = AcquisitionWorker::new(rig.into_device_set(), test_config());

    worker.start(sequence(3, 10, Vec::new())).unwrap();
    let summary = worker.join().await.unwrap();

    assert_eq!(
        summary.fault,
        Some(RunFault::Device(DeviceError::Busy {
            device: DeviceKind::Trigger
        }))
    );
    assert_eq!(
        summary.transitions,
        vec![WorkerState::Arming, WorkerState::Faulted, WorkerState::Idle]
    );
    // Camera and stage were never touched; the trigger was released
    assert!(log.calls().iter().all(|call| call.device == DeviceKind::Trigger));
    assert_eq!(
        log.calls().last(),
        Some(&DeviceCall {
            device: DeviceKind::Trigger,
            operation: "close"
        })
    );
    assert_eq!(counter.open_count(), 0);
}

#[tokio::test]
async fn test_open_timeout_reports_unavailable() {
    let hang = FaultPlan {
        hang_on_open: true,
        ..FaultPlan::default()
    };
    let rig = SimulatedRig::new().camera_faults(hang);
    let counter = rig.counter();
    let mut worker = AcquisitionWorker::new(rig.into_device_set(), test_config());

    worker.start(sequence(3, 10, Vec::new())).unwrap();
    let summary = worker.join().await.unwrap();

    assert!(matches!(
        summary.fault,
        Some(RunFault::Device(DeviceError::Unavailable {
            device: DeviceKind::Camera,
            ..
        }))
    ));
    assert_eq!(counter.open_count(), 0);
}

#[tokio::test]
async fn test_abort_while_arming() {
    let hang = FaultPlan {
        hang_on_open: true,
        ..FaultPlan::default()
    };
    let rig = SimulatedRig::new().trigger_faults(hang);
    let counter = rig.counter();
    let config = WorkerConfig {
        open_timeout: Duration::from_secs(30),
        ..test_config()
    };
    let mut worker = AcquisitionWorker::new(rig.into_device_set(), config);

    worker.start(sequence(3, 10, Vec::new())).unwrap();
    assert_eq!(worker.status(), WorkerState::Arming);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let aborted_at = Instant::now();
    worker.abort();
    let summary = worker.join().await.unwrap();

    assert!(aborted_at.elapsed() < Duration::from_secs(1));
    assert!(summary.aborted);
    assert_eq!(
        summary.transitions,
        vec![WorkerState::Arming, WorkerState::Aborting, WorkerState::Idle]
    );
    assert_eq!(summary.frames_captured, 0);
    assert_eq!(counter.open_count(), 0);
}

#[tokio::test]
async fn test_abort_while_running() {
    let rig = SimulatedRig::new();
    let counter = rig.counter();
    let config = test_config();
    let bound = config.release_bound();
    let mut worker = AcquisitionWorker::new(rig.into_device_set(), config);

    worker.start(sequence(200, 10, Vec::new())).unwrap();
    wait_for_state(&worker, WorkerState::Running).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let aborted_at = Instant::now();
    worker.abort();
    assert!(worker.wait_idle(bound + Duration::from_millis(500)).await);
    assert!(aborted_at.elapsed() < bound + Duration::from_millis(500));

    let summary = worker.join().await.unwrap();
    assert!(summary.aborted);
    assert!(summary.fault.is_none());
    assert!(summary.frames_captured < 200);
    assert_eq!(
        summary.transitions,
        vec![
            WorkerState::Arming,
            WorkerState::Running,
            WorkerState::Aborting,
            WorkerState::Idle
        ]
    );
    assert_eq!(counter.open_count(), 0);
}

#[tokio::test]
async fn test_abort_interrupts_hung_trigger() {
    let rig = SimulatedRig::new().trigger_faults(FaultPlan::hang_always());
    let counter = rig.counter();
    let config = WorkerConfig {
        trigger_timeout: Duration::from_secs(30),
        ..test_config()
    };
    let mut worker = AcquisitionWorker::new(rig.into_device_set(), config);

    worker.start(sequence(3, 10, Vec::new())).unwrap();
    wait_for_state(&worker, WorkerState::Running).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    worker.abort();
    assert!(worker.wait_idle(Duration::from_secs(1)).await);
    let summary = worker.join().await.unwrap();
    assert!(summary.aborted);
    assert_eq!(counter.open_count(), 0);
}

#[tokio::test]
async fn test_stop_finishes_current_frame() {
    let rig = SimulatedRig::new();
    let counter = rig.counter();
    let mut worker = AcquisitionWorker::new(rig.into_device_set(), test_config());

    worker.start(sequence(100, 10, Vec::new())).unwrap();
    wait_for_state(&worker, WorkerState::Running).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    worker.stop();

    let summary = worker.join().await.unwrap();
    assert!(summary.stopped_early);
    assert!(!summary.aborted);
    assert!(summary.fault.is_none());
    assert_eq!(
        summary.transitions,
        vec![
            WorkerState::Arming,
            WorkerState::Running,
            WorkerState::Stopping,
            WorkerState::Idle
        ]
    );

    let indices: Vec<u32> = worker.channel().drain().iter().map(|f| f.index).collect();
    assert!(!indices.is_empty() && indices.len() < 100);
    assert_eq!(indices, (0..indices.len() as u32).collect::<Vec<_>>());
    assert_eq!(counter.open_count(), 0);
}

#[tokio::test]
async fn test_stage_moves_precede_their_trigger() {
    let rig = fast_stage_rig();
    let log = rig.call_log();
    let mut worker = AcquisitionWorker::new(rig.into_device_set(), test_config());
    let waypoints = vec![
        Waypoint {
            offset: Duration::ZERO,
            position: 10.0,
        },
        Waypoint {
            offset: Duration::from_millis(40),
            position: 20.0,
        },
    ];

    worker.start(sequence(4, 20, waypoints)).unwrap();
    let summary = worker.join().await.unwrap();
    assert_eq!(summary.waypoints_reached, 2);

    let executes: Vec<DeviceKind> = log
        .calls()
        .into_iter()
        .filter(|call| call.operation == "execute")
        .map(|call| call.device)
        .collect();
    use DeviceKind::{Camera, Stage, Trigger};
    assert_eq!(
        executes,
        vec![
            Stage, Trigger, Camera, // index 0
            Trigger, Camera, // index 1
            Stage, Trigger, Camera, // index 2
            Trigger, Camera, // index 3
        ]
    );

    let positions: Vec<Option<f64>> = worker
        .channel()
        .drain()
        .iter()
        .map(|f| f.stage_position)
        .collect();
    assert_eq!(positions, vec![Some(10.0), Some(10.0), Some(20.0), Some(20.0)]);
}

#[tokio::test]
async fn test_slow_stage_exceeds_run_deadline() {
    // 180 degrees at 360 degrees/s takes 500 ms, far past a 30 ms run plus margin
    let config = WorkerConfig {
        run_deadline_margin: Duration::from_millis(100),
        ..test_config()
    };
    let rig = SimulatedRig::new();
    let counter = rig.counter();
    let mut worker = AcquisitionWorker::new(rig.into_device_set(), config);
    let waypoints = vec![Waypoint {
        offset: Duration::ZERO,
        position: 180.0,
    }];

    worker.start(sequence(3, 10, waypoints)).unwrap();
    let summary = worker.join().await.unwrap();

    assert!(matches!(
        summary.fault,
        Some(RunFault::DeadlineExceeded { .. })
    ));
    assert!(summary.timing_violations >= 1);
    assert_eq!(counter.open_count(), 0);
}

#[tokio::test]
async fn test_full_channel_keeps_newest_frames() {
    let config = WorkerConfig {
        channel_capacity: Some(2),
        ..test_config()
    };
    let mut worker = AcquisitionWorker::new(SimulatedRig::new().into_device_set(), config);

    worker.start(sequence(6, 10, Vec::new())).unwrap();
    let summary = worker.join().await.unwrap();

    // Acquisition itself is unaffected by a consumer that never drains
    assert_eq!(summary.frames_captured, 6);
    assert_eq!(summary.channel_overflows, 4);
    let indices: Vec<u32> = worker.channel().drain().iter().map(|f| f.index).collect();
    assert_eq!(indices, vec![4, 5]);
}

#[tokio::test]
async fn test_channel_sized_from_trigger_rate() {
    let mut worker = AcquisitionWorker::new(SimulatedRig::new().into_device_set(), test_config());

    // 100 Hz x 2 s of buffer
    worker.start(sequence(2, 10, Vec::new())).unwrap();
    worker.join().await;
    assert_eq!(worker.channel().capacity(), 200);
}
