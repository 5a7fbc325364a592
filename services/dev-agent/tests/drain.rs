//! Integration tests for device manager drain cycles.
//!
//! All tests run on a paused clock, so settle delays, mock latency and
//! command timeouts elapse instantly but in order.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{commands, count, drain_events, file, single, Harness, SETTLE, TIMEOUT};
use devsync_agent::actors::{SessionContext, Supervisor};
use devsync_agent::restart::{restart_notice, restart_script, TouchedModules};
use devsync_agent::state::StateStore;
use devsync_agent::{
    Device, DeviceCall, DeviceManager, DrainError, MockDevice, NeverPrompt, Project, RestartMode,
};
use devsync_events::{DevEvent, DrainStage};
use devsync_instructions::FileInstruction;
use tokio::sync::broadcast;
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn test_create_main_stops_uploads_and_restarts() {
    let (_harness, device, manager) = single(MockDevice::new("esp32")).await;
    let start = Instant::now();

    manager.push(FileInstruction::create(file("main.py"))).unwrap();
    assert!(manager.is_busy());

    // Still inside the settle delay
    tokio::time::sleep(SETTLE - Duration::from_millis(1)).await;
    assert!(manager.is_busy());

    manager.wait_idle().await;
    assert!(start.elapsed() >= SETTLE);
    assert!(!manager.is_busy());

    let touched: TouchedModules = ["main.py"].into_iter().collect();
    assert_eq!(
        device.calls().await,
        vec![
            DeviceCall::StopProgram,
            DeviceCall::Upload {
                local: file("main.py"),
                remote: "main.py".to_string(),
            },
            DeviceCall::Command {
                text: restart_script(&touched),
            },
        ]
    );

    let status = manager.status();
    assert_eq!(status.cycles_completed, 1);
    assert!(status.last_error.is_none());
    let report = status.last_report.unwrap();
    assert_eq!(report.strategy, RestartMode::RestartScript);
    assert!(report.is_clean());
}

#[tokio::test(start_paused = true)]
async fn test_pushes_during_drain_join_the_running_cycle() {
    let (_harness, device, manager) =
        single(MockDevice::new("esp32").with_latency(Duration::from_millis(100))).await;

    manager.push(FileInstruction::change(file("a.py"))).unwrap();

    // Program is being stopped
    tokio::time::sleep(Duration::from_millis(50)).await;
    manager.push(FileInstruction::change(file("b.py"))).unwrap();
    manager.push(FileInstruction::change(file("c.py"))).unwrap();

    // a.py is being uploaded
    tokio::time::sleep(Duration::from_millis(100)).await;
    manager.push(FileInstruction::change(file("d.py"))).unwrap();

    manager.wait_idle().await;

    let calls = device.calls().await;
    assert_eq!(device.uploads().await, vec!["a.py", "b.py", "c.py", "d.py"]);
    assert_eq!(count(&calls, &DeviceCall::StopProgram), 1);
    assert_eq!(commands(&calls).len(), 1);
    assert_eq!(manager.status().cycles_completed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_push_during_settle_runs_another_cycle() {
    let (_harness, device, manager) = single(MockDevice::new("esp32")).await;

    manager.push(FileInstruction::change(file("a.py"))).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(manager.is_busy());
    manager.push(FileInstruction::change(file("b.py"))).unwrap();

    manager.wait_idle().await;

    let calls = device.calls().await;
    assert_eq!(calls.len(), 6);
    assert_eq!(calls[0], DeviceCall::StopProgram);
    assert!(matches!(&calls[1], DeviceCall::Upload { remote, .. } if remote == "a.py"));
    assert!(matches!(&calls[2], DeviceCall::Command { .. }));
    assert_eq!(calls[3], DeviceCall::StopProgram);
    assert!(matches!(&calls[4], DeviceCall::Upload { remote, .. } if remote == "b.py"));
    assert!(matches!(&calls[5], DeviceCall::Command { .. }));
    assert_eq!(manager.status().cycles_completed, 2);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_pushes_never_overlap_device_io() {
    let (_harness, device, manager) =
        single(MockDevice::new("esp32").with_latency(Duration::from_millis(10))).await;

    let mut tasks = Vec::new();
    for i in 0..20u64 {
        let manager = manager.clone();
        tasks.push(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(i * 7)).await;
            manager
                .push(FileInstruction::change(file(&format!("mod_{i}.py"))))
                .unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    manager.wait_idle().await;

    assert_eq!(device.max_in_flight(), 1);

    let mut uploads = device.uploads().await;
    uploads.sort();
    let mut expected: Vec<String> = (0..20).map(|i| format!("mod_{i}.py")).collect();
    expected.sort();
    assert_eq!(uploads, expected);
}

#[tokio::test(start_paused = true)]
async fn test_change_then_delete_in_one_batch_only_removes() {
    let (_harness, device, manager) = single(MockDevice::new("esp32")).await;

    // Both land before the actor runs, so they share one batch
    manager.push(FileInstruction::change(file("a.py"))).unwrap();
    manager.push(FileInstruction::delete(file("a.py"))).unwrap();
    manager.wait_idle().await;

    let calls = device.calls().await;
    assert_eq!(calls[0], DeviceCall::StopProgram);
    assert_eq!(
        calls[1],
        DeviceCall::Remove {
            remote: "a.py".to_string()
        }
    );
    assert_eq!(calls.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_failed_instruction_does_not_stop_the_batch() {
    let (harness, device, manager) =
        single(MockDevice::new("esp32").with_failing_path("b.py")).await;
    let mut events = harness.session.subscribe();

    manager.push(FileInstruction::change(file("a.py"))).unwrap();
    manager.push(FileInstruction::change(file("b.py"))).unwrap();
    manager.push(FileInstruction::change(file("c.py"))).unwrap();
    manager.wait_idle().await;

    assert_eq!(device.uploads().await, vec!["a.py", "b.py", "c.py"]);
    assert_eq!(commands(&device.calls().await).len(), 1);

    let status = manager.status();
    assert!(status.last_error.is_none());
    let report = status.last_report.unwrap();
    assert_eq!(report.applied.len(), 2);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].instruction.file, file("b.py"));
    assert_eq!(report.touched.paths(), ["a.py", "c.py"]);

    let events = drain_events(&mut events);
    assert!(events.iter().any(|e| matches!(
        &e.event,
        DevEvent::InstructionFailed { file, .. } if file.ends_with("b.py")
    )));
    assert!(events.iter().any(|e| matches!(
        e.event,
        DevEvent::DrainCompleted { applied: 2, failed: 1, .. }
    )));
}

#[tokio::test(start_paused = true)]
async fn test_path_outside_project_fails_alone() {
    let (_harness, device, manager) = single(MockDevice::new("esp32")).await;

    manager
        .push(FileInstruction::create("/elsewhere/x.py"))
        .unwrap();
    manager.push(FileInstruction::create(file("main.py"))).unwrap();
    manager.wait_idle().await;

    assert_eq!(device.uploads().await, vec!["main.py"]);
    let report = manager.status().last_report.unwrap();
    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].reason.contains("outside project root"));
}

#[tokio::test(start_paused = true)]
async fn test_stop_failure_keeps_queue_until_next_push() {
    let (harness, device, manager) = single(MockDevice::new("esp32")).await;
    let mut events = harness.session.subscribe();
    device.set_fail_stop(true);

    manager.push(FileInstruction::change(file("a.py"))).unwrap();
    manager.wait_idle().await;

    assert!(!manager.is_busy());
    assert!(device.uploads().await.is_empty());
    let status = manager.status();
    assert_eq!(status.pending, 1);
    assert!(matches!(status.last_error, Some(DrainError::StopFailed { .. })));
    assert!(drain_events(&mut events).iter().any(|e| matches!(
        e.event,
        DevEvent::DrainFailed { stage: DrainStage::Stop, .. }
    )));

    device.set_fail_stop(false);
    manager.push(FileInstruction::change(file("b.py"))).unwrap();
    manager.wait_idle().await;

    assert_eq!(device.uploads().await, vec!["a.py", "b.py"]);
    let status = manager.status();
    assert_eq!(status.pending, 0);
    assert!(status.last_error.is_none());
    assert_eq!(status.cycles_completed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_hanging_stop_times_out() {
    let (_harness, device, manager) = single(MockDevice::new("esp32")).await;
    device.set_hang_stop(true);
    let start = Instant::now();

    manager.push(FileInstruction::change(file("a.py"))).unwrap();
    manager.wait_idle().await;

    assert!(start.elapsed() >= TIMEOUT);
    match manager.status().last_error {
        Some(DrainError::StopFailed { reason, .. }) => assert!(reason.contains("timed out")),
        other => panic!("expected StopFailed, got {other:?}"),
    }
    assert!(device.uploads().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_restart_failure_is_reported() {
    let (_harness, device, manager) = single(MockDevice::new("esp32")).await;
    device.set_fail_restart(true);

    manager.push(FileInstruction::change(file("a.py"))).unwrap();
    manager.wait_idle().await;

    // Files were applied before the restart failed
    assert_eq!(device.uploads().await, vec!["a.py"]);
    assert!(matches!(
        manager.status().last_error,
        Some(DrainError::RestartFailed {
            mode: RestartMode::RestartScript,
            ..
        })
    ));

    device.set_fail_restart(false);
    manager.push(FileInstruction::change(file("b.py"))).unwrap();
    manager.wait_idle().await;

    assert!(manager.status().last_error.is_none());
    assert_eq!(manager.status().cycles_completed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_hard_restart_selected_from_config() {
    let (harness, device, manager) = single(MockDevice::new("esp32")).await;
    harness.project.set_on_update(Some("hardRestartDevice"));

    manager.push(FileInstruction::change(file("main.py"))).unwrap();
    manager.wait_idle().await;

    let calls = device.calls().await;
    assert_eq!(count(&calls, &DeviceCall::HardReset), 1);
    assert_eq!(count(&calls, &DeviceCall::SoftReset), 0);

    let touched: TouchedModules = ["main.py"].into_iter().collect();
    assert_eq!(commands(&calls), vec![restart_notice(&touched)]);
    assert_eq!(calls.last(), Some(&DeviceCall::HardReset));
}

#[tokio::test(start_paused = true)]
async fn test_soft_restart_selected_from_config() {
    let (harness, device, manager) = single(MockDevice::new("esp32")).await;
    harness.project.set_on_update(Some("softRestartDevice"));

    manager.push(FileInstruction::change(file("lib/util.py"))).unwrap();
    manager.wait_idle().await;

    let calls = device.calls().await;
    assert_eq!(count(&calls, &DeviceCall::SoftReset), 1);
    assert_eq!(count(&calls, &DeviceCall::HardReset), 0);
    assert!(commands(&calls)
        .iter()
        .all(|text| !text.contains("sys.modules")));
}

#[tokio::test(start_paused = true)]
async fn test_config_is_reread_every_cycle() {
    let (harness, device, manager) = single(MockDevice::new("esp32")).await;

    manager.push(FileInstruction::change(file("a.py"))).unwrap();
    manager.wait_idle().await;
    assert_eq!(count(&device.calls().await, &DeviceCall::HardReset), 0);

    harness.project.set_on_update(Some("hardRestartDevice"));
    manager.push(FileInstruction::change(file("a.py"))).unwrap();
    manager.wait_idle().await;

    assert_eq!(count(&device.calls().await, &DeviceCall::HardReset), 1);
    assert_eq!(
        manager.status().last_report.unwrap().strategy,
        RestartMode::HardRestartDevice
    );
}

#[tokio::test(start_paused = true)]
async fn test_invalid_config_fails_before_touching_device() {
    let (harness, device, manager) = single(MockDevice::new("esp32")).await;
    let mut events = harness.session.subscribe();
    harness.project.set_on_update(Some("rebootEverything"));

    manager.push(FileInstruction::change(file("a.py"))).unwrap();
    manager.wait_idle().await;

    assert!(device.calls().await.is_empty());
    match manager.status().last_error {
        Some(DrainError::ConfigInvalid { reason }) => assert!(reason.contains("rebootEverything")),
        other => panic!("expected ConfigInvalid, got {other:?}"),
    }
    assert!(drain_events(&mut events).iter().any(|e| matches!(
        e.event,
        DevEvent::DrainFailed { stage: DrainStage::Config, .. }
    )));

    harness.project.set_on_update(None);
    manager.push(FileInstruction::change(file("b.py"))).unwrap();
    manager.wait_idle().await;
    assert_eq!(device.uploads().await, vec!["a.py", "b.py"]);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_device_fails_with_device_gone() {
    let harness = Harness::new();
    let (events, _) = broadcast::channel(16);
    let project: Arc<dyn Project> = harness.project.clone();
    let ctx = SessionContext {
        project,
        store: Arc::new(StateStore::open_in_memory().unwrap()),
        settings: common::settings(),
        events,
        prompt: Arc::new(NeverPrompt),
    };

    let mut supervisor = Supervisor::new();
    let device: Arc<dyn Device> = Arc::new(MockDevice::new("esp32"));
    let manager = DeviceManager::spawn(&mut supervisor, &device, &ctx);
    drop(device);

    manager.push(FileInstruction::change(file("a.py"))).unwrap();
    manager.wait_idle().await;

    assert_eq!(
        manager.status().last_error,
        Some(DrainError::DeviceGone("esp32".to_string()))
    );
    assert!(matches!(
        manager.upload_if_needed().await,
        Err(DrainError::DeviceGone(_))
    ));

    supervisor.stop_all().await;
}
