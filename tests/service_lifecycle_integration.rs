//! Integration tests for service lifecycle
//!
//! Startup, worker-pool control, and shutdown semantics: the ingest loop
//! exits, in-flight tasks complete, the backlog is dropped, and late
//! submissions are discarded.

mod common;

use common::{frame, harness, harness_with_workers, wait_until};
use cycler_rs::{keys, Task};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn test_frames_reach_table_while_running() {
    let h = harness();
    h.send_frame(3, frame(&[(keys::VOLTAGE, 3.7), (keys::TIMESTAMP, 0.5)]));
    assert!(wait_until(Duration::from_secs(2), || {
        h.service.table().voltage(3).unwrap() == 3.7
    }));
    assert!(h.service.ingest_stats().updates() >= 1);
}

#[test]
fn test_worker_count_changes_through_service() {
    let mut h = harness();
    assert_eq!(h.service.worker_count(), 3);
    h.service.set_worker_count(1);
    assert_eq!(h.service.worker_count(), 1);
    h.service.set_worker_count(4);
    assert_eq!(h.service.worker_count(), 4);
    h.service.shutdown();
    assert_eq!(h.service.worker_count(), 0);
}

#[test]
fn test_shutdown_discards_late_work() {
    let mut h = harness();
    h.service.shutdown();

    // Submissions after stop are accepted and dropped silently.
    h.service.submit(Task::Rest { channel: 0 });
    assert_eq!(h.service.dispatch_stats().discarded(), 1);
    assert!(h.driver.ops().is_empty());

    // The ingest thread is gone; injected frames change nothing.
    let before = h.service.ingest_stats().frames();
    let _ = h.frames.send(vec![(0, frame(&[(keys::VOLTAGE, 3.0)]))]);
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(h.service.ingest_stats().frames(), before);
}

#[test]
fn test_shutdown_completes_in_flight_task_and_drops_backlog() {
    let mut h = harness_with_workers(1);

    let started = Arc::new(AtomicBool::new(false));
    let release = Arc::new(AtomicBool::new(false));
    let started_flag = Arc::clone(&started);
    let release_flag = Arc::clone(&release);
    let handle = h
        .service
        .registry()
        .register(
            0,
            Box::new(move |_cx| {
                started_flag.store(true, Ordering::SeqCst);
                while !release_flag.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(1));
                }
            }),
        )
        .unwrap();
    h.service.submit(Task::CallbackEvaluation { channel: 0, handle });
    assert!(wait_until(Duration::from_secs(2), || {
        started.load(Ordering::SeqCst)
    }));

    // Backlog behind the in-flight task.
    for channel in 1..4 {
        h.service.submit(Task::ConstantCurrent { channel, amps: 1.0 });
    }

    let unblock = Arc::clone(&release);
    let shutdown_thread = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(30));
        unblock.store(true, Ordering::SeqCst);
    });
    h.service.shutdown();
    shutdown_thread.join().unwrap();

    // The in-flight evaluation finished; the queued commands never ran.
    assert_eq!(h.service.dispatch_stats().executed(), 1);
    assert!(h.driver.ops().is_empty());
}

#[test]
fn test_shutdown_twice_is_safe() {
    let mut h = harness();
    h.service.shutdown();
    h.service.shutdown();
}
