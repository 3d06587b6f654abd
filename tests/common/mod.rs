//! Shared helpers for integration tests
#![allow(dead_code)]

use crossbeam_channel::Sender;
use cycler_rs::{
    queue_source, CyclerConfig, CyclerService, DummyDriver, Frame, FrameBatch,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A service over the dummy driver and an injectable telemetry source.
pub struct TestHarness {
    pub service: CyclerService,
    pub driver: Arc<DummyDriver>,
    pub frames: Sender<FrameBatch>,
}

impl TestHarness {
    /// Inject one frame for one channel.
    pub fn send_frame(&self, channel: usize, frame: Frame) {
        self.frames
            .send(vec![(channel, frame)])
            .expect("ingest loop gone");
    }
}

/// Build a harness with the given worker count.
pub fn harness_with_workers(worker_count: usize) -> TestHarness {
    let config = CyclerConfig {
        worker_count,
        ..Default::default()
    };
    let driver = Arc::new(DummyDriver::new());
    let (frames, source) = queue_source(64);
    let service = CyclerService::new(Arc::clone(&driver) as _, Box::new(source), config)
        .expect("service construction failed");
    TestHarness {
        service,
        driver,
        frames,
    }
}

/// Build a harness with the default worker count.
pub fn harness() -> TestHarness {
    harness_with_workers(CyclerConfig::default().worker_count)
}

/// Build a measurement frame from key/value pairs.
pub fn frame(entries: &[(&str, f64)]) -> Frame {
    entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

/// Poll `pred` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    pred()
}
