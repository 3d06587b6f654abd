//! Battery cycler control plane - demo entry point
//!
//! Runs a CCCV test against the dummy driver with a scripted telemetry
//! sequence, exercising the whole control/data-plane loop without
//! hardware.

use cycler_rs::{keys, queue_source, CyclerConfig, CyclerService, DummyDriver, Frame, StepLimit};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn frame(entries: &[(&str, f64)]) -> Frame {
    entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

fn main() -> cycler_rs::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,cycler_rs=debug")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting battery cycler control plane");

    let driver = Arc::new(DummyDriver::new());
    let (frames_tx, source) = queue_source(64);
    let mut service = CyclerService::new(
        Arc::clone(&driver) as Arc<dyn cycler_rs::ChannelDriver>,
        Box::new(source),
        CyclerConfig::default(),
    )?;

    // Channel 1: charge at 2 A to 4.2 V, hold, stop on over-temperature.
    service.run_cccv(1, 2.0, 4.2, vec![StepLimit::rising(keys::TEMPERATURE, 45.0)])?;

    // Scripted telemetry: mid-charge, then the target voltage.
    let script = [
        frame(&[
            (keys::VOLTAGE, 3.5),
            (keys::CURRENT, 2.0),
            (keys::TIMESTAMP, 0.0),
        ]),
        frame(&[
            (keys::VOLTAGE, 4.2),
            (keys::CURRENT, 2.0),
            (keys::TIMESTAMP, 1.0),
        ]),
    ];
    for f in script {
        frames_tx
            .send(vec![(1, f)])
            .map_err(|e| cycler_rs::CyclerError::Transport(e.to_string()))?;
        std::thread::sleep(Duration::from_millis(50));
    }

    // Let the workers drain before reporting.
    std::thread::sleep(Duration::from_millis(100));
    for op in driver.ops() {
        tracing::info!(?op, "driver operation");
    }
    tracing::info!(
        frames = service.ingest_stats().frames(),
        executed = service.dispatch_stats().executed(),
        "demo complete"
    );

    service.shutdown();
    Ok(())
}
