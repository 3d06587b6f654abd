//! High-level test orchestration
//!
//! [`CyclerService`] owns the dispatcher, measurement table, callback
//! registry and ingest thread, and composes them into test procedures.
//! The procedures keep no state machine of their own: each one submits an
//! initial control task and installs callbacks whose firing on data-plane
//! updates drives the remaining transitions.
//!
//! # CCCV
//!
//! `run_cccv` subscribes the channel, starts the constant-current phase,
//! and installs two callbacks: a one-shot transition that switches to a
//! constant-voltage hold when the target voltage is reached, and a
//! step-limit watchdog that tears the test down (callbacks cleared,
//! channel unsubscribed, output off) when any limit trips. The implicit
//! per-channel state machine is `CC -> CV` on the voltage threshold and
//! `* -> TERMINATED` on a step limit; there is no direct `CV -> CC`
//! transition.

use crate::analysis::AnalysisEngine;
use crate::config::CyclerConfig;
use crate::dispatch::{DispatchStats, Dispatcher, Task, TaskContext, TaskPriority, TaskQueue};
use crate::driver::ChannelDriver;
use crate::error::{CyclerError, Result};
use crate::ingest::{IngestLoop, IngestStats, RpmsgSource, TelemetrySource};
use crate::registry::{CallbackFn, CallbackRegistry};
use crate::table::ChannelTable;
use crate::types::{keys, limits_reached, metric, validate_channel, StepLimit};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

/// Band around the CV target within which the hold callback stays quiet.
const CV_HOLD_TOLERANCE_V: f64 = 0.05;

/// Number of current increments used by `run_current_ramp`.
const CURRENT_RAMP_STEPS: usize = 8;

/// Relative tolerance for deciding the DCIM pulse current has settled.
const DCIM_SETTLE_TOLERANCE: f64 = 0.05;

/// The application-processor control plane for one cycler.
///
/// Construct exactly one per process entry point and pass the handle to
/// whatever needs to start tests; unit tests can instantiate isolated
/// services over a [`QueueSource`](crate::ingest::QueueSource) and a
/// [`DummyDriver`](crate::driver::DummyDriver).
pub struct CyclerService {
    table: Arc<ChannelTable>,
    registry: Arc<CallbackRegistry>,
    queue: Arc<TaskQueue>,
    dispatcher: Dispatcher,
    running: Arc<AtomicBool>,
    ingest_stats: Arc<IngestStats>,
    ingest: Option<JoinHandle<()>>,
}

impl CyclerService {
    /// Start a service over the given driver and telemetry source.
    ///
    /// Ingest and dispatch begin immediately.
    pub fn new(
        driver: Arc<dyn ChannelDriver>,
        source: Box<dyn TelemetrySource>,
        config: CyclerConfig,
    ) -> Result<Self> {
        config.validate()?;

        let table = Arc::new(ChannelTable::new());
        let registry = Arc::new(CallbackRegistry::new());
        let queue = Arc::new(TaskQueue::new());
        let analysis = Arc::new(AnalysisEngine::new(
            config.filter_alpha,
            config.fit_window,
            config.fit_degree,
        ));
        let ctx = Arc::new(TaskContext::new(
            driver,
            Arc::clone(&table),
            Arc::clone(&registry),
            analysis,
            Arc::clone(&queue),
        ));
        let dispatcher = Dispatcher::new(Arc::clone(&queue), ctx, config.worker_count);

        let running = Arc::new(AtomicBool::new(true));
        let ingest_stats = Arc::new(IngestStats::default());
        let ingest_loop = IngestLoop::new(
            source,
            Arc::clone(&table),
            Arc::clone(&registry),
            Arc::clone(&queue),
            Arc::clone(&running),
            config.ingest_period(),
            config.transport_backoff(),
            Arc::clone(&ingest_stats),
        );
        let ingest = std::thread::Builder::new()
            .name("cycler-ingest".to_string())
            .spawn(move || ingest_loop.run())
            .expect("failed to spawn ingest thread");

        tracing::info!(workers = config.worker_count, "cycler service started");
        Ok(Self {
            table,
            registry,
            queue,
            dispatcher,
            running,
            ingest_stats,
            ingest: Some(ingest),
        })
    }

    /// Start a service reading telemetry from the configured character
    /// device.
    pub fn with_transport(driver: Arc<dyn ChannelDriver>, config: CyclerConfig) -> Result<Self> {
        let source = RpmsgSource::open(&config.transport_path)?;
        Self::new(driver, Box::new(source), config)
    }

    /// Run a constant-current / constant-voltage test.
    ///
    /// Drives `channel` at `current` amps until the voltage reaches
    /// `target_voltage`, then holds that voltage. Any tripped entry in
    /// `limits` terminates the test: callbacks are cleared, the channel is
    /// unsubscribed and turned off.
    pub fn run_cccv(
        &self,
        channel: usize,
        current: f64,
        target_voltage: f64,
        limits: Vec<StepLimit>,
    ) -> Result<()> {
        validate_channel(channel)?;
        tracing::info!(channel, current, target_voltage, "starting CCCV test");

        self.table.subscribe(channel)?;
        self.queue.submit(Task::ConstantCurrent {
            channel,
            amps: current,
        });

        // CC phase: one-shot switch to the CV hold once the target voltage
        // is visible in the table. The synthesized CV command goes out at
        // high priority to bound the time between threshold and hold.
        let fired = AtomicBool::new(false);
        self.registry.register(
            channel,
            Box::new(move |cx| {
                let Some(voltage) = metric(cx.snapshot, keys::VOLTAGE) else {
                    return;
                };
                if voltage >= target_voltage && !fired.swap(true, Ordering::SeqCst) {
                    tracing::info!(
                        channel = cx.channel,
                        voltage,
                        "target voltage reached, switching to CV hold"
                    );
                    cx.services.submit_with_priority(
                        Task::ConstantVoltage {
                            channel: cx.channel,
                            volts: target_voltage,
                        },
                        TaskPriority::High,
                    );
                    if let Err(e) = cx.services.registry.unregister(cx.channel, cx.handle) {
                        tracing::warn!(channel = cx.channel, error = %e, "transition cleanup failed");
                    }
                    if let Err(e) = cx
                        .services
                        .registry
                        .register(cx.channel, cv_hold_callback(target_voltage))
                    {
                        tracing::warn!(channel = cx.channel, error = %e, "CV hold install failed");
                    }
                }
            }),
        )?;

        // Step limits terminate the test from any phase.
        self.registry.register(
            channel,
            Box::new(move |cx| {
                if limits_reached(&limits, cx.snapshot) {
                    tracing::warn!(channel = cx.channel, "step limit reached, terminating test");
                    if let Err(e) = cx.services.registry.unregister_all(cx.channel) {
                        tracing::warn!(channel = cx.channel, error = %e, "callback teardown failed");
                    }
                    if let Err(e) = cx.services.table.unsubscribe(cx.channel) {
                        tracing::warn!(channel = cx.channel, error = %e, "unsubscribe failed");
                    }
                    cx.services.submit(Task::Off {
                        channel: cx.channel,
                    });
                }
            }),
        )?;

        Ok(())
    }

    /// Put a channel into its rest state, clearing any installed callbacks.
    pub fn run_rest(&self, channel: usize) -> Result<()> {
        validate_channel(channel)?;
        tracing::info!(channel, "starting rest");
        self.registry.unregister_all(channel)?;
        self.queue.submit(Task::Rest { channel });
        Ok(())
    }

    /// Measure internal resistance with a direct-current pulse.
    ///
    /// Rests the channel to capture an open-circuit baseline from the next
    /// data-plane update, applies `current`, and once the measured current
    /// has settled publishes `(v - v_rest) / current` into the table as the
    /// `resistance` metric before resting the channel again.
    pub fn run_dcim(&self, channel: usize, current: f64) -> Result<()> {
        validate_channel(channel)?;
        if current == 0.0 {
            return Err(CyclerError::CurrentOutOfRange {
                channel,
                amps: current,
            });
        }
        tracing::info!(channel, current, "starting DCIM measurement");

        self.table.subscribe(channel)?;
        self.queue.submit(Task::Rest { channel });

        let phase = AtomicUsize::new(0);
        let baseline = Mutex::new(0.0f64);
        self.registry.register(
            channel,
            Box::new(move |cx| {
                let Some(voltage) = metric(cx.snapshot, keys::VOLTAGE) else {
                    return;
                };
                match phase.load(Ordering::SeqCst) {
                    0 => {
                        *baseline.lock().unwrap_or_else(PoisonError::into_inner) = voltage;
                        phase.store(1, Ordering::SeqCst);
                        cx.services.submit(Task::ConstantCurrent {
                            channel: cx.channel,
                            amps: current,
                        });
                    }
                    1 => {
                        let measured = metric(cx.snapshot, keys::CURRENT).unwrap_or(0.0);
                        if (measured - current).abs()
                            <= DCIM_SETTLE_TOLERANCE * current.abs()
                        {
                            let rest_voltage =
                                *baseline.lock().unwrap_or_else(PoisonError::into_inner);
                            let resistance = (voltage - rest_voltage) / current;
                            if let Err(e) = cx.services.table.insert(
                                cx.channel,
                                keys::RESISTANCE,
                                resistance,
                            ) {
                                tracing::warn!(channel = cx.channel, error = %e, "resistance publish failed");
                            }
                            tracing::info!(
                                channel = cx.channel,
                                resistance,
                                "internal resistance measured"
                            );
                            if let Err(e) =
                                cx.services.registry.unregister(cx.channel, cx.handle)
                            {
                                tracing::warn!(channel = cx.channel, error = %e, "DCIM cleanup failed");
                            }
                            cx.services.submit(Task::Rest {
                                channel: cx.channel,
                            });
                        }
                    }
                    _ => {}
                }
            }),
        )?;

        Ok(())
    }

    /// Ramp the channel current toward `current` in fixed increments, one
    /// step per data-plane update.
    pub fn run_current_ramp(&self, channel: usize, current: f64) -> Result<()> {
        validate_channel(channel)?;
        if current == 0.0 {
            return Err(CyclerError::CurrentOutOfRange {
                channel,
                amps: current,
            });
        }
        tracing::info!(channel, current, "starting current ramp");

        self.table.subscribe(channel)?;
        let step = current / CURRENT_RAMP_STEPS as f64;
        self.queue.submit(Task::ConstantCurrent {
            channel,
            amps: step,
        });

        let applied = Mutex::new(step);
        self.registry.register(
            channel,
            Box::new(move |cx| {
                let mut level = applied.lock().unwrap_or_else(PoisonError::into_inner);
                if (*level - current).abs() < f64::EPSILON {
                    if let Err(e) = cx.services.registry.unregister(cx.channel, cx.handle) {
                        tracing::warn!(channel = cx.channel, error = %e, "ramp cleanup failed");
                    }
                    return;
                }
                let remaining = current - *level;
                *level = if remaining.abs() <= step.abs() {
                    current
                } else {
                    *level + step
                };
                cx.services.submit(Task::ConstantCurrent {
                    channel: cx.channel,
                    amps: *level,
                });
            }),
        )?;

        Ok(())
    }

    /// Submit a task directly to the dispatcher.
    pub fn submit(&self, task: Task) {
        self.queue.submit(task);
    }

    /// Resize the worker pool. See [`Dispatcher::set_worker_count`].
    pub fn set_worker_count(&self, count: usize) {
        self.dispatcher.set_worker_count(count);
    }

    /// Current worker pool size.
    pub fn worker_count(&self) -> usize {
        self.dispatcher.worker_count()
    }

    /// The per-channel measurement table.
    pub fn table(&self) -> &Arc<ChannelTable> {
        &self.table
    }

    /// The per-channel callback registry.
    pub fn registry(&self) -> &Arc<CallbackRegistry> {
        &self.registry
    }

    /// Queue and worker counters.
    pub fn dispatch_stats(&self) -> &DispatchStats {
        self.queue.stats()
    }

    /// Ingest-loop counters.
    pub fn ingest_stats(&self) -> &IngestStats {
        &self.ingest_stats
    }

    /// Stop the service: the ingest loop exits after its current
    /// iteration, in-flight tasks complete, queued tasks are dropped, and
    /// later submissions are discarded. Safe to call more than once; also
    /// runs on drop.
    pub fn shutdown(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("shutting down cycler service");
        if let Some(handle) = self.ingest.take() {
            let _ = handle.join();
        }
        self.dispatcher.shutdown();
    }
}

impl Drop for CyclerService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn cv_hold_callback(target_voltage: f64) -> Box<CallbackFn> {
    Box::new(move |cx| {
        let Some(voltage) = metric(cx.snapshot, keys::VOLTAGE) else {
            return;
        };
        if (voltage - target_voltage).abs() > CV_HOLD_TOLERANCE_V {
            tracing::debug!(
                channel = cx.channel,
                voltage,
                target_voltage,
                "voltage drifted during CV hold, re-asserting"
            );
            cx.services.submit(Task::ConstantVoltage {
                channel: cx.channel,
                volts: target_voltage,
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DummyDriver;
    use crate::ingest::queue_source;
    use crate::types::MAX_CHANNELS;

    fn test_service() -> CyclerService {
        let (_tx, source) = queue_source(16);
        CyclerService::new(
            Arc::new(DummyDriver::new()),
            Box::new(source),
            CyclerConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_starts_and_shuts_down_cleanly() {
        let mut service = test_service();
        assert_eq!(service.worker_count(), 3);
        service.shutdown();
        // Idempotent.
        service.shutdown();
    }

    #[test]
    fn test_rejects_invalid_channel() {
        let service = test_service();
        assert!(service.run_cccv(MAX_CHANNELS, 1.0, 4.2, vec![]).is_err());
        assert!(service.run_rest(MAX_CHANNELS).is_err());
    }

    #[test]
    fn test_dcim_rejects_zero_current() {
        let service = test_service();
        assert!(matches!(
            service.run_dcim(0, 0.0),
            Err(CyclerError::CurrentOutOfRange { .. })
        ));
    }

    #[test]
    fn test_cccv_installs_two_callbacks_and_subscribes() {
        let service = test_service();
        service.run_cccv(1, 2.0, 4.2, vec![]).unwrap();
        assert_eq!(service.registry().len(1).unwrap(), 2);
        assert!(service.table().is_subscribed(1).unwrap());
    }

    #[test]
    fn test_rest_clears_callbacks() {
        let service = test_service();
        service.run_cccv(2, 1.0, 4.1, vec![]).unwrap();
        service.run_rest(2).unwrap();
        assert!(service.registry().is_empty(2).unwrap());
    }

    #[test]
    fn test_config_validation_happens_at_construction() {
        let (_tx, source) = queue_source(4);
        let config = CyclerConfig {
            filter_alpha: 2.0,
            ..Default::default()
        };
        assert!(
            CyclerService::new(Arc::new(DummyDriver::new()), Box::new(source), config).is_err()
        );
    }
}
