//! Telemetry ingest loop
//!
//! A single dedicated thread reads one frame per channel from the
//! transport, merges each frame into the measurement table, submits the
//! analysis tasks, and, for subscribed channels, materialises one
//! callback-evaluation task per registered callback. Callbacks therefore
//! always run on worker threads, never inline on the ingest thread, so a
//! slow callback cannot starve ingestion.
//!
//! # Sources
//!
//! - [`RpmsgSource`] - Blocking reads of fixed-shape records from the
//!   character device connected to the companion real-time core.
//! - [`QueueSource`] - Frames injected through a crossbeam channel, used
//!   for host testing and the demo binary.

use crate::dispatch::{Task, TaskQueue};
use crate::error::{CyclerError, Result};
use crate::registry::CallbackRegistry;
use crate::table::ChannelTable;
use crate::types::{Frame, FrameRecord, MAX_CHANNELS, RECORD_SIZE};
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Producer of per-channel telemetry frames.
///
/// Each call returns a vector of [`MAX_CHANNELS`] frames where index `ch`
/// holds the latest measurements for channel `ch`; an empty frame means no
/// new data for that channel this iteration.
pub trait TelemetrySource: Send {
    fn read_frames(&mut self) -> Result<Vec<Frame>>;
}

/// Telemetry over the RPMsg character device.
///
/// Reads one record per channel per iteration. Reads block until the
/// real-time core produces data, so the ingest loop exits on shutdown
/// only after its current iteration completes.
pub struct RpmsgSource {
    device: File,
}

impl RpmsgSource {
    /// Open the character device at `path` (conventionally
    /// `/dev/ttyRPMSG0`).
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let device = File::open(path.as_ref()).map_err(|e| {
            CyclerError::Transport(format!(
                "failed to open telemetry device {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Ok(Self { device })
    }
}

impl TelemetrySource for RpmsgSource {
    fn read_frames(&mut self) -> Result<Vec<Frame>> {
        let mut frames = vec![Frame::new(); MAX_CHANNELS];
        let mut buffer = [0u8; RECORD_SIZE];
        for _ in 0..MAX_CHANNELS {
            self.device
                .read_exact(&mut buffer)
                .map_err(|e| CyclerError::Transport(format!("telemetry read failed: {e}")))?;
            let record = FrameRecord::decode(&buffer)?;
            let channel = record.channel as usize;
            if channel < MAX_CHANNELS {
                frames[channel] = record.into_frame();
            } else {
                tracing::warn!(channel, "telemetry record for unknown channel dropped");
            }
        }
        Ok(frames)
    }
}

/// A batch of `(channel, frame)` pairs injected into a [`QueueSource`].
pub type FrameBatch = Vec<(usize, Frame)>;

/// Telemetry frames injected through a crossbeam channel.
pub struct QueueSource {
    rx: Receiver<FrameBatch>,
}

/// Create a bounded injection channel and the matching source.
pub fn queue_source(capacity: usize) -> (Sender<FrameBatch>, QueueSource) {
    let (tx, rx) = bounded(capacity);
    (tx, QueueSource { rx })
}

impl TelemetrySource for QueueSource {
    fn read_frames(&mut self) -> Result<Vec<Frame>> {
        let mut frames = vec![Frame::new(); MAX_CHANNELS];
        loop {
            match self.rx.try_recv() {
                Ok(batch) => {
                    for (channel, frame) in batch {
                        if channel < MAX_CHANNELS {
                            frames[channel].extend(frame);
                        } else {
                            tracing::warn!(channel, "frame for unknown channel dropped");
                        }
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break,
            }
        }
        Ok(frames)
    }
}

/// Counters for ingest activity.
#[derive(Debug, Default)]
pub struct IngestStats {
    frames: AtomicU64,
    updates: AtomicU64,
    callback_tasks: AtomicU64,
    transport_errors: AtomicU64,
}

impl IngestStats {
    /// Non-empty frames received from the transport.
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Frames whose merge changed at least one table entry.
    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }

    /// Callback-evaluation tasks scheduled for subscribed channels.
    pub fn callback_tasks(&self) -> u64 {
        self.callback_tasks.load(Ordering::Relaxed)
    }

    /// Transport read failures (each followed by a short backoff).
    pub fn transport_errors(&self) -> u64 {
        self.transport_errors.load(Ordering::Relaxed)
    }
}

/// The dedicated ingest thread body.
pub struct IngestLoop {
    source: Box<dyn TelemetrySource>,
    table: Arc<ChannelTable>,
    registry: Arc<CallbackRegistry>,
    queue: Arc<TaskQueue>,
    running: Arc<AtomicBool>,
    period: Duration,
    backoff: Duration,
    stats: Arc<IngestStats>,
}

impl IngestLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Box<dyn TelemetrySource>,
        table: Arc<ChannelTable>,
        registry: Arc<CallbackRegistry>,
        queue: Arc<TaskQueue>,
        running: Arc<AtomicBool>,
        period: Duration,
        backoff: Duration,
        stats: Arc<IngestStats>,
    ) -> Self {
        Self {
            source,
            table,
            registry,
            queue,
            running,
            period,
            backoff,
            stats,
        }
    }

    /// Run until the service-wide stop flag clears.
    pub fn run(mut self) {
        tracing::info!("ingest loop started");
        while self.running.load(Ordering::SeqCst) {
            match self.source.read_frames() {
                Ok(frames) => self.process(frames),
                Err(e) => {
                    self.stats.transport_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %e, "telemetry read failed, backing off");
                    std::thread::sleep(self.backoff);
                }
            }
            std::thread::sleep(self.period);
        }
        tracing::info!("ingest loop exiting");
    }

    fn process(&self, frames: Vec<Frame>) {
        for (channel, frame) in frames.into_iter().enumerate() {
            if frame.is_empty() {
                continue;
            }
            self.stats.frames.fetch_add(1, Ordering::Relaxed);

            match self.table.update_from(channel, &frame) {
                Ok(changed) => {
                    if changed {
                        self.stats.updates.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Err(e) => {
                    tracing::warn!(channel, error = %e, "table update failed");
                    continue;
                }
            }

            self.queue.submit(Task::Filter {
                channel,
                snapshot: frame.clone(),
            });
            self.queue.submit(Task::Fit {
                channel,
                snapshot: frame,
            });

            match self.table.is_subscribed(channel) {
                Ok(true) => match self.registry.handles(channel) {
                    Ok(handles) => {
                        for handle in handles {
                            self.queue.submit(Task::CallbackEvaluation { channel, handle });
                            self.stats.callback_tasks.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    Err(e) => tracing::warn!(channel, error = %e, "callback scan failed"),
                },
                Ok(false) => {}
                Err(e) => tracing::warn!(channel, error = %e, "subscription check failed"),
            }
        }
    }
}
