//! # cycler-rs: multi-channel battery cycler control plane
//!
//! The application-processor side of a battery cycler: it drives up to
//! [`MAX_CHANNELS`] parallel electrochemical test channels by submitting
//! control commands (constant current, constant voltage, rest, off) to a
//! low-level driver on the companion real-time core, while continuously
//! ingesting the telemetry that core streams back.
//!
//! ## Architecture
//!
//! - **Dispatch**: a priority task queue drained by a configurable pool of
//!   worker threads; everything the service does runs as a task
//! - **Table**: a per-channel measurement table with atomic merge updates,
//!   consistent snapshots and derived metrics (dV/dt)
//! - **Registry**: per-channel ordered callbacks with opaque handles,
//!   evaluated as tasks whenever a subscribed channel receives data
//! - **Ingest**: a dedicated thread reading frames from the RPMsg
//!   character device (or an injected test source)
//! - **Service**: test procedures (CCCV and friends) composed from control
//!   tasks plus reactive callbacks over the table
//!
//! ## Data Flow
//!
//! ```text
//! RT core --[frames]--> IngestLoop --> ChannelTable
//!                            |              ^
//!                            v              | snapshot
//!                       TaskQueue --> worker threads --> callbacks
//!                            ^                               |
//!                            +---- control tasks ------------+
//!                                        |
//!                                        v
//!                                  ChannelDriver
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use cycler_rs::{CyclerConfig, CyclerService, DummyDriver, StepLimit};
//! use std::sync::Arc;
//!
//! fn main() -> cycler_rs::Result<()> {
//!     let driver = Arc::new(DummyDriver::new());
//!     let mut service = CyclerService::with_transport(driver, CyclerConfig::default())?;
//!
//!     // Charge channel 1 at 2 A until 4.2 V, then hold; stop on over-temperature.
//!     service.run_cccv(1, 2.0, 4.2, vec![StepLimit::rising("temperature", 45.0)])?;
//!
//!     // ... run until done ...
//!     service.shutdown();
//!     Ok(())
//! }
//! ```

pub mod analysis;
pub mod config;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod ingest;
pub mod registry;
pub mod service;
pub mod table;
pub mod types;

// Re-export commonly used types
pub use config::CyclerConfig;
pub use dispatch::{DispatchStats, Dispatcher, Task, TaskContext, TaskPriority, TaskQueue};
pub use driver::{ChannelDriver, DriverLimits, DriverOp, DummyDriver};
pub use error::{CyclerError, Result};
pub use ingest::{queue_source, FrameBatch, IngestStats, QueueSource, RpmsgSource, TelemetrySource};
pub use registry::{CallbackContext, CallbackHandle, CallbackRegistry};
pub use service::CyclerService;
pub use table::ChannelTable;
pub use types::{keys, Frame, LimitDirection, Snapshot, StepLimit, MAX_CHANNELS};
