//! APM Telemetry Reporter Library
//!
//! Buffers trace segments, logs, meters and profiling snapshots produced by
//! instrumentation and ships them to a remote collector. Producers never block:
//! every record kind has a bounded queue, and each reporting duty runs in its
//! own background loop with exponential backoff. Stopping the reporter flushes
//! what was buffered before shutdown began.

pub mod backoff;
pub mod buffer;
pub mod command;
pub mod config;
pub mod errors;
pub mod identity;
pub mod reporter;
pub mod telemetry;
pub mod transport;

pub use backoff::{BackoffRunner, ReporterState, ShutdownSignal};
pub use buffer::BoundedQueue;
pub use command::{Command, CommandDispatcher, CommandService, ProfileTask};
pub use config::{Config, Protocol};
pub use errors::{ReporterError, Result};
pub use identity::{InstanceIdentity, SharedIdentity};
pub use reporter::{Phase, ReporterStatus, ReporterSupervisor};
pub use telemetry::{LogEntry, MeterData, ProfileSnapshot, Segment, Span, TelemetryRecord};
pub use transport::{HttpTransport, Transport};
