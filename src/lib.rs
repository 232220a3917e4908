//! Dataverse Uplink
//!
//! This crate polls a vision service for frames, buffers them in memory and
//! uploads each one as a file into a Dataverse dataset.
//!
//! # Architecture
//!
//! The pipeline is built from three parts with narrow seams between them:
//!
//! 1. **Acquisition**: a `FrameSource` is polled once per cycle. Missing or
//!    unreadable frames are logged and skipped, never fatal.
//! 2. **Buffering**: a bounded `FrameBuffer` holds frames until the
//!    repository confirms them. When full, the oldest frame is evicted.
//! 3. **Upload**: a `RepositorySink` gets one attempt per item per drain.
//!    Rejected items stay buffered for the next cycle.
//!
//! A `CycleScheduler` drives the work on a fixed, drift-free period and skips
//! cycles that are already late rather than building a backlog.
//!
//! # Module Structure
//!
//! - `frame`: Frames, buffer items and the bounded buffer
//! - `schedule`: Cycle scheduler, clocks and stop signal
//! - `ingest`: Frame sources (vision service over HTTP, synthetic stub)
//! - `upload`: Repository sinks (Dataverse native API)
//! - `pipeline`: Worker wiring and start/stop lifecycle
//! - `config`: TOML + environment configuration

pub mod config;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod schedule;
pub mod upload;

pub use config::{PipelineMode, UplinkConfig};
pub use frame::{BufferItem, DrainOutcome, Frame, FrameBuffer, UploadState, DEFAULT_BUFFER_CAPACITY};
pub use ingest::{FetchResult, FrameSource, VisionApiConfig, VisionApiSource};
pub use pipeline::{
    CombinedCycle, PipelineController, PipelineCounters, PipelineSettings, PipelineShape,
    PipelineState, PipelineStats,
};
pub use schedule::{
    Clock, CycleClock, CycleScheduler, CycleStats, ManualClock, StopSignal, SystemClock, Tick,
    CATCH_UP_TOLERANCE,
};
pub use upload::{DataverseConfig, DataverseSink, RepositorySink};
