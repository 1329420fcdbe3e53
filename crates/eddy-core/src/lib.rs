//! # Eddy Core
//!
//! The asynchronous progress engine for a GPU-aware collective-communication
//! library.
//!
//! User threads submit descriptors of in-flight collective operations
//! (allreduce, broadcast, ...) from many compute streams; a dedicated
//! background worker drives each descriptor through a bounded multi-stage
//! pipeline until completion, without blocking the submitter and while
//! preserving per-stream ordering.
//!
//! ## Architecture
//!
//! ```text
//! user threads ──enqueue──► per-stream SPSC queues ──┐
//!                                                    │ admission
//!                                              ┌─────▼──────┐
//!                                              │   worker   │  one pinned
//!                                              │  spin loop │  OS thread
//!                                              └─────┬──────┘
//!                                  per-stream K-stage pipelines
//!                                  (FIFO within a stream, cooperative
//!                                   `step()` dispatch across streams)
//! ```
//!
//! ## Design Principles
//!
//! 1. **Lock-light submission** - the hot path is a published-prefix scan
//!    plus a lock-free SPSC push; a mutex is taken only to register a new
//!    stream
//! 2. **Single consumer** - the worker is the sole mutator of all admitted
//!    descriptors, so pipeline advancement needs no synchronization
//! 3. **Per-stream FIFO** - descriptors sharing a compute stream are
//!    admitted, advanced, and completed strictly in submission order
//! 4. **Topology aware** - co-located processes negotiate distinct cores
//!    for their progress threads via a collective bitmap exchange
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicBool, Ordering};
//! use eddy_core::{CollectiveOp, EngineConfig, ProgressEngine, RunType, StepAction, StreamId};
//!
//! struct Noop(StreamId, Arc<AtomicBool>);
//!
//! impl CollectiveOp for Noop {
//!     fn run_type(&self) -> RunType { RunType::Bounded }
//!     fn stream(&self) -> StreamId { self.0 }
//!     fn step(&mut self) -> StepAction {
//!         self.1.store(true, Ordering::Release);
//!         StepAction::Complete
//!     }
//! }
//!
//! let engine = ProgressEngine::new(EngineConfig::default()).unwrap();
//! let done = Arc::new(AtomicBool::new(false));
//! engine.enqueue(Box::new(Noop(StreamId(1), Arc::clone(&done)))).unwrap();
//! while !done.load(Ordering::Acquire) {
//!     std::thread::yield_now();
//! }
//! engine.stop().unwrap();
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
// Unsafe is confined to the submission-queue ring and the worker-owned
// state cell.
#![allow(unsafe_code)]

pub mod comm;
pub mod config;
pub mod device;
pub mod engine;
pub mod op;
pub mod queue;
pub mod topology;

mod pipeline;
mod registry;
mod trace;

pub use comm::{LocalComm, SoloComm};
pub use config::{EngineConfig, EngineConfigBuilder};
pub use device::{DeviceId, DeviceRuntime, NoDevice};
pub use engine::{EngineError, ProgressEngine};
pub use op::{CollectiveOp, RunType, StepAction, StreamId};
pub use topology::{CpuSet, Topology, TopologyError};

/// Result type for eddy-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for eddy-core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Progress engine errors
    #[error("engine error: {0}")]
    Engine(#[from] engine::EngineError),

    /// Topology discovery and binding errors
    #[error("topology error: {0}")]
    Topology(#[from] topology::TopologyError),
}
