//! The progress engine.
//!
//! One [`ProgressEngine`] owns the submission path, the stream registry,
//! and a single worker thread. User threads hand descriptors to
//! [`enqueue`](ProgressEngine::enqueue), which routes them to a per-stream
//! input queue without ever waiting on the worker. The worker spin-polls:
//! each iteration admits newly submitted descriptors (subject to the
//! bounded-operation cap) and then steps every pipeline.
//!
//! ## Worker iteration
//!
//! 1. **Admission** - peek every published input queue; admit unbounded
//!    descriptors unconditionally, bounded ones while under the cap or
//!    whenever their stream's first stage is empty (the cap must never
//!    starve a stream's head-of-line)
//! 2. **Advancement** - [`Pipeline::tick`] every stream with work
//!
//! The worker is the sole mutator of the run queues and of every admitted
//! descriptor, so the whole advancement phase is lock-free by
//! construction.

use std::cell::UnsafeCell;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};

use fxhash::FxHashMap;
use parking_lot::{Condvar, Mutex};

use crate::comm::{LocalComm, SoloComm};
use crate::config::{EngineConfig, NUM_STREAMS};
use crate::device::{DeviceId, DeviceRuntime, NoDevice};
use crate::op::{CollectiveOp, RunType, StreamId};
use crate::pipeline::{Pipeline, TickSettings};
use crate::registry::StreamRegistry;
use crate::topology;

/// Errors from the progress engine's host-facing paths.
///
/// These are all fatal configuration or lifecycle errors; the engine has
/// no recoverable producer errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// `stop` was called on an engine that had already stopped.
    #[error("stop called twice on progress engine")]
    StopTwice,

    /// More distinct compute streams than the registry supports.
    #[error("more compute streams than the engine supports ({capacity})")]
    StreamCapacity {
        /// The compile-time stream capacity.
        capacity: usize,
    },

    /// A per-stream input queue overflowed; the descriptor was dropped.
    #[error("input queue full for stream {stream:?}")]
    QueueFull {
        /// The stream whose queue overflowed.
        stream: StreamId,
    },

    /// The worker thread could not be spawned.
    #[error("failed to spawn progress thread: {0}")]
    SpawnFailed(String),

    /// The configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// State owned exclusively by the worker thread.
#[derive(Default)]
struct WorkerState {
    /// Per-stream pipelines, created at first admission.
    run_queues: FxHashMap<StreamId, Pipeline>,
    /// In-flight bounded descriptors.
    num_bounded: usize,
}

/// State shared between the host-facing handle and the worker thread.
struct Shared {
    config: EngineConfig,
    registry: StreamRegistry,
    /// Worker-exclusive state. Host-side access is limited to
    /// [`ProgressEngine::dump_state`], which is unsafe by contract.
    worker: UnsafeCell<WorkerState>,
    stop: AtomicBool,
    started: AtomicBool,
    doing_start: AtomicBool,
    startup: Mutex<bool>,
    startup_cv: Condvar,
    core_to_bind: i32,
    device: Option<DeviceId>,
    devices: Arc<dyn DeviceRuntime>,
    local_rank: usize,
}

// SAFETY: the UnsafeCell is the only non-Sync field. The worker thread is
// its sole mutator for the engine's lifetime; the one shared read path
// (dump_state) is an unsafe fn whose contract forbids concurrent use.
unsafe impl Sync for Shared {}

/// The asynchronous progress engine.
///
/// Construct once per process, submit descriptors from any thread with
/// [`enqueue`](Self::enqueue), and shut down with [`stop`](Self::stop)
/// after draining. See the crate docs for an end-to-end example.
pub struct ProgressEngine {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ProgressEngine {
    /// Creates an engine for a process running alone on its node with no
    /// GPU runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the topology
    /// interface version check fails.
    pub fn new(config: EngineConfig) -> crate::Result<Self> {
        Self::with_runtime(config, Arc::new(SoloComm), Arc::new(NoDevice))
    }

    /// Creates an engine wired to a node-local communicator and a GPU
    /// runtime.
    ///
    /// Captures the calling thread's current device and runs the
    /// collective core-assignment handshake; binding failures leave the
    /// worker unbound but the engine functional.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the topology
    /// interface version check fails.
    pub fn with_runtime(
        config: EngineConfig,
        comm: Arc<dyn LocalComm>,
        devices: Arc<dyn DeviceRuntime>,
    ) -> crate::Result<Self> {
        config
            .validate()
            .map_err(EngineError::InvalidConfig)?;

        let device = devices.current_device();
        let core_to_bind = topology::bind_init(comm.as_ref(), devices.as_ref(), device)?;

        let registry = StreamRegistry::new(config.input_queue_depth);
        if config.register_default_stream {
            let _ = registry.lookup_or_create(StreamId::DEFAULT);
        }

        let shared = Arc::new(Shared {
            local_rank: comm.local_rank(),
            config,
            registry,
            worker: UnsafeCell::new(WorkerState::default()),
            stop: AtomicBool::new(false),
            started: AtomicBool::new(false),
            doing_start: AtomicBool::new(false),
            startup: Mutex::new(false),
            startup_cv: Condvar::new(),
            core_to_bind,
            device,
            devices,
        });

        Ok(Self {
            shared,
            thread: Mutex::new(None),
        })
    }

    /// The process-wide engine, constructed with defaults on first use.
    ///
    /// # Panics
    ///
    /// Panics if first-use construction hits a fatal configuration error.
    pub fn global() -> &'static ProgressEngine {
        static GLOBAL: OnceLock<ProgressEngine> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            ProgressEngine::new(EngineConfig::default())
                .expect("progress engine construction failed")
        })
    }

    /// Submits a descriptor. Never blocks on the worker.
    ///
    /// Ownership transfers to the engine; the worker drops the descriptor
    /// on completion. Submissions on one stream from one thread complete
    /// in submission order.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::StreamCapacity`] for a new stream beyond the
    /// registry capacity, [`EngineError::QueueFull`] if the stream's input
    /// queue overflows (the descriptor is dropped), or a spawn error from
    /// an on-demand start.
    pub fn enqueue(&self, op: Box<dyn CollectiveOp>) -> Result<(), EngineError> {
        if self.shared.config.start_on_demand && !self.shared.started.load(Ordering::Acquire) {
            self.run()?;
        }
        debug_assert!(
            !self.shared.stop.load(Ordering::Acquire),
            "enqueue after stop"
        );

        let stream = op.stream();
        let use_cache = self.shared.config.stream_queue_cache;
        let cached = if use_cache {
            self.shared.registry.cached(stream)
        } else {
            None
        };
        let index = match cached {
            Some(index) => index,
            None => {
                let index = self
                    .shared
                    .registry
                    .lookup_or_create(stream)
                    .ok_or(EngineError::StreamCapacity {
                        capacity: NUM_STREAMS,
                    })?;
                if use_cache {
                    self.shared.registry.remember(stream, index);
                }
                index
            }
        };

        self.shared
            .registry
            .push(index, op, self.shared.config.multi_thread_submission)
            .map_err(|_| EngineError::QueueFull { stream })?;
        Ok(())
    }

    /// Starts the worker thread.
    ///
    /// Idempotent: the first caller spawns and waits for the worker to
    /// come up; racing callers wait on the same startup notification.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::SpawnFailed`] if the OS refuses the thread.
    pub fn run(&self) -> Result<(), EngineError> {
        let mut started = self.shared.startup.lock();
        if *started {
            return Ok(());
        }
        if self.shared.doing_start.swap(true, Ordering::AcqRel) {
            // Another thread is starting the worker.
            self.shared.startup_cv.wait_while(&mut started, |s| !*s);
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("eddy-progress".to_string())
            .spawn(move || worker_main(&shared))
            .map_err(|e| EngineError::SpawnFailed(e.to_string()))?;
        *self.thread.lock() = Some(handle);

        self.shared.startup_cv.wait_while(&mut started, |s| !*s);
        Ok(())
    }

    /// Stops the worker and joins it.
    ///
    /// A no-op if the worker never started. Descriptors still in flight
    /// are the caller's responsibility: the engine drops them when it is
    /// itself dropped, and never force-completes them.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::StopTwice`] if the engine already stopped.
    ///
    /// # Panics
    ///
    /// Re-raises a panic that escaped the worker thread (a fatal pipeline
    /// misuse).
    pub fn stop(&self) -> Result<(), EngineError> {
        if !self.shared.started.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.shared.stop.load(Ordering::Acquire) {
            return Err(EngineError::StopTwice);
        }
        self.shared.stop.store(true, Ordering::Release);
        if let Some(handle) = self.thread.lock().take() {
            if let Err(panic) = handle.join() {
                std::panic::resume_unwind(panic);
            }
        }
        Ok(())
    }

    /// Whether the worker has started.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.shared.started.load(Ordering::Acquire)
    }

    /// The core picked for the worker by the topology handshake; `-1`
    /// means the worker runs unbound.
    #[must_use]
    pub fn core_to_bind(&self) -> i32 {
        self.shared.core_to_bind
    }

    /// Writes every stream's pipeline contents for diagnostics.
    ///
    /// # Safety
    ///
    /// Reads the worker's state without synchronization. Only call while
    /// the worker is quiescent (before `run` or after `stop`); calling
    /// concurrently with a running worker is a data race.
    ///
    /// # Errors
    ///
    /// Propagates writer errors.
    pub unsafe fn dump_state<W: io::Write>(&self, writer: &mut W) -> io::Result<()> {
        let state = &*self.shared.worker.get();
        for (stream, pipeline) in &state.run_queues {
            pipeline.dump(*stream, writer)?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn registry_published(&self) -> usize {
        self.shared.registry.published()
    }

    /// (bounded in flight, total descriptors in flight)
    #[cfg(test)]
    pub(crate) unsafe fn worker_snapshot(&self) -> (usize, usize) {
        let state = &*self.shared.worker.get();
        (
            state.num_bounded,
            state.run_queues.values().map(Pipeline::in_flight).sum(),
        )
    }
}

impl Drop for ProgressEngine {
    fn drop(&mut self) {
        if self.shared.started.load(Ordering::Acquire) {
            self.shared.stop.store(true, Ordering::Release);
        }
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for ProgressEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressEngine")
            .field("started", &self.is_started())
            .field("core_to_bind", &self.shared.core_to_bind)
            .field("streams", &self.shared.registry.published())
            .finish_non_exhaustive()
    }
}

/// The worker thread's entry point.
fn worker_main(shared: &Shared) {
    if let Some(device) = shared.device {
        shared.devices.set_device(device);
    }
    topology::bind(
        shared.core_to_bind,
        shared.local_rank,
        shared.devices.as_ref(),
        shared.device,
    );

    {
        let mut started = shared.startup.lock();
        *started = true;
        shared.started.store(true, Ordering::Release);
    }
    shared.startup_cv.notify_all();
    tracing::debug!(core = shared.core_to_bind, "progress engine worker running");

    let settings = TickSettings {
        hang_check: shared.config.hang_check,
        trace: shared.config.trace,
        local_rank: shared.local_rank,
    };

    // SAFETY: the worker thread is the sole mutator of the state cell for
    // the lifetime of the engine (see Shared).
    let state = unsafe { &mut *shared.worker.get() };
    while !shared.stop.load(Ordering::Acquire) {
        admit_submissions(shared, state);

        let WorkerState {
            run_queues,
            num_bounded,
        } = &mut *state;
        for pipeline in run_queues.values_mut() {
            pipeline.tick(num_bounded, &settings);
        }
    }

    let leftover: usize = state.run_queues.values().map(Pipeline::in_flight).sum();
    if leftover > 0 {
        tracing::debug!(leftover, "progress engine stopped with descriptors in flight");
    }
}

/// Admission phase: drain eligible heads of every published input queue
/// into their stream's pipeline.
fn admit_submissions(shared: &Shared, state: &mut WorkerState) {
    let published = shared.registry.published();
    for index in 0..published {
        let slot = shared.registry.slot(index);
        let Some(op) = slot.queue.peek() else {
            continue;
        };
        let stream = op.stream();
        let run_type = op.run_type();
        let admit = match run_type {
            RunType::Unbounded => true,
            RunType::Bounded => admit_bounded(
                state.num_bounded,
                shared.config.max_concurrent_bounded,
                state.run_queues.get(&stream),
            ),
        };
        if !admit {
            continue;
        }

        if run_type == RunType::Bounded {
            state.num_bounded += 1;
        }
        let op = slot.queue.pop_always();
        state
            .run_queues
            .entry(stream)
            .or_default()
            .admit(op, shared.config.trace);
    }
}

/// A bounded descriptor is admitted while under the cap, and always when
/// its stream has no pipeline yet or an empty first stage: the cap bounds
/// aggregate concurrency but must never leave a stream's head parked
/// behind other streams' work.
fn admit_bounded(num_bounded: usize, cap: usize, pipeline: Option<&Pipeline>) -> bool {
    num_bounded < cap || pipeline.map_or(true, |p| p.stage_is_empty(0))
}
