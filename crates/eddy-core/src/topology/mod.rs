//! # CPU Topology
//!
//! Discovers the machine's PU/core/NUMA layout and negotiates a distinct
//! core per co-located process for the progress thread.
//!
//! Detection cascade:
//! 1. hwloc via the `hwlocality` crate (if the `hwloc` feature is enabled)
//! 2. sysfs parsing on Linux (fallback)
//! 3. Flat single-node fallback on other platforms
//!
//! ## Components
//!
//! - [`CpuSet`] - a set of logical CPUs as a bit vector over machine words
//! - [`Topology`] - the probed PU/core/NUMA model plus thread binding
//! - `binder` (crate-internal) - the collective core-assignment handshake

mod binder;
mod cpuset;
mod probe;

pub(crate) use binder::{bind, bind_init};
pub use cpuset::CpuSet;
pub use probe::Topology;

/// Errors from topology discovery and thread binding.
///
/// Only [`TopologyError::VersionMismatch`] is fatal to engine
/// construction; every other failure downgrades to a diagnostic and an
/// unbound progress thread.
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    /// The loaded topology interface does not match the version this crate
    /// was compiled against.
    #[error(
        "topology interface version {runtime}.{runtime_minor} does not match \
         the version compiled against ({compiled}.{compiled_minor})"
    )]
    VersionMismatch {
        /// Runtime major version
        runtime: u32,
        /// Runtime minor version
        runtime_minor: u32,
        /// Compiled-against major version
        compiled: u32,
        /// Compiled-against minor version
        compiled_minor: u32,
    },

    /// Tried to serialize an unbounded CPU set for exchange.
    #[error("tried to exchange an infinite cpu set")]
    InfiniteCpuSet,

    /// Topology detection failed.
    #[error("topology probe failed: {0}")]
    Probe(String),

    /// Binding the calling thread failed.
    #[error("thread binding failed: {0}")]
    BindFailed(String),

    /// Thread binding is not available on this platform.
    #[error("thread binding not supported on this platform")]
    NotSupported,
}
