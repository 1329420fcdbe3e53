//! Per-operation trace hooks.
//!
//! Optional observers of descriptor lifetimes, emitted as `tracing` events
//! when [`EngineConfig::trace`](crate::EngineConfig) is set. They never
//! affect scheduling.

use crate::op::CollectiveOp;

/// Records a descriptor entering its pipeline.
pub(crate) fn record_start(op: &dyn CollectiveOp) {
    tracing::trace!(
        target: "eddy_core::trace",
        name = op.name(),
        stream = op.stream().0,
        run_type = ?op.run_type(),
        "collective admitted"
    );
}

/// Records a descriptor completing.
pub(crate) fn record_done(op: &dyn CollectiveOp) {
    tracing::trace!(
        target: "eddy_core::trace",
        name = op.name(),
        stream = op.stream().0,
        "collective completed"
    );
}
