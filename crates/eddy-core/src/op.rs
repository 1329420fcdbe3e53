//! Collective operation descriptors.
//!
//! The engine never looks inside a collective; it drives descriptors
//! through their pipeline purely via the [`CollectiveOp`] capability set.
//! Concrete collectives (allreduce, broadcast, ...) live outside this
//! crate and are submitted as `Box<dyn CollectiveOp>`.

/// Identifies a compute stream.
///
/// A compute stream is an opaque handle for a logical serial ordering of
/// GPU work. Operations submitted on the same stream complete in
/// submission order; operations on different streams are unordered with
/// respect to each other.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct StreamId(pub u64);

impl StreamId {
    /// The default compute stream.
    pub const DEFAULT: StreamId = StreamId(0);
}

/// Whether an operation counts against the global concurrency cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunType {
    /// Counts against the engine's bounded-operation cap.
    Bounded,
    /// Always admitted; never counted.
    Unbounded,
}

/// The outcome of one cooperative [`CollectiveOp::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    /// No state change; step again next tick.
    Continue,
    /// Ready for the next pipeline stage.
    Advance,
    /// Finished; the engine destroys the descriptor.
    Complete,
}

/// Capability set the engine requires of a collective operation.
///
/// Ownership transfers to the engine on enqueue; the descriptor is dropped
/// by the worker when `step` returns [`StepAction::Complete`]. After
/// enqueue only the worker touches the descriptor, so implementations need
/// `Send` but never `Sync`.
///
/// `step` must not block: it either makes progress and returns
/// [`StepAction::Continue`], requests promotion with
/// [`StepAction::Advance`], or signals [`StepAction::Complete`].
pub trait CollectiveOp: Send {
    /// Whether this operation counts against the bounded-operation cap.
    fn run_type(&self) -> RunType;

    /// The compute stream this operation is ordered on.
    fn stream(&self) -> StreamId;

    /// Admission hook, called exactly once when the descriptor enters the
    /// first pipeline stage, before the first `step`.
    fn start(&mut self) {}

    /// Advances the operation by one cooperative step.
    fn step(&mut self) -> StepAction;

    /// Short name for diagnostics.
    fn name(&self) -> &str {
        "collective"
    }

    /// One-line description for diagnostics.
    fn describe(&self) -> String {
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Minimal;

    impl CollectiveOp for Minimal {
        fn run_type(&self) -> RunType {
            RunType::Unbounded
        }

        fn stream(&self) -> StreamId {
            StreamId::DEFAULT
        }

        fn step(&mut self) -> StepAction {
            StepAction::Complete
        }
    }

    #[test]
    fn test_trait_defaults() {
        let mut op = Minimal;
        op.start();
        assert_eq!(op.name(), "collective");
        assert!(op.describe().is_empty());
        assert_eq!(op.step(), StepAction::Complete);
    }

    #[test]
    fn test_stream_id_is_map_key() {
        use std::collections::HashMap;
        let mut map = HashMap::new();
        map.insert(StreamId(7), "a");
        map.insert(StreamId::DEFAULT, "b");
        assert_eq!(map.get(&StreamId(7)), Some(&"a"));
        assert_eq!(map.get(&StreamId(0)), Some(&"b"));
    }
}
