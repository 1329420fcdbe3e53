//! Per-stream execution pipelines.
//!
//! Each compute stream with admitted work owns a [`Pipeline`]: an array of
//! [`NUM_PIPELINE_STAGES`] FIFO stages. Within a stage, descriptor order
//! is submission order, and promotion to the next stage happens only from
//! the head; a non-head descriptor that requests promotion is paused in
//! place until everything ahead of it has moved. That is what keeps
//! per-stream completion initiation in submission order.
//!
//! The pipeline is owned and mutated by the worker thread only.

use std::collections::VecDeque;
use std::io;
use std::time::{Duration, Instant};

use crate::config::NUM_PIPELINE_STAGES;
use crate::op::{CollectiveOp, RunType, StepAction, StreamId};
use crate::trace;

/// Worker-side settings consulted on every tick.
pub(crate) struct TickSettings {
    pub(crate) hang_check: bool,
    pub(crate) trace: bool,
    pub(crate) local_rank: usize,
}

/// An admitted descriptor plus the bookkeeping only the worker touches.
pub(crate) struct InFlight {
    op: Box<dyn CollectiveOp>,
    paused_for_advance: bool,
    started_at: Instant,
    hang_reported: bool,
}

impl InFlight {
    fn new(op: Box<dyn CollectiveOp>) -> Self {
        Self {
            op,
            paused_for_advance: false,
            started_at: Instant::now(),
            hang_reported: false,
        }
    }

    /// One-shot diagnostic for a descriptor that keeps returning
    /// [`StepAction::Continue`] long past admission. The threshold is
    /// staggered by local rank so co-located processes do not report in
    /// unison.
    fn maybe_report_hang(&mut self, local_rank: usize) {
        if self.hang_reported {
            return;
        }
        let limit = Duration::from_secs(10 + local_rank as u64);
        if self.started_at.elapsed() > limit {
            tracing::warn!(
                name = self.op.name(),
                stream = self.op.stream().0,
                run_type = ?self.op.run_type(),
                "progress engine detected a possible hang"
            );
            self.hang_reported = true;
        }
    }
}

/// The ordered stage array for one compute stream.
pub(crate) struct Pipeline {
    stages: [VecDeque<InFlight>; NUM_PIPELINE_STAGES],
}

impl Default for Pipeline {
    fn default() -> Self {
        Self {
            stages: std::array::from_fn(|_| VecDeque::new()),
        }
    }
}

impl Pipeline {
    /// Admits a descriptor into the first stage and fires its admission
    /// hook.
    pub(crate) fn admit(&mut self, op: Box<dyn CollectiveOp>, trace_enabled: bool) {
        let mut entry = InFlight::new(op);
        entry.op.start();
        if trace_enabled {
            trace::record_start(entry.op.as_ref());
        }
        self.stages[0].push_back(entry);
    }

    /// Whether stage `stage` currently holds no descriptors.
    pub(crate) fn stage_is_empty(&self, stage: usize) -> bool {
        self.stages[stage].is_empty()
    }

    /// Whether every stage is empty.
    pub(crate) fn is_empty(&self) -> bool {
        self.stages.iter().all(VecDeque::is_empty)
    }

    /// The number of descriptors across all stages.
    pub(crate) fn in_flight(&self) -> usize {
        self.stages.iter().map(VecDeque::len).sum()
    }

    /// Steps every non-paused descriptor once, stage by stage.
    ///
    /// Walking a stage front-to-back: `Continue` leaves the descriptor in
    /// place, `Advance` promotes the head immediately and pauses anyone
    /// else, `Complete` destroys the descriptor (decrementing
    /// `num_bounded` for bounded operations). After the walk, paused
    /// descriptors that have reached the head are promoted in order, so a
    /// pause never outlives the head that caused it.
    ///
    /// # Panics
    ///
    /// Panics if a descriptor requests `Advance` out of the final stage;
    /// that is a fatal misuse of the pipeline by the collective.
    pub(crate) fn tick(&mut self, num_bounded: &mut usize, settings: &TickSettings) {
        for stage_index in 0..NUM_PIPELINE_STAGES {
            let (current, rest) = self.stages.split_at_mut(stage_index + 1);
            let stage = &mut current[stage_index];
            let mut next = rest.first_mut();

            let mut i = 0;
            while i < stage.len() {
                if stage[i].paused_for_advance {
                    i += 1;
                    continue;
                }
                match stage[i].op.step() {
                    StepAction::Continue => {
                        if settings.hang_check {
                            stage[i].maybe_report_hang(settings.local_rank);
                        }
                        i += 1;
                    }
                    StepAction::Advance => match next.as_deref_mut() {
                        None => {
                            panic!("collective requested advance past the final pipeline stage")
                        }
                        Some(next_stage) if i == 0 => {
                            if let Some(entry) = stage.pop_front() {
                                next_stage.push_back(entry);
                            }
                        }
                        Some(_) => {
                            stage[i].paused_for_advance = true;
                            i += 1;
                        }
                    },
                    StepAction::Complete => {
                        if let Some(done) = stage.remove(i) {
                            if done.op.run_type() == RunType::Bounded {
                                *num_bounded -= 1;
                            }
                            if settings.trace {
                                trace::record_done(done.op.as_ref());
                            }
                        }
                    }
                }
            }

            // Promote paused descriptors that have reached the head, in
            // order, stopping at the first non-paused head.
            while stage.front().is_some_and(|entry| entry.paused_for_advance) {
                let Some(mut entry) = stage.pop_front() else {
                    break;
                };
                entry.paused_for_advance = false;
                match next.as_deref_mut() {
                    Some(next_stage) => next_stage.push_back(entry),
                    None => unreachable!("paused descriptor in the final pipeline stage"),
                }
            }
        }
    }

    /// Writes the per-stage contents for diagnostics.
    pub(crate) fn dump<W: io::Write>(&self, stream: StreamId, writer: &mut W) -> io::Result<()> {
        writeln!(writer, "pipelined run queue for stream {}:", stream.0)?;
        for (index, stage) in self.stages.iter().enumerate() {
            writeln!(writer, "  stage {index} ({}):", stage.len())?;
            for (i, entry) in stage.iter().enumerate() {
                writeln!(
                    writer,
                    "    {i}: {} {}",
                    entry.op.name(),
                    entry.op.describe()
                )?;
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn stage_names(&self, stage: usize) -> Vec<String> {
        self.stages[stage]
            .iter()
            .map(|entry| entry.op.name().to_string())
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn is_paused(&self, stage: usize, index: usize) -> bool {
        self.stages[stage][index].paused_for_advance
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Scripted {
        label: &'static str,
        stream: StreamId,
        run_type: RunType,
        script: VecDeque<StepAction>,
        completions: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Scripted {
        fn new(
            label: &'static str,
            run_type: RunType,
            script: &[StepAction],
            completions: &Arc<Mutex<Vec<&'static str>>>,
        ) -> Box<Self> {
            Box::new(Self {
                label,
                stream: StreamId(1),
                run_type,
                script: script.iter().copied().collect(),
                completions: Arc::clone(completions),
            })
        }
    }

    impl CollectiveOp for Scripted {
        fn run_type(&self) -> RunType {
            self.run_type
        }

        fn stream(&self) -> StreamId {
            self.stream
        }

        fn step(&mut self) -> StepAction {
            let action = self.script.pop_front().unwrap_or(StepAction::Complete);
            if action == StepAction::Complete {
                self.completions.lock().unwrap().push(self.label);
            }
            action
        }

        fn name(&self) -> &str {
            self.label
        }
    }

    fn settings() -> TickSettings {
        TickSettings {
            hang_check: false,
            trace: false,
            local_rank: 0,
        }
    }

    fn completions() -> Arc<Mutex<Vec<&'static str>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    use StepAction::{Advance, Complete, Continue};

    #[test]
    fn test_head_advances_immediately() {
        let log = completions();
        let mut pipeline = Pipeline::default();
        let mut bounded = 0;
        pipeline.admit(
            Scripted::new("d1", RunType::Unbounded, &[Advance, Continue], &log),
            false,
        );

        pipeline.tick(&mut bounded, &settings());

        assert!(pipeline.stage_is_empty(0));
        assert_eq!(pipeline.stage_names(1), vec!["d1"]);
    }

    #[test]
    fn test_non_head_advance_pauses_then_promotes_in_order() {
        let log = completions();
        let mut pipeline = Pipeline::default();
        let mut bounded = 0;
        pipeline.admit(
            Scripted::new(
                "a",
                RunType::Unbounded,
                &[Continue, Advance, Continue, Continue],
                &log,
            ),
            false,
        );
        pipeline.admit(
            Scripted::new("c", RunType::Unbounded, &[Advance, Continue, Continue], &log),
            false,
        );

        // c requests promotion while a (the head) continues: c pauses.
        pipeline.tick(&mut bounded, &settings());
        assert_eq!(pipeline.stage_names(0), vec!["a", "c"]);
        assert!(!pipeline.is_paused(0, 0));
        assert!(pipeline.is_paused(0, 1));

        // a advances; the paused c follows within the same tick, behind a.
        pipeline.tick(&mut bounded, &settings());
        assert!(pipeline.stage_is_empty(0));
        assert_eq!(pipeline.stage_names(1), vec!["a", "c"]);
        assert!(!pipeline.is_paused(1, 1));
    }

    #[test]
    fn test_paused_descriptor_is_not_stepped() {
        let log = completions();
        let mut pipeline = Pipeline::default();
        let mut bounded = 0;
        pipeline.admit(
            Scripted::new("a", RunType::Unbounded, &[Continue, Continue], &log),
            false,
        );
        // One Advance then empty script: a further step would complete it.
        pipeline.admit(
            Scripted::new("c", RunType::Unbounded, &[Advance], &log),
            false,
        );

        pipeline.tick(&mut bounded, &settings());
        pipeline.tick(&mut bounded, &settings());

        // c was skipped while paused, so it never completed.
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(pipeline.stage_names(0), vec!["a", "c"]);
    }

    #[test]
    fn test_multi_stage_transit_and_completion_order() {
        let log = completions();
        let mut pipeline = Pipeline::default();
        let mut bounded = 2;
        pipeline.admit(
            Scripted::new("d1", RunType::Bounded, &[Advance, Advance, Complete], &log),
            false,
        );
        pipeline.admit(
            Scripted::new("d2", RunType::Bounded, &[Continue, Complete], &log),
            false,
        );

        // d1 rides the stage walk all the way out in one tick; d2 stays.
        pipeline.tick(&mut bounded, &settings());
        assert_eq!(*log.lock().unwrap(), vec!["d1"]);
        assert_eq!(pipeline.stage_names(0), vec!["d2"]);
        assert_eq!(bounded, 1);

        pipeline.tick(&mut bounded, &settings());
        assert_eq!(*log.lock().unwrap(), vec!["d1", "d2"]);
        assert!(pipeline.is_empty());
        assert_eq!(bounded, 0);
    }

    #[test]
    fn test_same_script_completes_in_submission_order() {
        let log = completions();
        let mut pipeline = Pipeline::default();
        let mut bounded = 0;
        for label in ["a", "b", "c"] {
            pipeline.admit(
                Scripted::new(
                    label,
                    RunType::Unbounded,
                    &[Continue, Continue, Complete],
                    &log,
                ),
                false,
            );
        }

        for _ in 0..3 {
            pipeline.tick(&mut bounded, &settings());
        }
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
        assert!(pipeline.is_empty());
    }

    #[test]
    fn test_unbounded_completion_keeps_counter() {
        let log = completions();
        let mut pipeline = Pipeline::default();
        let mut bounded = 3;
        pipeline.admit(
            Scripted::new("u", RunType::Unbounded, &[Complete], &log),
            false,
        );
        pipeline.tick(&mut bounded, &settings());
        assert_eq!(bounded, 3);
    }

    #[test]
    #[should_panic(expected = "advance past the final pipeline stage")]
    fn test_advance_past_last_stage_is_fatal() {
        let log = completions();
        let mut pipeline = Pipeline::default();
        let mut bounded = 0;
        pipeline.admit(
            Scripted::new("d", RunType::Unbounded, &[Advance, Advance, Advance], &log),
            false,
        );
        pipeline.tick(&mut bounded, &settings());
    }

    #[test]
    fn test_hang_report_is_one_shot() {
        let log = completions();
        let mut pipeline = Pipeline::default();
        let mut bounded = 0;
        pipeline.admit(
            Scripted::new(
                "slow",
                RunType::Unbounded,
                &[Continue, Continue, Continue],
                &log,
            ),
            false,
        );
        // Backdate admission past the report threshold.
        if let Some(start) = Instant::now().checked_sub(Duration::from_secs(11)) {
            pipeline.stages[0][0].started_at = start;
        } else {
            return; // System clock too young to backdate; nothing to test.
        }

        let hang_settings = TickSettings {
            hang_check: true,
            trace: false,
            local_rank: 0,
        };
        pipeline.tick(&mut bounded, &hang_settings);
        assert!(pipeline.stages[0][0].hang_reported);
        pipeline.tick(&mut bounded, &hang_settings);
        assert!(pipeline.stages[0][0].hang_reported);
    }

    #[test]
    fn test_hang_threshold_respects_local_rank() {
        let log = completions();
        let mut pipeline = Pipeline::default();
        let mut bounded = 0;
        pipeline.admit(
            Scripted::new("slow", RunType::Unbounded, &[Continue, Continue], &log),
            false,
        );
        // 12s elapsed is past rank 0's 10s threshold but not rank 5's 15s.
        if let Some(start) = Instant::now().checked_sub(Duration::from_secs(12)) {
            pipeline.stages[0][0].started_at = start;
        } else {
            return;
        }

        let rank5 = TickSettings {
            hang_check: true,
            trace: false,
            local_rank: 5,
        };
        pipeline.tick(&mut bounded, &rank5);
        assert!(!pipeline.stages[0][0].hang_reported);
    }

    #[test]
    fn test_dump_lists_stages() {
        let log = completions();
        let mut pipeline = Pipeline::default();
        pipeline.admit(
            Scripted::new("d1", RunType::Unbounded, &[Continue], &log),
            false,
        );

        let mut out = Vec::new();
        pipeline.dump(StreamId(1), &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("stream 1"));
        assert!(text.contains("stage 0 (1)"));
        assert!(text.contains("d1"));
    }
}
