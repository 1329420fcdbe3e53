//! Progress engine tunables.
//!
//! Numeric limits are compile-time constants; the switches that the engine
//! honors for its whole lifetime live in [`EngineConfig`], fixed at
//! construction. Nothing here can be changed while the worker runs.

/// Maximum number of distinct compute streams a single engine can serve.
///
/// The stream registry is a fixed array of this many input queues; slots
/// are published but never reclaimed, so thread-local caches may hold slot
/// indices for the engine's lifetime.
pub const NUM_STREAMS: usize = 64;

/// Pipeline depth: the number of stages a descriptor can occupy between
/// admission and completion.
pub const NUM_PIPELINE_STAGES: usize = 3;

/// Default cap on concurrently in-flight [`RunType::Bounded`] operations.
///
/// [`RunType::Bounded`]: crate::op::RunType::Bounded
pub const NUM_CONCURRENT_OPS: usize = 4;

/// Default capacity of each per-stream input queue.
pub const INPUT_QUEUE_DEPTH: usize = 8192;

/// Configuration for a [`ProgressEngine`](crate::ProgressEngine).
///
/// All fields are fixed for the lifetime of the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Cap on concurrently in-flight bounded operations.
    ///
    /// The cap is bypassed for a stream whose first pipeline stage is
    /// empty, so it can never cause head-of-line blocking within a stream.
    pub max_concurrent_bounded: usize,

    /// Capacity of each per-stream input queue.
    pub input_queue_depth: usize,

    /// Start the worker lazily on the first `enqueue` instead of requiring
    /// an explicit `run()`.
    pub start_on_demand: bool,

    /// Keep a per-thread cache from compute stream to registry slot,
    /// skipping the registry scan on a hit.
    pub stream_queue_cache: bool,

    /// Allow concurrent submission to the same stream from multiple
    /// threads. Serializes same-stream producers with a per-queue mutex.
    pub multi_thread_submission: bool,

    /// Warn (once per descriptor) when an admitted operation has made no
    /// progress for an extended period.
    pub hang_check: bool,

    /// Emit a trace event when a descriptor is admitted and when it
    /// completes.
    pub trace: bool,

    /// Pre-register [`StreamId::DEFAULT`](crate::op::StreamId::DEFAULT) at
    /// construction so the common single-stream case never takes the
    /// registration lock.
    pub register_default_stream: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_bounded: NUM_CONCURRENT_OPS,
            input_queue_depth: INPUT_QUEUE_DEPTH,
            start_on_demand: true,
            stream_queue_cache: true,
            multi_thread_submission: true,
            hang_check: false,
            trace: false,
            register_default_stream: false,
        }
    }
}

impl EngineConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrent_bounded == 0 {
            return Err("max_concurrent_bounded must be > 0".to_string());
        }
        if self.input_queue_depth < 2 {
            return Err("input_queue_depth must be >= 2".to_string());
        }
        Ok(())
    }
}

/// Builder for [`EngineConfig`].
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    max_concurrent_bounded: Option<usize>,
    input_queue_depth: Option<usize>,
    start_on_demand: Option<bool>,
    stream_queue_cache: Option<bool>,
    multi_thread_submission: Option<bool>,
    hang_check: Option<bool>,
    trace: Option<bool>,
    register_default_stream: Option<bool>,
}

impl EngineConfigBuilder {
    /// Sets the bounded-operation concurrency cap.
    #[must_use]
    pub fn max_concurrent_bounded(mut self, cap: usize) -> Self {
        self.max_concurrent_bounded = Some(cap);
        self
    }

    /// Sets the per-stream input queue capacity.
    #[must_use]
    pub fn input_queue_depth(mut self, depth: usize) -> Self {
        self.input_queue_depth = Some(depth);
        self
    }

    /// Enables or disables lazy worker start on first `enqueue`.
    #[must_use]
    pub fn start_on_demand(mut self, enabled: bool) -> Self {
        self.start_on_demand = Some(enabled);
        self
    }

    /// Enables or disables the per-thread stream-to-queue cache.
    #[must_use]
    pub fn stream_queue_cache(mut self, enabled: bool) -> Self {
        self.stream_queue_cache = Some(enabled);
        self
    }

    /// Enables or disables concurrent same-stream submission.
    #[must_use]
    pub fn multi_thread_submission(mut self, enabled: bool) -> Self {
        self.multi_thread_submission = Some(enabled);
        self
    }

    /// Enables or disables the stalled-operation diagnostic.
    #[must_use]
    pub fn hang_check(mut self, enabled: bool) -> Self {
        self.hang_check = Some(enabled);
        self
    }

    /// Enables or disables per-operation trace events.
    #[must_use]
    pub fn trace(mut self, enabled: bool) -> Self {
        self.trace = Some(enabled);
        self
    }

    /// Enables or disables default-stream pre-registration.
    #[must_use]
    pub fn register_default_stream(mut self, enabled: bool) -> Self {
        self.register_default_stream = Some(enabled);
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> EngineConfig {
        let defaults = EngineConfig::default();
        EngineConfig {
            max_concurrent_bounded: self
                .max_concurrent_bounded
                .unwrap_or(defaults.max_concurrent_bounded),
            input_queue_depth: self.input_queue_depth.unwrap_or(defaults.input_queue_depth),
            start_on_demand: self.start_on_demand.unwrap_or(defaults.start_on_demand),
            stream_queue_cache: self
                .stream_queue_cache
                .unwrap_or(defaults.stream_queue_cache),
            multi_thread_submission: self
                .multi_thread_submission
                .unwrap_or(defaults.multi_thread_submission),
            hang_check: self.hang_check.unwrap_or(defaults.hang_check),
            trace: self.trace.unwrap_or(defaults.trace),
            register_default_stream: self
                .register_default_stream
                .unwrap_or(defaults.register_default_stream),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrent_bounded, NUM_CONCURRENT_OPS);
        assert_eq!(config.input_queue_depth, INPUT_QUEUE_DEPTH);
        assert!(config.start_on_demand);
        assert!(config.stream_queue_cache);
        assert!(!config.hang_check);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::builder()
            .max_concurrent_bounded(1)
            .input_queue_depth(16)
            .start_on_demand(false)
            .hang_check(true)
            .trace(true)
            .build();

        assert_eq!(config.max_concurrent_bounded, 1);
        assert_eq!(config.input_queue_depth, 16);
        assert!(!config.start_on_demand);
        assert!(config.hang_check);
        assert!(config.trace);
    }

    #[test]
    fn test_validate_rejects_zero_cap() {
        let config = EngineConfig::builder().max_concurrent_bounded(0).build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_tiny_queue() {
        let config = EngineConfig::builder().input_queue_depth(1).build();
        assert!(config.validate().is_err());
    }
}
