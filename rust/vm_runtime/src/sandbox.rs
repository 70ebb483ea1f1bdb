//! Cooperative execution budget and run metrics.
//!
//! The VM does not time-slice; a render holds its thread until the decode
//! loop finishes.  Hosts that want a bound anyway can arm the tick budget,
//! which the loop checks once per instruction.  Value-stack growth is capped
//! separately so a runaway `INITIALIZE_ARRAY` or unbalanced codegen cannot
//! grow the stack without limit.  Peak depths and elapsed time are collected
//! either way and surfaced after the run.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::memory::DEFAULT_BUDGET_BYTES;

mod duration_format {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Call-site configurable limits.  A tick limit of zero leaves the budget
/// disarmed; the arena budget is handed to the memory subsystem at VM
/// construction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SandboxLimits {
    pub tick_limit: u64,
    pub stack_limit: usize,
    pub arena_budget_bytes: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            tick_limit: 0,
            stack_limit: 4_096,
            arena_budget_bytes: DEFAULT_BUDGET_BYTES,
        }
    }
}

/// Minimal set of counters surfaced for observability.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SandboxMetrics {
    pub ticks: u64,
    pub max_stack_depth: usize,
    pub max_frame_depth: usize,
    #[serde(with = "duration_format")]
    pub elapsed: Duration,
}

/// Stateful budget tracker used by the interpreter.
#[derive(Debug)]
pub struct Sandbox {
    limits: SandboxLimits,
    start: Instant,
    metrics: SandboxMetrics,
}

impl Sandbox {
    pub fn new(limits: SandboxLimits) -> Self {
        Self {
            limits,
            start: Instant::now(),
            metrics: SandboxMetrics::default(),
        }
    }

    pub fn limits(&self) -> SandboxLimits {
        self.limits
    }

    pub fn metrics(&self) -> SandboxMetrics {
        let mut metrics = self.metrics;
        metrics.elapsed = self.start.elapsed();
        metrics
    }

    /// Call once per decoded instruction.
    pub fn tick(&mut self) -> Result<(), SandboxError> {
        self.metrics.ticks += 1;
        if self.limits.tick_limit != 0 && self.metrics.ticks > self.limits.tick_limit {
            return Err(SandboxError::TickLimit {
                limit: self.limits.tick_limit,
            });
        }
        Ok(())
    }

    /// Update value-stack accounting and enforce the cap.
    pub fn record_stack_depth(&mut self, depth: usize) -> Result<(), SandboxError> {
        if depth > self.metrics.max_stack_depth {
            self.metrics.max_stack_depth = depth;
        }
        if depth > self.limits.stack_limit {
            return Err(SandboxError::StackLimit {
                limit: self.limits.stack_limit,
            });
        }
        Ok(())
    }

    /// Update call-depth accounting; the frame-array bound itself lives in
    /// the interpreter's configuration.
    pub fn record_frame_depth(&mut self, depth: usize) {
        if depth > self.metrics.max_frame_depth {
            self.metrics.max_frame_depth = depth;
        }
    }
}

/// Budget enforcement errors raised to the caller.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("tick budget exceeded (limit {limit})")]
    TickLimit { limit: u64 },
    #[error("value stack depth limit exceeded (limit {limit})")]
    StackLimit { limit: usize },
}
