//! Retry and timeout policy.
//!
//! Single source of truth for retry delays, max retries, and phase
//! timeouts. Workers and the orphan reaper both derive their numbers
//! from here.

use crate::error::PipelineError;
use crate::types::Phase;

/// Delay before each retry attempt, in seconds: 1 min, 5 min, 15 min.
pub const RETRY_DELAYS_SECS: [u64; 3] = [60, 300, 900];

/// Maximum retry attempts before a job is failed for good.
pub const MAX_RETRIES: u32 = 3;

/// Buffer added on top of execution + retry time to absorb queue
/// delays before the reaper may consider a phase orphaned.
pub const SAFETY_BUFFER_SECS: u64 = 300;

/// Conservative base execution time per phase, excluding retries.
/// Ingestion shares extraction's budget (the combined handler runs
/// both inside one invocation).
pub fn base_execution_secs(phase: Phase) -> u64 {
    match phase {
        Phase::Ingestion | Phase::Extraction => 600,
        Phase::Chunking => 300,
        Phase::KgIngest => 1200,
        Phase::Completed => 600,
    }
}

/// Delay for the given retry attempt (0 = first retry). A provider
/// `retry_after` hint overrides the schedule for that attempt.
pub fn retry_delay_secs(retry_count: u32, error: Option<&PipelineError>) -> u64 {
    if let Some(hint) = error.and_then(|e| e.retry_after()) {
        return hint;
    }
    let idx = (retry_count as usize).min(RETRY_DELAYS_SECS.len() - 1);
    RETRY_DELAYS_SECS[idx]
}

/// Total time a job can spend waiting in retry delays.
pub fn max_retry_duration_secs() -> u64 {
    RETRY_DELAYS_SECS.iter().sum()
}

/// Total allowed wall-clock for a phase including all retries; used to
/// stamp `expected_completion_at` when a phase starts.
pub fn phase_timeout_secs(phase: Phase) -> u64 {
    base_execution_secs(phase) + max_retry_duration_secs() + SAFETY_BUFFER_SECS
}
