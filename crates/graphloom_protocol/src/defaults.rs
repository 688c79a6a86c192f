//! Canonical default values shared across the control and data plane.

/// How often the scheduler promotes ripe delayed queue items.
pub const SCHEDULER_INTERVAL_SECS: u64 = 5;

/// How often the orphan reaper sweeps for stuck phases.
pub const REAPER_INTERVAL_SECS: u64 = 300;

/// Bounded attempts when waiting on the rate governor.
pub const GOVERNOR_MAX_WAIT_ATTEMPTS: u32 = 20;

/// Exponential backoff cap (seconds) while waiting on the governor.
pub const GOVERNOR_BACKOFF_CAP_SECS: u64 = 30;

/// Default pause when a provider 429 carries no Retry-After header.
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// Error message written on phases cancelled by a document deletion.
pub const DOCUMENT_DELETED_MESSAGE: &str = "Document was deleted";

/// Provider keys used for rate-limit windows.
pub const PROVIDER_ANTHROPIC: &str = "anthropic";
pub const PROVIDER_OPENAI: &str = "openai";

/// Graph provider label recorded on entity mappings.
pub const KG_PROVIDER_GRAPHITI: &str = "graphiti";

/// How much of an error message is kept in job metadata.
pub const LAST_ERROR_MAX_CHARS: usize = 500;
