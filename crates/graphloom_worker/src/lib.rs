//! Worker runtime and phase handlers.
//!
//! One handler per queue, all sharing the same skeleton: gate on the
//! job, insert a processing phase row, do the work, write a terminal
//! status, and either enqueue the next phase or consult the retry
//! policy. Handlers never let an error escape their boundary — the
//! broker always sees the item as processed.

pub mod chunker;
pub mod gdrive;
pub mod handlers;
pub mod llm;
pub mod pool;
pub mod runtime;
pub mod services;

pub use chunker::{Chunk, ContextualChunker};
pub use gdrive::{GoogleDriveOrigin, OriginFile, SourceOrigin};
pub use llm::{ClaudeProvider, ContextModel, LlmError, SituateReply};
pub use pool::TaskPool;
pub use runtime::Worker;
pub use services::Services;
