//! Control plane for the Graphloom pipeline.
//!
//! Submission and cancellation, the orphan reaper, the deletion
//! coordinator, the delayed-queue scheduler, and the maintenance
//! operations (failed-kg requeue, connectivity doctor).

pub mod coordinator;
pub mod deletion;
pub mod doctor;
pub mod reaper;
pub mod requeue;
pub mod scheduler;

pub use coordinator::{PipelineCoordinator, SubmitError, SubmitReceipt, SubmitRequest};
pub use deletion::{DeleteError, DeletionCoordinator};
pub use doctor::{run_checks, DoctorReport};
pub use reaper::OrphanReaper;
pub use requeue::requeue_failed_kg_jobs;
pub use scheduler::DelayedScheduler;
