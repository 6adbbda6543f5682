//! Tape backup engine core (§1-§9): the Source Scanner/Differ, Backup and
//! Restore Pipelines, the tape-facing Drive Registry and Spanning
//! Coordinator, the Job Orchestrator, and the external-collaborator
//! traits they're all built against. Persistence lives in `tbarr-catalog`,
//! on-tape formats in `tbarr-tape`, archive/compression/encryption in
//! `tbarr-codec` -- this crate wires them into the running system.

pub mod backup;
pub mod collaborators;
pub mod restore;
pub mod scan;
pub mod scheduler;
pub mod tape;

pub use backup::{run_backup, BackupOutcome, BackupPipeline};
pub use restore::{plan_restore, run_restore, PlannedTape, RestoreOutcome, RestorePipeline, RestorePlan};
pub use scheduler::{CronSchedule, ExecutionPriority, ExecutionResult, JobOrchestrator, QueuedExecution, StartedExecution};
