//! The stage transition engine: a pure function from (record, event) to the
//! next record plus whatever the registry must do about it.
//!
//! Stage order is fixed: process -> mask -> archive. Completions auto-chain
//! to the next stage because the three remote operations are one logical
//! "make this file safe to download" workflow, split only for progress
//! granularity.

use crate::models::{FileRecord, FileStatus, Stage, StageEvent, StageProgress};
use chrono::Utc;

/// Side effect the registry must perform after applying a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Followup {
    /// Auto-chain: ask the remote to begin this stage and bind a new poller.
    StartStage(Stage),
    /// The pipeline finished; unbind the poller.
    Finished,
    /// The record failed; unbind the poller.
    Failed,
}

/// Computes the successor record for `event`.
///
/// Events that do not apply to the record's current status leave it
/// untouched (idempotence: a repeated completion for an already-advanced
/// record is a no-op). Never performs I/O.
pub fn next_state(mut record: FileRecord, event: StageEvent) -> (FileRecord, Option<Followup>) {
    let now = Utc::now();
    match event {
        StageEvent::StageStarted { task_id } => {
            // Which stage starts is implied by where the record stands.
            let next = match record.status {
                FileStatus::Uploaded => FileStatus::Processing,
                FileStatus::Processed => FileStatus::Masking,
                FileStatus::Masked => FileStatus::Archiving,
                _ => return (record, None),
            };
            record.status = next;
            record.stage_task = Some(task_id);
            record.progress = StageProgress::zero();
            record.error_message = None;
            record.updated_at = now;
            (record, None)
        }
        StageEvent::ProgressUpdate {
            percent,
            eta_seconds,
        } => {
            if record.status.running_stage().is_none() {
                return (record, None);
            }
            // completed_units never regresses within one stage.
            let completed = u32::from(percent).max(record.progress.completed_units);
            record.progress = StageProgress {
                completed_units: completed,
                total_units: 100,
                estimated_seconds_remaining: eta_seconds,
            };
            record.updated_at = now;
            (record, None)
        }
        StageEvent::StageCompleted => {
            let (next, followup) = match record.status {
                FileStatus::Processing => (FileStatus::Processed, Followup::StartStage(Stage::Mask)),
                FileStatus::Masking => (FileStatus::Masked, Followup::StartStage(Stage::Archive)),
                FileStatus::Archiving => (FileStatus::Done, Followup::Finished),
                _ => return (record, None),
            };
            record.status = next;
            record.stage_task = None;
            record.progress.completed_units = 100;
            record.progress.estimated_seconds_remaining = Some(0);
            record.updated_at = now;
            (record, Some(followup))
        }
        StageEvent::StageFailed { reason } => {
            if record.status.is_terminal() {
                return (record, None);
            }
            record.status = FileStatus::Failed;
            record.stage_task = None;
            record.error_message = Some(reason);
            record.updated_at = now;
            (record, Some(Followup::Failed))
        }
    }
}
