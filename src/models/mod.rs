//! Domain models for the masking pipeline orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One of the three remote operations applied in sequence to a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Process,
    Mask,
    Archive,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Process => "process",
            Self::Mask => "mask",
            Self::Archive => "archive",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle status of a file in the registry.
///
/// Monotonic along the stage order, except that `Failed` is reachable from
/// any non-terminal state. `Done` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Created,
    Uploading,
    Uploaded,
    Processing,
    Processed,
    Masking,
    Masked,
    Archiving,
    Done,
    Failed,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Uploading => "uploading",
            Self::Uploaded => "uploaded",
            Self::Processing => "processing",
            Self::Processed => "processed",
            Self::Masking => "masking",
            Self::Masked => "masked",
            Self::Archiving => "archiving",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "uploading" => Some(Self::Uploading),
            "uploaded" => Some(Self::Uploaded),
            "processing" => Some(Self::Processing),
            "processed" => Some(Self::Processed),
            "masking" => Some(Self::Masking),
            "masked" => Some(Self::Masked),
            "archiving" => Some(Self::Archiving),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// The stage currently executing, if this is one of the `-ing` states.
    pub fn running_stage(&self) -> Option<Stage> {
        match self {
            Self::Processing => Some(Stage::Process),
            Self::Masking => Some(Stage::Mask),
            Self::Archiving => Some(Stage::Archive),
            _ => None,
        }
    }
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Progress of the currently running stage, in percent units.
///
/// The remote reports only a percentage, so `total_units` is always 100 and
/// the ETA is derived locally by the poller. Reset to zero at the start of
/// each stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageProgress {
    pub completed_units: u32,
    pub total_units: u32,
    pub estimated_seconds_remaining: Option<u64>,
}

impl StageProgress {
    pub fn zero() -> Self {
        Self {
            completed_units: 0,
            total_units: 100,
            estimated_seconds_remaining: None,
        }
    }
}

/// Per-file state tracked by the registry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileRecord {
    /// Stable identifier, assigned at upload time, immutable afterwards.
    pub id: Uuid,
    pub filename: String,
    pub file_size: u64,
    pub status: FileStatus,
    /// Task handle for the stage currently running on the remote.
    /// Present exactly while `status` is one of the `-ing` stage states.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage_task: Option<String>,
    pub progress: StageProgress,
    /// Set when `status` is `Failed`, absent otherwise.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FileRecord {
    /// A fresh record for a completed upload.
    pub fn uploaded(filename: String, file_size: u64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            filename,
            file_size,
            status: FileStatus::Uploaded,
            stage_task: None,
            progress: StageProgress::zero(),
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Byte progress of one in-flight upload.
///
/// Keyed by filename and removed as soon as the upload settles; never stored
/// on the [`FileRecord`] itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UploadProgress {
    pub loaded_bytes: u64,
    pub total_bytes: u64,
    pub percent: u8,
}

impl UploadProgress {
    pub fn new(loaded_bytes: u64, total_bytes: u64) -> Self {
        let percent = if total_bytes == 0 {
            100
        } else {
            ((loaded_bytes.min(total_bytes)) * 100 / total_bytes) as u8
        };
        Self {
            loaded_bytes,
            total_bytes,
            percent,
        }
    }
}

/// A signal about the currently running stage, fed to the transition engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageEvent {
    /// The remote accepted a stage-start request and returned a task handle.
    StageStarted { task_id: String },
    /// A progress poll came back with a normal 0-99 percentage.
    ProgressUpdate { percent: u8, eta_seconds: Option<u64> },
    /// A progress poll reported the 100-percent completion sentinel.
    StageCompleted,
    /// The remote reported the failure sentinel, or polling gave up.
    StageFailed { reason: String },
}
