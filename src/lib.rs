pub mod config;
pub mod error;
pub mod models;
pub mod services;

pub use config::PipelineConfig;
pub use error::PipelineError;
pub use models::{FileRecord, FileStatus, Stage, StageEvent, StageProgress, UploadProgress};
pub use services::registry::FileRegistry;
pub use services::remote::{HttpRemoteClient, ProgressReport, RemoteFileSeed, RemoteStageClient};
