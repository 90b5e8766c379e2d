//! The aggregate root: every record mutation funnels through here, so a
//! poller tick, an upload completion, and a delete can never interleave a
//! partial update to the same record.

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::models::{FileRecord, FileStatus, Stage, StageEvent, UploadProgress};
use crate::services::engine::{self, Followup};
use crate::services::poller::{self, PollerHandle};
use crate::services::remote::{DownloadStream, RemoteStageClient};
use crate::services::upload::UploadCoordinator;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, watch};
use uuid::Uuid;

/// What became of a poller-delivered event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EventOutcome {
    Applied,
    /// The record is gone or the event's task is stale; nothing was touched.
    Dropped,
}

pub struct FileRegistry {
    /// Back-reference handed to spawned pollers and upload callbacks.
    /// Always upgradable while a method runs.
    self_ref: Weak<FileRegistry>,
    client: Arc<dyn RemoteStageClient>,
    config: PipelineConfig,
    uploader: UploadCoordinator,
    state: Mutex<RegistryState>,
    /// Ephemeral per-upload byte progress, keyed by filename. Lives and dies
    /// with the upload, separate from the records proper.
    uploads: std::sync::Mutex<HashMap<String, UploadProgress>>,
    revision: watch::Sender<u64>,
}

#[derive(Default)]
struct RegistryState {
    records: HashMap<Uuid, FileRecord>,
    pollers: HashMap<Uuid, PollerHandle>,
    /// Records with a stage-start request in flight. Claimed under the lock
    /// before the remote call goes out, so one start wins per record.
    starting: HashSet<Uuid>,
}

/// The status a record must hold for `stage` to begin.
fn stage_source(stage: Stage) -> FileStatus {
    match stage {
        Stage::Process => FileStatus::Uploaded,
        Stage::Mask => FileStatus::Processed,
        Stage::Archive => FileStatus::Masked,
    }
}

impl FileRegistry {
    pub fn new(client: Arc<dyn RemoteStageClient>, config: PipelineConfig) -> Arc<Self> {
        let uploader = UploadCoordinator::new(client.clone(), config.upload_chunk_size);
        let (revision, _) = watch::channel(0);
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            client,
            config,
            uploader,
            state: Mutex::new(RegistryState::default()),
            uploads: std::sync::Mutex::new(HashMap::new()),
            revision,
        })
    }

    /// Change feed for observers: the counter bumps on every mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    fn touch(&self) {
        self.revision.send_modify(|r| *r += 1);
    }

    /// Uploads a local file and registers the resulting record.
    ///
    /// Atomic: on any failure no record appears and the error goes straight
    /// back to the caller. Byte progress is visible through
    /// [`upload_progress`](Self::upload_progress) while the upload runs.
    pub async fn upload(&self, path: &Path) -> Result<FileRecord, PipelineError> {
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();

        let tracker = self.self_ref.clone();
        let key = filename.clone();
        let result = self
            .uploader
            .upload(path, move |progress| {
                if let Some(registry) = tracker.upgrade() {
                    registry.uploads.lock().unwrap().insert(key.clone(), progress);
                    registry.touch();
                }
            })
            .await;

        // The upload has settled either way; its ephemeral progress goes.
        self.uploads.lock().unwrap().remove(&filename);

        match result {
            Ok(record) => {
                let mut state = self.state.lock().await;
                state.records.insert(record.id, record.clone());
                drop(state);
                self.touch();
                Ok(record)
            }
            Err(err) => {
                self.touch();
                Err(err)
            }
        }
    }

    /// Kicks off the pipeline for an uploaded record. From here the stages
    /// auto-chain (process -> mask -> archive) without further calls.
    pub async fn start_processing(&self, id: Uuid) -> Result<(), PipelineError> {
        let filename = {
            let state = self.state.lock().await;
            let record = state.records.get(&id).ok_or(PipelineError::NotFound(id))?;
            record.filename.clone()
        };
        self.begin_stage(id, Stage::Process, filename).await
    }

    /// Asks the remote to begin `stage` and binds a fresh poller on success.
    /// A failed start marks the record failed: no poller exists yet to
    /// absorb retries.
    ///
    /// The record is claimed in `starting` under the lock before the request
    /// goes out, so concurrent callers cannot start the same stage twice.
    async fn begin_stage(
        &self,
        id: Uuid,
        stage: Stage,
        filename: String,
    ) -> Result<(), PipelineError> {
        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let record = state.records.get(&id).ok_or(PipelineError::NotFound(id))?;
            let status = record.status;
            if status != stage_source(stage) || !state.starting.insert(id) {
                return Err(PipelineError::InvalidState {
                    id,
                    status,
                    expected: stage_source(stage).as_str(),
                });
            }
        }

        let result = self.client.start_stage(stage, &filename).await;
        match result {
            Ok(task_id) => {
                let mut state = self.state.lock().await;
                state.starting.remove(&id);
                // The record may have been deleted while the request flew.
                let Some(record) = state.records.get(&id) else {
                    return Ok(());
                };
                let (next, _) = engine::next_state(
                    record.clone(),
                    StageEvent::StageStarted {
                        task_id: task_id.clone(),
                    },
                );
                if next.stage_task.as_deref() != Some(task_id.as_str()) {
                    // The start did not take (record advanced elsewhere).
                    return Ok(());
                }
                state.records.insert(id, next);
                if let Some(old) = state.pollers.remove(&id) {
                    old.cancel();
                }
                let Some(registry) = self.self_ref.upgrade() else {
                    return Ok(());
                };
                let handle = poller::spawn(
                    registry,
                    self.client.clone(),
                    id,
                    stage,
                    task_id,
                    self.config.poll_interval(),
                    self.config.max_transport_failures,
                );
                state.pollers.insert(id, handle);
                drop(state);
                self.touch();
                Ok(())
            }
            Err(err) => {
                let mut state = self.state.lock().await;
                state.starting.remove(&id);
                if let Some(record) = state.records.get(&id) {
                    let (next, _) = engine::next_state(
                        record.clone(),
                        StageEvent::StageFailed {
                            reason: format!("could not start {stage} stage: {err}"),
                        },
                    );
                    state.records.insert(id, next);
                }
                drop(state);
                self.touch();
                Err(err)
            }
        }
    }

    /// Applies one poller-delivered event.
    ///
    /// The event's task id must match the record's current `stage_task`;
    /// stale responses for an already-advanced stage are dropped silently,
    /// which is what tells a leftover poller to stand down.
    pub(crate) async fn apply_stage_event(
        &self,
        id: Uuid,
        task_id: &str,
        event: StageEvent,
    ) -> EventOutcome {
        let (followup, filename) = {
            let mut state = self.state.lock().await;
            let Some(record) = state.records.get(&id) else {
                return EventOutcome::Dropped;
            };
            if record.stage_task.as_deref() != Some(task_id) {
                return EventOutcome::Dropped;
            }
            let (next, followup) = engine::next_state(record.clone(), event);
            let filename = next.filename.clone();
            state.records.insert(id, next);
            if followup.is_some() {
                // Terminal for the current poller either way.
                if let Some(handle) = state.pollers.remove(&id) {
                    handle.cancel();
                }
            }
            (followup, filename)
        };
        self.touch();

        if let Some(Followup::StartStage(stage)) = followup {
            // Failures here are already recorded on the record; the chain
            // simply stops.
            if let Err(err) = self.begin_stage(id, stage, filename).await {
                tracing::error!(%id, %stage, error = %err, "auto-chain stage start failed");
            }
        }
        EventOutcome::Applied
    }

    /// Removes a record. Its poller, if any, is cancelled before the record
    /// goes, so nothing can mutate the id afterwards. The remote copy is
    /// deleted last.
    pub async fn delete(&self, id: Uuid) -> Result<(), PipelineError> {
        let filename = {
            let mut state = self.state.lock().await;
            if let Some(handle) = state.pollers.remove(&id) {
                handle.cancel();
            }
            let record = state.records.remove(&id).ok_or(PipelineError::NotFound(id))?;
            record.filename
        };
        self.touch();
        self.client.delete(&filename).await
    }

    /// Bulk delete with the same poller-cancellation guarantee per record.
    /// Remote deletions that fail are logged and skipped; the local registry
    /// always ends up empty.
    pub async fn delete_all(&self) {
        let filenames: Vec<String> = {
            let mut state = self.state.lock().await;
            for (_, handle) in state.pollers.drain() {
                handle.cancel();
            }
            state.records.drain().map(|(_, r)| r.filename).collect()
        };
        self.touch();
        for filename in filenames {
            if let Err(err) = self.client.delete(&filename).await {
                tracing::warn!(%filename, error = %err, "remote delete failed");
            }
        }
    }

    /// Cancels every live poller without touching records or the remote.
    /// For tearing the registry down.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        for (_, handle) in state.pollers.drain() {
            handle.cancel();
        }
    }

    /// Streams the masked artifact. Only `done` records are downloadable.
    pub async fn download(&self, id: Uuid) -> Result<DownloadStream, PipelineError> {
        let filename = {
            let state = self.state.lock().await;
            let record = state.records.get(&id).ok_or(PipelineError::NotFound(id))?;
            if record.status != FileStatus::Done {
                return Err(PipelineError::NotReady {
                    id,
                    status: record.status,
                });
            }
            record.filename.clone()
        };
        self.client.download(&filename).await
    }

    /// Seeds the registry from the remote's file listing. Files already
    /// known (by filename) are left alone; new ones appear as `uploaded`.
    pub async fn sync_remote(&self) -> Result<Vec<FileRecord>, PipelineError> {
        let seeds = self.client.list().await?;
        let added: Vec<FileRecord> = {
            let mut state = self.state.lock().await;
            let mut added = Vec::new();
            for seed in seeds {
                if seed.filename.is_empty() {
                    continue;
                }
                if state.records.values().any(|r| r.filename == seed.filename) {
                    continue;
                }
                let record = FileRecord::uploaded(seed.filename, seed.size);
                state.records.insert(record.id, record.clone());
                added.push(record);
            }
            added
        };
        if !added.is_empty() {
            self.touch();
        }
        Ok(added)
    }

    pub async fn get(&self, id: Uuid) -> Option<FileRecord> {
        self.state.lock().await.records.get(&id).cloned()
    }

    pub async fn find_by_filename(&self, filename: &str) -> Option<FileRecord> {
        self.state
            .lock()
            .await
            .records
            .values()
            .find(|r| r.filename == filename)
            .cloned()
    }

    /// All records, oldest first.
    pub async fn list(&self) -> Vec<FileRecord> {
        let state = self.state.lock().await;
        let mut records: Vec<FileRecord> = state.records.values().cloned().collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    pub async fn list_by_status(&self, predicate: impl Fn(FileStatus) -> bool) -> Vec<FileRecord> {
        let state = self.state.lock().await;
        let mut records: Vec<FileRecord> = state
            .records
            .values()
            .filter(|r| predicate(r.status))
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    /// Byte progress of an in-flight upload, if one is running for
    /// `filename`.
    pub fn upload_progress(&self, filename: &str) -> Option<UploadProgress> {
        self.uploads.lock().unwrap().get(filename).copied()
    }

    /// Blocks until the record reaches `done` or `failed` and returns it.
    pub async fn wait_terminal(&self, id: Uuid) -> Result<FileRecord, PipelineError> {
        let mut rx = self.subscribe();
        loop {
            match self.get(id).await {
                Some(record) if record.status.is_terminal() => return Ok(record),
                Some(_) => {}
                None => return Err(PipelineError::NotFound(id)),
            }
            if rx.changed().await.is_err() {
                return Err(PipelineError::NotFound(id));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::remote::{
        DownloadStream, ProgressReport, RemoteFileSeed, UploadStream,
    };
    use async_trait::async_trait;

    /// Remote that answers everything but never advances anything.
    struct IdleClient;

    #[async_trait]
    impl RemoteStageClient for IdleClient {
        async fn upload(
            &self,
            filename: &str,
            total_bytes: u64,
            _body: UploadStream,
        ) -> Result<RemoteFileSeed, PipelineError> {
            Ok(RemoteFileSeed {
                filename: filename.to_string(),
                size: total_bytes,
            })
        }

        async fn list(&self) -> Result<Vec<RemoteFileSeed>, PipelineError> {
            Ok(Vec::new())
        }

        async fn start_stage(&self, stage: Stage, filename: &str) -> Result<String, PipelineError> {
            Ok(format!("{stage}:{filename}"))
        }

        async fn query_progress(
            &self,
            _stage: Stage,
            _task_id: &str,
        ) -> Result<ProgressReport, PipelineError> {
            Ok(ProgressReport::Running(0))
        }

        async fn download(&self, _filename: &str) -> Result<DownloadStream, PipelineError> {
            Ok(Box::pin(futures::stream::empty()))
        }

        async fn delete(&self, _filename: &str) -> Result<(), PipelineError> {
            Ok(())
        }
    }

    async fn seeded_registry(status: FileStatus, task: Option<&str>) -> (Arc<FileRegistry>, Uuid) {
        let registry = FileRegistry::new(Arc::new(IdleClient), PipelineConfig::default());
        let mut record = FileRecord::uploaded("f.csv".to_string(), 4);
        record.status = status;
        record.stage_task = task.map(String::from);
        let id = record.id;
        registry.state.lock().await.records.insert(id, record);
        (registry, id)
    }

    #[tokio::test]
    async fn test_stale_task_event_is_dropped_unchanged() {
        // The record advanced to masking under task t-2; anything still
        // reporting for t-1 belongs to the finished process stage.
        let (registry, id) = seeded_registry(FileStatus::Masking, Some("t-2")).await;
        let before = registry.get(id).await.unwrap();

        let outcome = registry
            .apply_stage_event(
                id,
                "t-1",
                StageEvent::ProgressUpdate {
                    percent: 90,
                    eta_seconds: Some(3),
                },
            )
            .await;
        assert_eq!(outcome, EventOutcome::Dropped);
        assert_eq!(registry.get(id).await.unwrap(), before);

        // A stale completion must not complete the current stage either.
        let outcome = registry
            .apply_stage_event(id, "t-1", StageEvent::StageCompleted)
            .await;
        assert_eq!(outcome, EventOutcome::Dropped);
        assert_eq!(registry.get(id).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_matching_task_event_is_applied() {
        let (registry, id) = seeded_registry(FileStatus::Masking, Some("t-2")).await;

        let outcome = registry
            .apply_stage_event(
                id,
                "t-2",
                StageEvent::ProgressUpdate {
                    percent: 40,
                    eta_seconds: None,
                },
            )
            .await;
        assert_eq!(outcome, EventOutcome::Applied);
        assert_eq!(
            registry.get(id).await.unwrap().progress.completed_units,
            40
        );
    }

    #[tokio::test]
    async fn test_event_for_missing_record_is_dropped() {
        let registry = FileRegistry::new(Arc::new(IdleClient), PipelineConfig::default());
        let outcome = registry
            .apply_stage_event(Uuid::new_v4(), "t-1", StageEvent::StageCompleted)
            .await;
        assert_eq!(outcome, EventOutcome::Dropped);
    }
}
