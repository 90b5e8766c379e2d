#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use mask_pipeline::services::remote::{
    DownloadStream, ProgressReport, RemoteFileSeed, RemoteStageClient, UploadStream,
};
use mask_pipeline::{PipelineConfig, PipelineError, Stage};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// One scripted answer to a progress poll.
#[derive(Debug, Clone, Copy)]
pub enum Step {
    Report(ProgressReport),
    /// Simulates a network-level failure on this tick.
    Transport,
    /// Simulates an HTTP error status on this tick.
    Status(u16),
}

pub fn running(percent: u8) -> Step {
    Step::Report(ProgressReport::Running(percent))
}

pub fn complete() -> Step {
    Step::Report(ProgressReport::Complete)
}

pub fn failed() -> Step {
    Step::Report(ProgressReport::Failed)
}

#[derive(Default)]
struct Inner {
    /// Poll scripts keyed by task id. The last step is sticky: once a script
    /// is down to one entry it repeats forever.
    scripts: HashMap<String, VecDeque<Step>>,
    polls: HashMap<String, u32>,
    started: Vec<String>,
    deleted: Vec<String>,
    uploads: Vec<(String, u64)>,
    listing: Vec<RemoteFileSeed>,
    fail_start: Vec<String>,
    start_delay: Option<std::time::Duration>,
}

/// In-process stand-in for the masking service, driven by per-task scripts.
#[derive(Default)]
pub struct ScriptedClient {
    inner: Mutex<Inner>,
}

impl ScriptedClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Deterministic task handle for a (stage, filename) pair.
    pub fn task_id(stage: Stage, filename: &str) -> String {
        format!("{}:{}", stage.as_str(), filename)
    }

    pub fn script(&self, stage: Stage, filename: &str, steps: Vec<Step>) {
        self.inner
            .lock()
            .unwrap()
            .scripts
            .insert(Self::task_id(stage, filename), steps.into());
    }

    /// Scripts a stage from raw wire percent values (`-1` = failure).
    pub fn script_raw(&self, stage: Stage, filename: &str, raw: &[i64]) {
        let steps = raw
            .iter()
            .map(|&value| Step::Report(ProgressReport::from_raw(value)))
            .collect();
        self.script(stage, filename, steps);
    }

    pub fn fail_next_start(&self, stage: Stage, filename: &str) {
        self.inner
            .lock()
            .unwrap()
            .fail_start
            .push(Self::task_id(stage, filename));
    }

    pub fn set_listing(&self, seeds: Vec<RemoteFileSeed>) {
        self.inner.lock().unwrap().listing = seeds;
    }

    /// Makes every `start_stage` call sleep before answering, widening the
    /// window in which a second caller can race the first.
    pub fn set_start_delay(&self, delay: std::time::Duration) {
        self.inner.lock().unwrap().start_delay = Some(delay);
    }

    pub fn polls(&self, stage: Stage, filename: &str) -> u32 {
        self.inner
            .lock()
            .unwrap()
            .polls
            .get(&Self::task_id(stage, filename))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_polls(&self) -> u32 {
        self.inner.lock().unwrap().polls.values().sum()
    }

    pub fn started(&self) -> Vec<String> {
        self.inner.lock().unwrap().started.clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.inner.lock().unwrap().deleted.clone()
    }

    pub fn uploads(&self) -> Vec<(String, u64)> {
        self.inner.lock().unwrap().uploads.clone()
    }
}

#[async_trait]
impl RemoteStageClient for ScriptedClient {
    async fn upload(
        &self,
        filename: &str,
        _total_bytes: u64,
        mut body: UploadStream,
    ) -> Result<RemoteFileSeed, PipelineError> {
        let mut size = 0u64;
        while let Some(chunk) = body.next().await {
            size += chunk?.len() as u64;
        }
        self.inner
            .lock()
            .unwrap()
            .uploads
            .push((filename.to_string(), size));
        Ok(RemoteFileSeed {
            filename: filename.to_string(),
            size,
        })
    }

    async fn list(&self) -> Result<Vec<RemoteFileSeed>, PipelineError> {
        Ok(self.inner.lock().unwrap().listing.clone())
    }

    async fn start_stage(&self, stage: Stage, filename: &str) -> Result<String, PipelineError> {
        let task_id = Self::task_id(stage, filename);
        let delay = self.inner.lock().unwrap().start_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut inner = self.inner.lock().unwrap();
        if let Some(pos) = inner.fail_start.iter().position(|t| *t == task_id) {
            inner.fail_start.remove(pos);
            return Err(PipelineError::Transport("connection refused".to_string()));
        }
        inner.started.push(task_id.clone());
        Ok(task_id)
    }

    async fn query_progress(
        &self,
        _stage: Stage,
        task_id: &str,
    ) -> Result<ProgressReport, PipelineError> {
        let mut inner = self.inner.lock().unwrap();
        *inner.polls.entry(task_id.to_string()).or_insert(0) += 1;
        let step = match inner.scripts.get_mut(task_id) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) => *queue.front().expect("script must not be empty"),
            None => Step::Report(ProgressReport::Running(0)),
        };
        match step {
            Step::Report(report) => Ok(report),
            Step::Transport => Err(PipelineError::Transport("connection refused".to_string())),
            Step::Status(status) => Err(PipelineError::RemoteStatus {
                status,
                body: "upstream error".to_string(),
            }),
        }
    }

    async fn download(&self, _filename: &str) -> Result<DownloadStream, PipelineError> {
        Ok(Box::pin(futures::stream::iter(vec![Ok(
            Bytes::from_static(b"masked"),
        )])))
    }

    async fn delete(&self, filename: &str) -> Result<(), PipelineError> {
        self.inner
            .lock()
            .unwrap()
            .deleted
            .push(filename.to_string());
        Ok(())
    }
}

/// Tight intervals so the suites run in milliseconds.
pub fn test_config() -> PipelineConfig {
    PipelineConfig {
        poll_interval_ms: 10,
        max_transport_failures: 3,
        upload_chunk_size: 1024,
        ..Default::default()
    }
}

/// Writes `data` under `name` in a fresh temp dir and returns both.
pub fn temp_source(name: &str, data: &[u8]) -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(name);
    std::fs::write(&path, data).unwrap();
    (dir, path)
}
