use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::models::Stage;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::pin::Pin;

/// Characters escaped when a filename becomes a URL path segment.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Chunked request body handed to [`RemoteStageClient::upload`].
pub type UploadStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// Response body returned by [`RemoteStageClient::download`].
pub type DownloadStream = Pin<Box<dyn Stream<Item = Result<Bytes, PipelineError>> + Send>>;

/// Outcome of one progress query, decoded from the raw percent value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressReport {
    /// Normal progress, 0-99.
    Running(u8),
    /// The remote's completion sentinel (>= 100).
    Complete,
    /// The remote's `-1` failure sentinel.
    Failed,
}

impl ProgressReport {
    pub fn from_raw(raw: i64) -> Self {
        if raw < 0 {
            Self::Failed
        } else if raw >= 100 {
            Self::Complete
        } else {
            Self::Running(raw as u8)
        }
    }
}

/// File metadata as the remote reports it: the seed for a registry record.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteFileSeed {
    #[serde(default, alias = "name")]
    pub filename: String,
    #[serde(default, alias = "fileSize")]
    pub size: u64,
}

#[derive(Deserialize)]
struct ProcessStart {
    task_id: String,
}

#[derive(Deserialize)]
struct MaskStart {
    #[serde(rename = "maskTask_id")]
    task_id: String,
}

#[derive(Deserialize)]
struct ArchiveStart {
    #[serde(rename = "zipMaskTask_id")]
    task_id: String,
}

#[derive(Deserialize)]
struct ProgressBody {
    progress: i64,
}

/// The remote masking service, reduced to the operations the orchestrator
/// drives: upload/list/download/delete plus per-stage start and progress.
///
/// Implementations must keep transport failures (`PipelineError::Transport`)
/// distinguishable from the remote's `-1` sentinel, which is *not* an error
/// but a [`ProgressReport::Failed`] value.
#[async_trait]
pub trait RemoteStageClient: Send + Sync {
    /// Stream a file body to the remote. The seed for the local record comes
    /// back on success.
    async fn upload(
        &self,
        filename: &str,
        total_bytes: u64,
        body: UploadStream,
    ) -> Result<RemoteFileSeed, PipelineError>;

    /// List the owner's files already held by the remote.
    async fn list(&self) -> Result<Vec<RemoteFileSeed>, PipelineError>;

    /// Ask the remote to begin `stage` for `filename`; returns the task
    /// handle used for progress queries.
    async fn start_stage(&self, stage: Stage, filename: &str) -> Result<String, PipelineError>;

    /// One progress poll for a running stage task.
    async fn query_progress(
        &self,
        stage: Stage,
        task_id: &str,
    ) -> Result<ProgressReport, PipelineError>;

    async fn download(&self, filename: &str) -> Result<DownloadStream, PipelineError>;

    async fn delete(&self, filename: &str) -> Result<(), PipelineError>;
}

/// HTTP implementation speaking the masking service's wire surface.
pub struct HttpRemoteClient {
    http: reqwest::Client,
    base_url: String,
    owner: String,
    folder: String,
}

impl HttpRemoteClient {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            owner: config.owner.clone(),
            folder: config.folder.clone(),
        }
    }

    fn segment(value: &str) -> String {
        utf8_percent_encode(value, PATH_SEGMENT).to_string()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn start_url(&self, stage: Stage, filename: &str) -> String {
        let name = Self::segment(filename);
        match stage {
            Stage::Process => self.url(&format!("/files/process/{name}")),
            Stage::Mask => self.url(&format!("/files/mask/{name}")),
            Stage::Archive => self.url(&format!("/files/zipMask/{name}")),
        }
    }

    fn progress_url(&self, stage: Stage, task_id: &str) -> String {
        let task = Self::segment(task_id);
        match stage {
            Stage::Process => self.url(&format!("/files/process/progress/{task}")),
            Stage::Mask => self.url(&format!("/files/masking/progress/{task}")),
            Stage::Archive => self.url(&format!("/files/masking/zip/{task}")),
        }
    }

    async fn expect_json<T: DeserializeOwned>(
        resp: reqwest::Response,
    ) -> Result<T, PipelineError> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PipelineError::RemoteStatus {
                status: status.as_u16(),
                body,
            });
        }
        resp.json::<T>().await.map_err(Into::into)
    }

    async fn expect_success(resp: reqwest::Response) -> Result<(), PipelineError> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PipelineError::RemoteStatus {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStageClient for HttpRemoteClient {
    async fn upload(
        &self,
        filename: &str,
        total_bytes: u64,
        body: UploadStream,
    ) -> Result<RemoteFileSeed, PipelineError> {
        let part = reqwest::multipart::Part::stream_with_length(
            reqwest::Body::wrap_stream(body),
            total_bytes,
        )
        .file_name(filename.to_string());
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("owner", self.owner.clone());

        let resp = self
            .http
            .post(self.url("/files/upload"))
            .multipart(form)
            .send()
            .await?;
        Self::expect_json(resp).await
    }

    async fn list(&self) -> Result<Vec<RemoteFileSeed>, PipelineError> {
        let url = self.url(&format!(
            "/files/{}/{}",
            Self::segment(&self.owner),
            Self::segment(&self.folder)
        ));
        let resp = self.http.get(url).send().await?;
        Self::expect_json(resp).await
    }

    async fn start_stage(&self, stage: Stage, filename: &str) -> Result<String, PipelineError> {
        let resp = self
            .http
            .post(self.start_url(stage, filename))
            .json(&json!({ "username": self.owner }))
            .send()
            .await?;

        // Each stage names its task field differently on the wire.
        let task_id = match stage {
            Stage::Process => Self::expect_json::<ProcessStart>(resp).await?.task_id,
            Stage::Mask => Self::expect_json::<MaskStart>(resp).await?.task_id,
            Stage::Archive => Self::expect_json::<ArchiveStart>(resp).await?.task_id,
        };
        tracing::debug!(%stage, %filename, %task_id, "stage started on remote");
        Ok(task_id)
    }

    async fn query_progress(
        &self,
        stage: Stage,
        task_id: &str,
    ) -> Result<ProgressReport, PipelineError> {
        let resp = self.http.get(self.progress_url(stage, task_id)).send().await?;
        let body: ProgressBody = Self::expect_json(resp).await?;
        Ok(ProgressReport::from_raw(body.progress))
    }

    async fn download(&self, filename: &str) -> Result<DownloadStream, PipelineError> {
        let url = self.url(&format!(
            "/files/download/{}/{}",
            Self::segment(&self.owner),
            Self::segment(filename)
        ));
        let resp = self.http.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PipelineError::RemoteStatus {
                status: status.as_u16(),
                body,
            });
        }
        Ok(Box::pin(resp.bytes_stream().map(|chunk| chunk.map_err(Into::into))))
    }

    async fn delete(&self, filename: &str) -> Result<(), PipelineError> {
        let url = self.url(&format!(
            "/files/delete/{}/{}/{}",
            Self::segment(&self.owner),
            Self::segment(&self.folder),
            Self::segment(filename)
        ));
        let resp = self.http.delete(url).send().await?;
        Self::expect_success(resp).await
    }
}
