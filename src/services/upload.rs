use crate::error::PipelineError;
use crate::models::{FileRecord, UploadProgress};
use crate::services::remote::{RemoteStageClient, UploadStream};
use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncReadExt;

/// Streams local files to the remote with live byte progress.
///
/// Upload is atomic from the registry's point of view: either a record in
/// `uploaded` status comes back, or the error does and no record exists.
pub struct UploadCoordinator {
    client: Arc<dyn RemoteStageClient>,
    chunk_size: usize,
}

impl UploadCoordinator {
    pub fn new(client: Arc<dyn RemoteStageClient>, chunk_size: usize) -> Self {
        Self {
            client,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Uploads the file at `path`, reporting progress on every chunk handed
    /// to the transport.
    pub async fn upload(
        &self,
        path: &Path,
        on_progress: impl Fn(UploadProgress) + Send + Sync + 'static,
    ) -> Result<FileRecord, PipelineError> {
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_owned)
            .ok_or_else(|| {
                PipelineError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "path has no usable filename",
                ))
            })?;
        let total = tokio::fs::metadata(path).await?.len();
        let mut file = tokio::fs::File::open(path).await?;
        let chunk_size = self.chunk_size;

        on_progress(UploadProgress::new(0, total));

        let body: UploadStream = Box::pin(async_stream::try_stream! {
            let mut sent: u64 = 0;
            let mut buf = vec![0u8; chunk_size];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                sent += n as u64;
                on_progress(UploadProgress::new(sent, total));
                yield Bytes::copy_from_slice(&buf[..n]);
            }
        });

        let seed = self.client.upload(&filename, total, body).await?;

        // The remote's seed wins where it says anything; local metadata
        // fills the gaps.
        let name = if seed.filename.is_empty() {
            filename
        } else {
            seed.filename
        };
        let size = if seed.size > 0 { seed.size } else { total };
        let record = FileRecord::uploaded(name, size);
        tracing::info!(filename = %record.filename, size = record.file_size, id = %record.id, "upload complete");
        Ok(record)
    }
}
