//! Upload pipeline: executes one queued upload task against the remote
//! service. Two transport strategies produce the same effect: the service
//! holds the bytes under a durable key and has the capture metadata on
//! record. The pipeline performs no retries; retry policy lives in the
//! sync engine.

use std::path::Path;

use tracing::{debug, info};

use crate::client::SurveyApi;
use crate::error::{TerraError, TerraResult};
use crate::models::{MediaKind, MediaMetadata, QueuedUploadTask};

/// How bytes reach the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UploadStrategy {
    /// Request a short-lived destination URL, transfer raw bytes to it, then
    /// register metadata with the service.
    #[default]
    Presigned,
    /// Bytes and metadata together through one authenticated multipart
    /// request proxied by the service.
    MultipartProxy,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UploadPipeline {
    strategy: UploadStrategy,
}

impl UploadPipeline {
    pub fn new(strategy: UploadStrategy) -> Self {
        Self { strategy }
    }

    /// Uploads one task and returns the remote key. Any transport failure
    /// maps to [`TerraError::TransientUpload`] and leaves the task record
    /// untouched; the caller decides how to mark it.
    pub async fn upload(
        &self,
        api: &dyn SurveyApi,
        task: &QueuedUploadTask,
    ) -> TerraResult<String> {
        let bytes = tokio::fs::read(&task.file_path)
            .await
            .map_err(|e| transient(task, format!("read {}: {e}", task.file_path)))?;

        debug!(
            task_id = task.id,
            job_id = %task.job_id,
            bytes = bytes.len(),
            strategy = ?self.strategy,
            "starting upload"
        );

        let remote_key = match self.strategy {
            UploadStrategy::Presigned => self.upload_presigned(api, task, bytes).await?,
            UploadStrategy::MultipartProxy => self.upload_multipart(api, task, bytes).await?,
        };

        info!(task_id = task.id, remote_key = %remote_key, "upload confirmed");
        Ok(remote_key)
    }

    async fn upload_presigned(
        &self,
        api: &dyn SurveyApi,
        task: &QueuedUploadTask,
        bytes: Vec<u8>,
    ) -> TerraResult<String> {
        let presigned = api
            .presigned_upload(&task.job_id, &task.content_type, &task.step_id)
            .await
            .map_err(|e| transient(task, format!("presign: {e}")))?;

        api.put_bytes(&presigned.upload_url, &task.content_type, bytes)
            .await
            .map_err(|e| transient(task, format!("transfer: {e}")))?;

        api.register_media(&task.job_id, &metadata_for(task, &presigned.s3_key))
            .await
            .map_err(|e| transient(task, format!("register: {e}")))?;

        Ok(presigned.s3_key)
    }

    async fn upload_multipart(
        &self,
        api: &dyn SurveyApi,
        task: &QueuedUploadTask,
        bytes: Vec<u8>,
    ) -> TerraResult<String> {
        let file_name = Path::new(&task.file_path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("capture.bin");

        let record = api
            .upload_media_multipart(
                &task.job_id,
                &metadata_for(task, ""),
                file_name,
                &task.content_type,
                bytes,
            )
            .await
            .map_err(|e| transient(task, format!("multipart: {e}")))?;

        Ok(record.s3_key)
    }
}

/// The metadata the remote service records alongside the bytes. The
/// hash/size pair was fixed at capture time and is what lets the service
/// detect a duplicate delivery after a crash mid-sync.
fn metadata_for(task: &QueuedUploadTask, s3_key: &str) -> MediaMetadata {
    MediaMetadata {
        s3_key: s3_key.to_string(),
        step_id: task.step_id.clone(),
        media_type: MediaKind::from_content_type(&task.content_type)
            .as_str()
            .to_string(),
        lat: task.lat,
        lng: task.lng,
        accuracy: 0.0,
        sha256: task.content_hash.clone(),
        file_size: task.byte_size,
        captured_at: task.captured_at.clone(),
    }
}

fn transient(task: &QueuedUploadTask, reason: String) -> TerraError {
    TerraError::TransientUpload {
        task_id: task.id,
        reason,
    }
}
