//! Durable local store for the three offline record families: the upload
//! queue, survey drafts, and buffered location samples. Backed by an
//! embedded native_db database so queued evidence survives process kills.
//!
//! Every operation runs in its own transaction, which gives single-record
//! atomicity against concurrently triggered sync passes.

use std::path::Path;

use chrono::Utc;
use native_db::{Builder, Database, Models};
use once_cell::sync::Lazy;
use tracing::debug;

use crate::error::{TerraError, TerraResult};
use crate::models::{BufferedLocationSample, QueuedUploadTask, SurveyDraft, UploadStatus, UploadTaskSeed};

/// Tasks past this many failed attempts are excluded from automatic retry.
pub const MAX_UPLOAD_RETRIES: u32 = 3;

static MODELS: Lazy<Models> = Lazy::new(|| {
    let mut models = Models::new();
    models
        .define::<QueuedUploadTask>()
        .expect("upload queue model");
    models.define::<SurveyDraft>().expect("survey draft model");
    models
        .define::<BufferedLocationSample>()
        .expect("location buffer model");
    models
});

pub struct SurveyStore {
    db: Database<'static>,
}

impl std::fmt::Debug for SurveyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SurveyStore").finish_non_exhaustive()
    }
}

impl SurveyStore {
    /// Opens (or creates) the store at the given path, creating parent
    /// directories as needed.
    pub fn open(path: impl AsRef<Path>) -> TerraResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Builder::new().create(&MODELS, path)?;
        Ok(Self { db })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> TerraResult<Self> {
        let db = Builder::new().create_in_memory(&MODELS)?;
        Ok(Self { db })
    }

    // ===== UPLOAD QUEUE =====

    /// Inserts a new upload task as `pending` with zero retries, assigning
    /// the next queue id.
    pub fn enqueue_upload(&self, seed: UploadTaskSeed) -> TerraResult<QueuedUploadTask> {
        let rw = self.db.rw_transaction()?;

        let existing: Vec<QueuedUploadTask> = rw
            .scan()
            .primary()?
            .all()?
            .collect::<Result<Vec<_>, _>>()?;
        let next_id = existing.iter().map(|t| t.id).max().unwrap_or(0) + 1;

        let task = QueuedUploadTask {
            id: next_id,
            job_id: seed.job_id,
            step_id: seed.step_id,
            file_path: seed.file_path,
            content_type: seed.content_type,
            content_hash: seed.content_hash,
            byte_size: seed.byte_size,
            lat: seed.lat,
            lng: seed.lng,
            captured_at: seed.captured_at,
            status: UploadStatus::Pending,
            remote_key: None,
            retry_count: 0,
            created_at: Utc::now().to_rfc3339(),
        };

        rw.insert(task.clone())?;
        rw.commit()?;

        debug!(task_id = task.id, job_id = %task.job_id, "enqueued upload task");
        Ok(task)
    }

    /// Tasks still eligible for automatic retry: `pending` or `failed`, with
    /// fewer than [`MAX_UPLOAD_RETRIES`] attempts, oldest first so no job
    /// starves the queue.
    pub fn get_pending_uploads(&self) -> TerraResult<Vec<QueuedUploadTask>> {
        let r = self.db.r_transaction()?;
        let mut tasks: Vec<QueuedUploadTask> = r
            .scan()
            .primary()?
            .all()?
            .collect::<Result<Vec<_>, _>>()?;

        tasks.retain(|t| {
            matches!(t.status, UploadStatus::Pending | UploadStatus::Failed)
                && t.retry_count < MAX_UPLOAD_RETRIES
        });
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(tasks)
    }

    /// Retry-eligible tasks for a single job; the auto-submit check re-queries
    /// this after an upload pass.
    pub fn pending_uploads_for_job(&self, job_id: &str) -> TerraResult<Vec<QueuedUploadTask>> {
        let mut tasks = self.get_pending_uploads()?;
        tasks.retain(|t| t.job_id == job_id);
        Ok(tasks)
    }

    pub fn get_upload_task(&self, id: u32) -> TerraResult<Option<QueuedUploadTask>> {
        let r = self.db.r_transaction()?;
        Ok(r.get().primary(id)?)
    }

    /// Moves a task to a new status. `done` stores the remote key and leaves
    /// the retry count unchanged; a `failed` outcome increments it. The
    /// read-modify-write happens inside one transaction so a concurrent pass
    /// cannot interleave.
    pub fn mark_upload_status(
        &self,
        id: u32,
        status: UploadStatus,
        remote_key: Option<&str>,
    ) -> TerraResult<()> {
        let rw = self.db.rw_transaction()?;
        let mut task: QueuedUploadTask = rw
            .get()
            .primary(id)?
            .ok_or_else(|| TerraError::Storage(format!("no upload task with id {id}")))?;

        task.status = status;
        match status {
            UploadStatus::Done => {
                if let Some(key) = remote_key {
                    task.remote_key = Some(key.to_string());
                }
            }
            UploadStatus::Failed => {
                task.retry_count += 1;
            }
            UploadStatus::Pending | UploadStatus::Uploading => {}
        }

        rw.upsert(task)?;
        rw.commit()?;
        Ok(())
    }

    /// Deletes a job's `done` tasks after its draft has been submitted.
    pub fn clear_completed_uploads(&self, job_id: &str) -> TerraResult<()> {
        let rw = self.db.rw_transaction()?;
        let tasks: Vec<QueuedUploadTask> = rw
            .scan()
            .primary()?
            .all()?
            .collect::<Result<Vec<_>, _>>()?;

        let mut removed = 0usize;
        for task in tasks {
            if task.job_id == job_id && task.status == UploadStatus::Done {
                rw.remove(task)?;
                removed += 1;
            }
        }
        rw.commit()?;

        debug!(job_id, removed, "cleared completed uploads");
        Ok(())
    }

    // ===== SURVEY DRAFTS =====

    /// Upserts the draft for its job, stamping `updated_at`.
    pub fn save_survey_draft(&self, mut draft: SurveyDraft) -> TerraResult<()> {
        draft.updated_at = Utc::now().to_rfc3339();
        let rw = self.db.rw_transaction()?;
        rw.upsert(draft)?;
        rw.commit()?;
        Ok(())
    }

    pub fn get_survey_draft(&self, job_id: &str) -> TerraResult<Option<SurveyDraft>> {
        let r = self.db.r_transaction()?;
        Ok(r.get().primary(job_id.to_string())?)
    }

    pub fn delete_survey_draft(&self, job_id: &str) -> TerraResult<()> {
        let rw = self.db.rw_transaction()?;
        let existing: Option<SurveyDraft> = rw.get().primary(job_id.to_string())?;
        if let Some(draft) = existing {
            rw.remove(draft)?;
        }
        rw.commit()?;
        Ok(())
    }

    // ===== LOCATION BUFFER =====

    pub fn buffer_location(
        &self,
        lat: f64,
        lng: f64,
        accuracy: f64,
        timestamp: i64,
    ) -> TerraResult<()> {
        let rw = self.db.rw_transaction()?;
        let existing: Vec<BufferedLocationSample> = rw
            .scan()
            .primary()?
            .all()?
            .collect::<Result<Vec<_>, _>>()?;
        let next_id = existing.iter().map(|s| s.id).max().unwrap_or(0) + 1;

        rw.insert(BufferedLocationSample {
            id: next_id,
            lat,
            lng,
            accuracy,
            timestamp,
        })?;
        rw.commit()?;
        Ok(())
    }

    /// Buffered samples in capture order (timestamp ascending).
    pub fn get_buffered_locations(&self) -> TerraResult<Vec<BufferedLocationSample>> {
        let r = self.db.r_transaction()?;
        let mut samples: Vec<BufferedLocationSample> = r
            .scan()
            .primary()?
            .all()?
            .collect::<Result<Vec<_>, _>>()?;
        samples.sort_by_key(|s| (s.timestamp, s.id));
        Ok(samples)
    }

    /// Drops the whole buffer in one batch, called after the most recent
    /// sample has been transmitted.
    pub fn clear_location_buffer(&self) -> TerraResult<()> {
        let rw = self.db.rw_transaction()?;
        let samples: Vec<BufferedLocationSample> = rw
            .scan()
            .primary()?
            .all()?
            .collect::<Result<Vec<_>, _>>()?;
        for sample in samples {
            rw.remove(sample)?;
        }
        rw.commit()?;
        Ok(())
    }
}
