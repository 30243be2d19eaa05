//! Reconciliation engine. One sync pass flushes buffered location, retries
//! pending uploads sequentially, and auto-submits any survey draft whose
//! media is fully confirmed. Passes are single-flight; errors inside a pass
//! are swallowed and the work is reattempted on the next trigger.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::client::SurveyApi;
use crate::error::{TerraError, TerraResult};
use crate::models::{GpsPoint, LocationUpdate, SurveyDraft, SurveySubmission, UploadStatus};
use crate::store::SurveyStore;
use crate::survey::duration_minutes_since;
use crate::upload::UploadPipeline;

/// Why a sync pass was requested. Every trigger runs the same pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// Once, unconditionally, at process start.
    Startup,
    /// Connectivity transitioned from offline to online.
    ConnectivityRegained,
    /// The app came to the foreground while online.
    Foregrounded,
}

pub struct SyncOrchestrator {
    api: Arc<dyn SurveyApi>,
    store: Arc<SurveyStore>,
    pipeline: UploadPipeline,
    /// Single-flight guard. A compare-and-swap rather than a plain flag so
    /// the no-op contract holds even with triggers firing from parallel
    /// runtime threads.
    running: AtomicBool,
}

impl SyncOrchestrator {
    pub fn new(api: Arc<dyn SurveyApi>, store: Arc<SurveyStore>, pipeline: UploadPipeline) -> Self {
        Self {
            api,
            store,
            pipeline,
            running: AtomicBool::new(false),
        }
    }

    /// Runs one full sync pass. A no-op if a pass is already active. Never
    /// returns an error: background reconciliation degrades to retrying on
    /// the next trigger instead of surfacing failures.
    pub async fn run_sync(&self) {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("sync already running, skipping");
            return;
        }

        if let Err(e) = self.sync_pass().await {
            let e = TerraError::SyncPass(e.to_string());
            warn!("{e}, will retry on next trigger");
        }

        self.running.store(false, Ordering::SeqCst);
    }

    /// Consumes triggers until the sender side is dropped.
    pub async fn run_on_triggers(&self, mut triggers: mpsc::Receiver<SyncTrigger>) {
        while let Some(trigger) = triggers.recv().await {
            info!(?trigger, "sync triggered");
            self.run_sync().await;
        }
        debug!("sync trigger channel closed");
    }

    async fn sync_pass(&self) -> TerraResult<()> {
        self.flush_location_buffer().await;

        let touched_jobs = self.retry_pending_uploads().await?;

        for job_id in touched_jobs {
            if let Err(e) = self.try_auto_submit(&job_id).await {
                // Draft and tasks stay intact for the next pass.
                warn!(job_id = %job_id, "auto-submit deferred: {e}");
            }
        }

        Ok(())
    }

    /// Sends only the most recent buffered sample (the location endpoint
    /// has most-recent-only semantics, so older samples carry no
    /// information), then clears the whole buffer. On failure the buffer is
    /// left untouched for the next pass.
    async fn flush_location_buffer(&self) {
        let samples = match self.store.get_buffered_locations() {
            Ok(samples) => samples,
            Err(e) => {
                warn!("could not read location buffer: {e}");
                return;
            }
        };

        let Some(latest) = samples.last() else {
            return;
        };

        let update = LocationUpdate {
            lat: latest.lat,
            lng: latest.lng,
            accuracy: latest.accuracy,
        };

        match self.api.update_location(&update).await {
            Ok(()) => {
                debug!(buffered = samples.len(), "location buffer flushed");
                if let Err(e) = self.store.clear_location_buffer() {
                    warn!("could not clear location buffer: {e}");
                }
            }
            Err(e) => {
                debug!("location flush failed, keeping buffer: {e}");
            }
        }
    }

    /// Uploads every retry-eligible task, strictly sequentially, and returns
    /// the distinct jobs touched. Failures mark the task `failed`
    /// (incrementing its retry count) and move on.
    async fn retry_pending_uploads(&self) -> TerraResult<BTreeSet<String>> {
        let pending = self.store.get_pending_uploads()?;
        let mut touched = BTreeSet::new();

        for task in pending {
            touched.insert(task.job_id.clone());

            self.store
                .mark_upload_status(task.id, UploadStatus::Uploading, None)?;

            match self.pipeline.upload(self.api.as_ref(), &task).await {
                Ok(remote_key) => {
                    self.store
                        .mark_upload_status(task.id, UploadStatus::Done, Some(&remote_key))?;
                }
                Err(e) => {
                    warn!(task_id = task.id, "upload attempt failed: {e}");
                    self.store
                        .mark_upload_status(task.id, UploadStatus::Failed, None)?;
                }
            }
        }

        Ok(touched)
    }

    /// If no retry-eligible uploads remain for a job and a draft exists,
    /// submits the draft and cleans up. On success the draft is deleted and
    /// the job's `done` tasks purged; on failure both stay for the next pass.
    async fn try_auto_submit(&self, job_id: &str) -> TerraResult<()> {
        if !self.store.pending_uploads_for_job(job_id)?.is_empty() {
            return Ok(());
        }

        let Some(draft) = self.store.get_survey_draft(job_id)? else {
            return Ok(());
        };

        let submission = submission_from_draft(&draft)?;
        self.api
            .submit_survey(job_id, &submission)
            .await
            .map_err(|e| TerraError::Submission(e.to_string()))?;

        self.store.delete_survey_draft(job_id)?;
        self.store.clear_completed_uploads(job_id)?;

        info!(job_id, "draft auto-submitted");
        Ok(())
    }
}

/// Rebuilds the wire payload from a stored draft. Produces the same shape an
/// immediate online submission would have produced from identical inputs.
pub fn submission_from_draft(draft: &SurveyDraft) -> TerraResult<SurveySubmission> {
    let responses: serde_json::Value = serde_json::from_str(&draft.responses_json)?;
    let trail: Vec<GpsPoint> = serde_json::from_str(&draft.gps_trail_json)?;

    Ok(SurveySubmission {
        responses,
        gps_trail_geojson: GpsPoint::line_string(&trail).to_string(),
        started_at: draft.started_at.clone(),
        duration_minutes: duration_minutes_since(draft.started_at.as_deref()),
        template_id: Some(draft.template_id.clone()),
    })
}
