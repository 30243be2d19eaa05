//! In-memory state for one survey session: the ordered step list, per-step
//! responses, captured media, the GPS boundary trail, and the navigation
//! cursor. The engine never skips or reorders steps on its own; it only
//! tracks the cursor position the caller requests.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::{TerraError, TerraResult};
use crate::models::{
    GpsPoint, MediaItem, StepKind, StepResponse, SurveyDraft, SurveyStep, SurveySubmission,
    UploadTaskSeed,
};
use crate::store::SurveyStore;

#[derive(Debug, Default)]
pub struct SurveySession {
    job_id: Option<String>,
    template_id: Option<String>,
    steps: Vec<SurveyStep>,
    responses: HashMap<String, StepResponse>,
    media_queue: Vec<MediaItem>,
    gps_trail: Vec<GpsPoint>,
    started_at: Option<String>,
    current_step_index: usize,
}

impl SurveySession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets all state for a fresh session and records the start time.
    pub fn init(&mut self, job_id: &str, template_id: &str, steps: Vec<SurveyStep>) {
        *self = Self {
            job_id: Some(job_id.to_string()),
            template_id: Some(template_id.to_string()),
            steps,
            started_at: Some(Utc::now().to_rfc3339()),
            ..Self::default()
        };
    }

    pub fn job_id(&self) -> Option<&str> {
        self.job_id.as_deref()
    }

    pub fn template_id(&self) -> Option<&str> {
        self.template_id.as_deref()
    }

    pub fn started_at(&self) -> Option<&str> {
        self.started_at.as_deref()
    }

    pub fn steps(&self) -> &[SurveyStep] {
        &self.steps
    }

    pub fn gps_trail(&self) -> &[GpsPoint] {
        &self.gps_trail
    }

    pub fn media_queue(&self) -> &[MediaItem] {
        &self.media_queue
    }

    // ===== RESPONSES & CAPTURE =====

    /// Replaces the response for a step. Value shape is the caller's
    /// responsibility; nothing is validated here.
    pub fn set_response(&mut self, response: StepResponse) {
        self.responses.insert(response.step_id.clone(), response);
    }

    pub fn response(&self, step_id: &str) -> Option<&StepResponse> {
        self.responses.get(step_id)
    }

    /// Appends captured media to the in-memory queue; nothing is persisted
    /// until the session falls back to an offline save.
    pub fn add_media(&mut self, item: MediaItem) {
        self.media_queue.push(item);
    }

    /// Flips the first not-yet-uploaded media item for a step to uploaded,
    /// recording the remote key.
    pub fn mark_media_uploaded(&mut self, step_id: &str, remote_key: &str) {
        if let Some(item) = self
            .media_queue
            .iter_mut()
            .find(|m| m.step_id == step_id && !m.uploaded)
        {
            item.uploaded = true;
            item.remote_key = Some(remote_key.to_string());
        }
    }

    /// Appends a point to the boundary trail. Points arrive in capture order
    /// and are never reordered.
    pub fn add_gps_point(&mut self, point: GpsPoint) {
        self.gps_trail.push(point);
    }

    /// Ends a boundary walk. With fewer than two recorded points there is no
    /// valid line and no completion; otherwise returns the GeoJSON
    /// `LineString` over exactly the recorded points in capture order.
    pub fn finish_trace(&self) -> Option<String> {
        if self.gps_trail.len() < 2 {
            return None;
        }
        Some(GpsPoint::line_string(&self.gps_trail).to_string())
    }

    // ===== NAVIGATION =====

    pub fn current_step(&self) -> Option<&SurveyStep> {
        self.steps.get(self.current_step_index)
    }

    pub fn current_step_index(&self) -> usize {
        self.current_step_index
    }

    /// Advances the cursor, clamped to the last step. No wraparound.
    pub fn next_step(&mut self) {
        if self.current_step_index + 1 < self.steps.len() {
            self.current_step_index += 1;
        }
    }

    /// Moves the cursor back, clamped to the first step. No wraparound.
    pub fn prev_step(&mut self) {
        self.current_step_index = self.current_step_index.saturating_sub(1);
    }

    // ===== COMPLETION & SUBMISSION =====

    /// True iff every required step has a completed response. Responses to
    /// optional steps never affect the result.
    pub fn is_all_complete(&self) -> bool {
        self.steps
            .iter()
            .filter(|s| s.required)
            .all(|s| self.responses.get(&s.id).is_some_and(|r| r.completed))
    }

    fn missing_required_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.required)
            .filter(|s| !self.responses.get(&s.id).is_some_and(|r| r.completed))
            .count()
    }

    /// The responses map as submitted on the wire: checklist answers pass
    /// through verbatim, trace steps collapse to "completed", media steps to
    /// "uploaded" (the media itself travels through the upload queue).
    pub fn build_responses_payload(&self) -> serde_json::Value {
        let mut payload = serde_json::Map::new();
        for (step_id, response) in &self.responses {
            let value = match response.kind {
                StepKind::Checklist => response.value.clone(),
                StepKind::GpsTrace => serde_json::Value::String("completed".to_string()),
                StepKind::Photo | StepKind::Video => {
                    serde_json::Value::String("uploaded".to_string())
                }
            };
            payload.insert(step_id.clone(), value);
        }
        serde_json::Value::Object(payload)
    }

    /// Builds the submission payload. This same shape is produced whether
    /// the survey is submitted immediately or saved as a draft and
    /// auto-submitted later.
    pub fn build_submission(&self) -> TerraResult<SurveySubmission> {
        let missing = self.missing_required_count();
        if missing > 0 {
            return Err(TerraError::Validation(missing));
        }

        Ok(SurveySubmission {
            responses: self.build_responses_payload(),
            gps_trail_geojson: GpsPoint::line_string(&self.gps_trail).to_string(),
            started_at: self.started_at.clone(),
            duration_minutes: duration_minutes_since(self.started_at.as_deref()),
            template_id: self.template_id.clone(),
        })
    }

    /// Falls back to the offline path: queues every not-yet-uploaded media
    /// item as a durable upload task, upserts the draft, and resets the
    /// session. With incomplete required steps this fails with a validation
    /// error and mutates nothing.
    pub fn save_offline(&mut self, store: &SurveyStore) -> TerraResult<()> {
        let missing = self.missing_required_count();
        if missing > 0 {
            return Err(TerraError::Validation(missing));
        }

        let job_id = self
            .job_id
            .clone()
            .ok_or_else(|| TerraError::Storage("no active survey session".to_string()))?;
        let template_id = self.template_id.clone().unwrap_or_default();

        for media in self.media_queue.iter().filter(|m| !m.uploaded) {
            store.enqueue_upload(UploadTaskSeed::from_media(&job_id, media))?;
        }

        let draft = SurveyDraft::new(
            job_id.clone(),
            template_id,
            self.build_responses_payload().to_string(),
            serde_json::to_string(&self.gps_trail)?,
            self.started_at.clone(),
        );
        store.save_survey_draft(draft)?;

        debug!(job_id = %job_id, "survey saved offline");
        self.reset();
        Ok(())
    }

    /// Clears everything back to the empty state.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Elapsed minutes since an RFC 3339 start time, if one was recorded.
pub fn duration_minutes_since(started_at: Option<&str>) -> Option<f64> {
    let started = DateTime::parse_from_rfc3339(started_at?).ok()?;
    let elapsed = Utc::now().signed_duration_since(started.with_timezone(&Utc));
    Some(elapsed.num_milliseconds() as f64 / 60_000.0)
}
