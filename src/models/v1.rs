use std::collections::HashMap;

use chrono::Utc;
use native_db::{native_db, ToKey};
use native_model::{native_model, Model};
use serde::{Deserialize, Serialize};

// ===== ENUMS =====

/// Kind of a survey step, fixed by the template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Checklist,
    Photo,
    Video,
    GpsTrace,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Checklist => "checklist",
            StepKind::Photo => "photo",
            StepKind::Video => "video",
            StepKind::GpsTrace => "gps_trace",
        }
    }

    /// Whether completing this step produces a media file to upload.
    pub fn is_media(&self) -> bool {
        matches!(self, StepKind::Photo | StepKind::Video)
    }
}

impl From<&str> for StepKind {
    fn from(s: &str) -> Self {
        match s {
            "photo" => StepKind::Photo,
            "video" => StepKind::Video,
            "gps_trace" => StepKind::GpsTrace,
            _ => StepKind::Checklist,
        }
    }
}

/// Lifecycle of a queued upload task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Uploading,
    Done,
    Failed,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Done => "done",
            UploadStatus::Failed => "failed",
        }
    }
}

impl From<&str> for UploadStatus {
    fn from(s: &str) -> Self {
        match s {
            "uploading" => UploadStatus::Uploading,
            "done" => UploadStatus::Done,
            "failed" => UploadStatus::Failed,
            _ => UploadStatus::Pending,
        }
    }
}

/// Coarse media classification the remote service records alongside bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Photo,
    Video,
}

impl MediaKind {
    pub fn from_content_type(content_type: &str) -> Self {
        if content_type.starts_with("video/") {
            MediaKind::Video
        } else {
            MediaKind::Photo
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Photo => "photo",
            MediaKind::Video => "video",
        }
    }
}

// ===== WIRE TYPES =====

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurveyTemplate {
    pub id: String,
    pub name: String,
    pub survey_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    pub steps: Vec<SurveyStep>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurveyStep {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: StepKind,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub required: bool,
    /// Checklist answer options; absent for media and trace steps.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: String,
    pub job_id: String,
    pub agent_id: String,
    pub cascade_round: i32,
    pub offer_rank: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_km: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    pub expires_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresignedUrlResponse {
    pub upload_url: String,
    pub s3_key: String,
    pub expires_in: i64,
}

/// Metadata registered with the remote service after the bytes have landed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaMetadata {
    pub s3_key: String,
    pub step_id: String,
    pub media_type: String,
    pub lat: f64,
    pub lng: f64,
    pub accuracy: f64,
    pub sha256: String,
    pub file_size: u64,
    pub captured_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRecord {
    pub id: String,
    pub s3_key: String,
    pub step_id: String,
    pub media_type: String,
    pub uploaded_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurveySubmission {
    pub responses: serde_json::Value,
    pub gps_trail_geojson: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationUpdate {
    pub lat: f64,
    pub lng: f64,
    pub accuracy: f64,
}

/// Wake-up frame naming an offer; the body is never trusted as offer data,
/// it only triggers a REST refetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferPing {
    pub offer_id: String,
    pub job_id: String,
    pub expires_at: String,
}

/// Typed event frame fanned out to subscribed consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: HashMap<String, String>,
}

/// The two frame shapes carried by the push subscription.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum PushFrame {
    Offer(OfferPing),
    Event(AgentEvent),
}

// ===== SESSION TYPES =====

/// One answer, keyed by step id. Last write wins; the value shape depends on
/// the step kind and is not validated here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResponse {
    pub step_id: String,
    pub kind: StepKind,
    pub value: serde_json::Value,
    pub completed: bool,
}

/// A captured photo or video, identified by its content hash and byte size.
/// Both are computed once at capture time and never recomputed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaItem {
    pub step_id: String,
    pub local_uri: String,
    pub content_hash: String,
    pub content_type: String,
    pub byte_size: u64,
    pub lat: f64,
    pub lng: f64,
    pub captured_at: String,
    pub uploaded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPoint {
    pub lat: f64,
    pub lng: f64,
    pub accuracy: f64,
    /// Unix milliseconds; points are appended in ascending order.
    pub timestamp: i64,
}

impl GpsPoint {
    /// Serializes a trail as a GeoJSON `LineString` with `[lng, lat]` pairs
    /// in capture order.
    pub fn line_string(points: &[GpsPoint]) -> serde_json::Value {
        let coordinates: Vec<[f64; 2]> = points.iter().map(|p| [p.lng, p.lat]).collect();
        serde_json::json!({
            "type": "LineString",
            "coordinates": coordinates,
        })
    }
}

// ===== LOCAL MODELS =====

/// Durable record of one not-yet-confirmed media upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[native_model(id = 1, version = 1)]
#[native_db]
pub struct QueuedUploadTask {
    #[primary_key]
    pub id: u32,
    #[secondary_key]
    pub job_id: String,
    pub step_id: String,
    pub file_path: String,
    pub content_type: String,
    pub content_hash: String,
    pub byte_size: u64,
    pub lat: f64,
    pub lng: f64,
    pub captured_at: String,
    pub status: UploadStatus,
    pub remote_key: Option<String>,
    pub retry_count: u32,
    pub created_at: String,
}

/// Insert shape for the upload queue; the store assigns the id.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadTaskSeed {
    pub job_id: String,
    pub step_id: String,
    pub file_path: String,
    pub content_type: String,
    pub content_hash: String,
    pub byte_size: u64,
    pub lat: f64,
    pub lng: f64,
    pub captured_at: String,
}

impl UploadTaskSeed {
    pub fn from_media(job_id: &str, media: &MediaItem) -> Self {
        Self {
            job_id: job_id.to_string(),
            step_id: media.step_id.clone(),
            file_path: media.local_uri.clone(),
            content_type: media.content_type.clone(),
            content_hash: media.content_hash.clone(),
            byte_size: media.byte_size,
            lat: media.lat,
            lng: media.lng,
            captured_at: media.captured_at.clone(),
        }
    }
}

/// Durable snapshot of an in-progress survey saved because online submission
/// was not possible at capture time. At most one per job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[native_model(id = 2, version = 1)]
#[native_db]
pub struct SurveyDraft {
    #[primary_key]
    pub job_id: String,
    pub template_id: String,
    pub responses_json: String,
    pub gps_trail_json: String,
    pub started_at: Option<String>,
    pub updated_at: String,
}

impl SurveyDraft {
    pub fn new(
        job_id: String,
        template_id: String,
        responses_json: String,
        gps_trail_json: String,
        started_at: Option<String>,
    ) -> Self {
        Self {
            job_id,
            template_id,
            responses_json,
            gps_trail_json,
            started_at,
            updated_at: Utc::now().to_rfc3339(),
        }
    }
}

/// Append-only buffer of location fixes taken while offline. Only the most
/// recent sample is transmitted; the buffer is cleared as one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[native_model(id = 3, version = 1)]
#[native_db]
pub struct BufferedLocationSample {
    #[primary_key]
    pub id: u32,
    pub lat: f64,
    pub lng: f64,
    pub accuracy: f64,
    #[secondary_key]
    pub timestamp: i64,
}
