pub mod v1;

// ===== VERSIONED MODELS FOLLOWING NATIVE_DB PATTERN =====
// Local records carry a native_model id/version so the schema can evolve
// without dropping queued evidence on upgrade.

pub mod data {
    // Type aliases pointing to the latest versions
    pub type QueuedUploadTask = super::v1::QueuedUploadTask;
    pub type SurveyDraft = super::v1::SurveyDraft;
    pub type BufferedLocationSample = super::v1::BufferedLocationSample;

    // Re-export versioned modules for direct access
    pub use super::v1;
}

// Re-export for convenient access at the top level
pub use data::*;

// Wire and session types shared across versions
pub use v1::{
    AgentEvent, ApiError, GpsPoint, LocationUpdate, MediaItem, MediaKind, MediaMetadata,
    MediaRecord, Offer, OfferPing, PresignedUrlResponse, PushFrame, StepKind, StepResponse,
    SurveyStep, SurveySubmission, SurveyTemplate, UploadStatus, UploadTaskSeed,
};
