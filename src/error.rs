//! Error taxonomy for the TerraScore client.

use thiserror::Error;

pub type TerraResult<T> = Result<T, TerraError>;

#[derive(Debug, Error)]
pub enum TerraError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("capture failed for `{path}`: {reason}")]
    Capture { path: String, reason: String },

    #[error("survey incomplete: {0} required step(s) unanswered")]
    Validation(usize),

    #[error("upload failed for task {task_id}: {reason}")]
    TransientUpload { task_id: u32, reason: String },

    #[error("survey submission failed: {0}")]
    Submission(String),

    #[error("arrival rejected by server: {0}")]
    ArrivalRejected(String),

    #[error("sync pass aborted: {0}")]
    SyncPass(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("api error ({status} {code}): {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    #[error("http failure: {0}")]
    Http(#[from] reqwest::Error),

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("json failure: {0}")]
    Json(#[from] serde_json::Error),

    #[error("push channel error: {0}")]
    Channel(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl TerraError {
    /// True for remote rejections in the 4xx range, where retrying the exact
    /// same request cannot succeed without the caller changing something.
    pub fn is_rejection(&self) -> bool {
        matches!(self, TerraError::Api { status, .. } if (400..500).contains(status))
    }
}

impl From<native_db::db_type::Error> for TerraError {
    fn from(e: native_db::db_type::Error) -> Self {
        TerraError::Storage(e.to_string())
    }
}
