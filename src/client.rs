use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use url::Url;

use crate::error::{TerraError, TerraResult};
use crate::models::{
    ApiError, LocationUpdate, MediaMetadata, MediaRecord, Offer, PresignedUrlResponse,
    SurveySubmission, SurveyTemplate,
};

// ===== CONFIGURATION =====

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub api_token: String,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            base_url: normalize_base_url(base_url.into()),
            api_token: api_token.into(),
        }
    }

    /// Creates a client config from environment variables.
    pub fn from_env() -> TerraResult<Self> {
        Self::from_env_with_token(None)
    }

    /// Creates a client config from environment variables with an optional
    /// explicit access token (overrides `TERRASCORE_API_TOKEN`).
    pub fn from_env_with_token(api_token: Option<String>) -> TerraResult<Self> {
        dotenv::dotenv().ok();

        let base_url = std::env::var("TERRASCORE_API_URL").map_err(|_| {
            TerraError::Config("TERRASCORE_API_URL environment variable is required".to_string())
        })?;

        let api_token = match api_token {
            Some(token) => token,
            None => std::env::var("TERRASCORE_API_TOKEN").map_err(|_| {
                TerraError::Config(
                    "TERRASCORE_API_TOKEN environment variable is required".to_string(),
                )
            })?,
        };

        Ok(Self::new(base_url, api_token))
    }

    /// Derives the push subscription endpoint from the REST base URL.
    pub fn ws_url(&self) -> TerraResult<Url> {
        let mut url = Url::parse(&self.base_url).map_err(|e| TerraError::Config(e.to_string()))?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme).map_err(|_| {
            TerraError::Config(format!("cannot derive ws url from {}", self.base_url))
        })?;
        url.set_path("/ws");
        url.set_query(None);
        Ok(url)
    }
}

fn normalize_base_url(mut url: String) -> String {
    while url.ends_with('/') {
        url.pop();
    }
    url
}

// ===== RESPONSE ENVELOPE =====

/// Every REST response arrives wrapped in `{ data, error }`.
#[derive(Debug, Deserialize)]
pub struct ApiEnvelope<T> {
    pub data: Option<T>,
    pub error: Option<ApiError>,
}

// ===== API SURFACE =====

/// The remote endpoints this client consumes. Kept behind a trait so the
/// sync engine and channels can run against a scripted remote in tests.
#[async_trait]
pub trait SurveyApi: Send + Sync {
    async fn get_template(&self, job_id: &str) -> TerraResult<SurveyTemplate>;

    async fn presigned_upload(
        &self,
        job_id: &str,
        content_type: &str,
        step_id: &str,
    ) -> TerraResult<PresignedUrlResponse>;

    /// Transfers raw bytes to a short-lived destination handle. No bearer
    /// auth: the URL itself is the credential.
    async fn put_bytes(
        &self,
        upload_url: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> TerraResult<()>;

    async fn register_media(&self, job_id: &str, meta: &MediaMetadata)
        -> TerraResult<MediaRecord>;

    /// Single-request alternative: bytes and metadata together through the
    /// service's multipart proxy endpoint.
    async fn upload_media_multipart(
        &self,
        job_id: &str,
        meta: &MediaMetadata,
        file_name: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> TerraResult<MediaRecord>;

    async fn submit_survey(&self, job_id: &str, submission: &SurveySubmission)
        -> TerraResult<()>;

    async fn confirm_arrival(&self, job_id: &str, update: &LocationUpdate) -> TerraResult<()>;

    async fn update_location(&self, update: &LocationUpdate) -> TerraResult<()>;

    async fn fetch_offers(&self) -> TerraResult<Vec<Offer>>;
}

// ===== CLIENT IMPLEMENTATION =====

pub struct TerraClient {
    config: ClientConfig,
    http: reqwest::Client,
    /// Bare client for presigned destinations, which reject extra auth headers.
    bare: reqwest::Client,
}

impl std::fmt::Debug for TerraClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerraClient")
            .field("base_url", &self.config.base_url)
            .finish_non_exhaustive()
    }
}

impl TerraClient {
    pub fn new(config: ClientConfig) -> TerraResult<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::AUTHORIZATION,
            reqwest::header::HeaderValue::from_str(&format!("Bearer {}", config.api_token))
                .map_err(|e| TerraError::Config(format!("invalid auth header: {e}")))?,
        );

        let http = reqwest::Client::builder().default_headers(headers).build()?;
        let bare = reqwest::Client::builder().build()?;

        Ok(Self { config, http, bare })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url)
    }

    /// Unwraps the `{ data, error }` envelope, mapping non-2xx statuses and
    /// error bodies to [`TerraError::Api`].
    async fn parse_data<T: DeserializeOwned>(response: reqwest::Response) -> TerraResult<T> {
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(api_error(status.as_u16(), &body));
        }

        let envelope: ApiEnvelope<T> = serde_json::from_str(&body)?;
        if let Some(error) = envelope.error {
            return Err(TerraError::Api {
                status: status.as_u16(),
                code: error.code,
                message: error.message,
            });
        }
        envelope.data.ok_or_else(|| TerraError::Api {
            status: status.as_u16(),
            code: "missing_data".to_string(),
            message: "response envelope had no data".to_string(),
        })
    }

    /// For endpoints where only the status matters.
    async fn parse_ok(response: reqwest::Response) -> TerraResult<()> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await?;
        Err(api_error(status.as_u16(), &body))
    }
}

fn api_error(status: u16, body: &str) -> TerraError {
    if let Ok(envelope) = serde_json::from_str::<ApiEnvelope<serde_json::Value>>(body) {
        if let Some(error) = envelope.error {
            return TerraError::Api {
                status,
                code: error.code,
                message: error.message,
            };
        }
    }
    TerraError::Api {
        status,
        code: "http_error".to_string(),
        message: format!("HTTP {status}"),
    }
}

#[async_trait]
impl SurveyApi for TerraClient {
    async fn get_template(&self, job_id: &str) -> TerraResult<SurveyTemplate> {
        let response = self
            .http
            .get(self.url(&format!("/v1/jobs/{job_id}/template")))
            .send()
            .await?;
        Self::parse_data(response).await
    }

    async fn presigned_upload(
        &self,
        job_id: &str,
        content_type: &str,
        step_id: &str,
    ) -> TerraResult<PresignedUrlResponse> {
        let response = self
            .http
            .get(self.url(&format!("/v1/jobs/{job_id}/media/presigned")))
            .query(&[("content_type", content_type), ("step_id", step_id)])
            .send()
            .await?;
        Self::parse_data(response).await
    }

    async fn put_bytes(
        &self,
        upload_url: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> TerraResult<()> {
        let response = self
            .bare
            .put(upload_url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TerraError::Api {
                status: status.as_u16(),
                code: "destination_rejected".to_string(),
                message: format!("byte transfer failed with HTTP {status}"),
            });
        }
        Ok(())
    }

    async fn register_media(
        &self,
        job_id: &str,
        meta: &MediaMetadata,
    ) -> TerraResult<MediaRecord> {
        let response = self
            .http
            .post(self.url(&format!("/v1/jobs/{job_id}/media")))
            .json(meta)
            .send()
            .await?;
        Self::parse_data(response).await
    }

    async fn upload_media_multipart(
        &self,
        job_id: &str,
        meta: &MediaMetadata,
        file_name: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> TerraResult<MediaRecord> {
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str(content_type)?;

        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("step_id", meta.step_id.clone())
            .text("media_type", meta.media_type.clone())
            .text("lat", meta.lat.to_string())
            .text("lng", meta.lng.to_string())
            .text("captured_at", meta.captured_at.clone());

        let response = self
            .http
            .post(self.url(&format!("/v1/jobs/{job_id}/media/upload")))
            .multipart(form)
            .send()
            .await?;
        Self::parse_data(response).await
    }

    async fn submit_survey(
        &self,
        job_id: &str,
        submission: &SurveySubmission,
    ) -> TerraResult<()> {
        let response = self
            .http
            .post(self.url(&format!("/v1/jobs/{job_id}/survey")))
            .json(submission)
            .send()
            .await?;
        Self::parse_ok(response).await
    }

    async fn confirm_arrival(&self, job_id: &str, update: &LocationUpdate) -> TerraResult<()> {
        let response = self
            .http
            .post(self.url(&format!("/v1/jobs/{job_id}/arrive")))
            .json(update)
            .send()
            .await?;
        Self::parse_ok(response).await
    }

    async fn update_location(&self, update: &LocationUpdate) -> TerraResult<()> {
        let response = self
            .http
            .post(self.url("/v1/agents/me/location"))
            .json(update)
            .send()
            .await?;
        Self::parse_ok(response).await
    }

    async fn fetch_offers(&self) -> TerraResult<Vec<Offer>> {
        let response = self
            .http
            .get(self.url("/v1/agents/me/offers"))
            .send()
            .await?;
        Self::parse_data(response).await
    }
}
