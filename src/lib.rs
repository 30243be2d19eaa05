//! TerraScore field client: offline-capable capture and synchronization of
//! survey evidence. Captured media and survey drafts are persisted locally
//! and reconciled with the remote service exactly once when connectivity
//! allows.

pub mod capture;
pub mod client;
pub mod error;
pub mod geofence;
pub mod location;
pub mod models;
pub mod offers;
pub mod store;
pub mod survey;
pub mod sync;
pub mod upload;

pub use client::{ClientConfig, SurveyApi, TerraClient};
pub use error::{TerraError, TerraResult};
pub use geofence::ArrivalGate;
pub use offers::{AgentEventBus, OfferChannel, OfferChannelHandle};
pub use store::SurveyStore;
pub use survey::SurveySession;
pub use sync::{SyncOrchestrator, SyncTrigger};
pub use upload::{UploadPipeline, UploadStrategy};
