//! Arrival gating: great-circle distance to the target parcel and the
//! remote arrival confirmation call. Purely computed; nothing is persisted
//! here.

use crate::client::SurveyApi;
use crate::error::{TerraError, TerraResult};
use crate::models::LocationUpdate;

/// Mean Earth radius in meters.
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Within this many meters of the target, the arrival action is enabled.
pub const ARRIVAL_THRESHOLD_M: f64 = 500.0;

/// Haversine distance between two points in meters.
pub fn haversine_distance_m(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lng = (lng2 - lng1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    EARTH_RADIUS_M * 2.0 * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Binary gate in front of the "confirm arrival" transition for one job.
#[derive(Debug, Clone)]
pub struct ArrivalGate {
    job_id: String,
    target_lat: f64,
    target_lng: f64,
    threshold_m: f64,
}

impl ArrivalGate {
    pub fn new(job_id: &str, target_lat: f64, target_lng: f64) -> Self {
        Self {
            job_id: job_id.to_string(),
            target_lat,
            target_lng,
            threshold_m: ARRIVAL_THRESHOLD_M,
        }
    }

    pub fn with_threshold(mut self, threshold_m: f64) -> Self {
        self.threshold_m = threshold_m;
        self
    }

    pub fn distance_from(&self, lat: f64, lng: f64) -> f64 {
        haversine_distance_m(lat, lng, self.target_lat, self.target_lng)
    }

    /// Whether a measured distance opens the gate. The boundary is
    /// inclusive: exactly at the threshold still counts as arrived.
    pub fn is_distance_within(&self, distance_m: f64) -> bool {
        distance_m <= self.threshold_m
    }

    /// Whether the current position opens the gate.
    pub fn is_within_range(&self, lat: f64, lng: f64) -> bool {
        self.is_distance_within(self.distance_from(lat, lng))
    }

    /// Confirms arrival with the remote service. The server may still reject
    /// with its own distance validation; that surfaces as
    /// [`TerraError::ArrivalRejected`] and the gate stays open for another
    /// attempt.
    pub async fn confirm_arrival(
        &self,
        api: &dyn SurveyApi,
        lat: f64,
        lng: f64,
        accuracy: f64,
    ) -> TerraResult<()> {
        let update = LocationUpdate { lat, lng, accuracy };
        match api.confirm_arrival(&self.job_id, &update).await {
            Err(e) if e.is_rejection() => Err(TerraError::ArrivalRejected(e.to_string())),
            other => other,
        }
    }
}

/// Human-readable distance label: meters under a kilometer, otherwise
/// kilometers with one decimal.
pub fn format_distance(meters: f64) -> String {
    if meters < 1000.0 {
        format!("{} m", meters.round() as i64)
    } else {
        format!("{:.1} km", meters / 1000.0)
    }
}
