use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::ServerIdentified;

/// A persisted body-weight entry. At most one entry exists per `log_date`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[serde(rename_all = "camelCase")]
pub struct WeightLog {
    pub id: String,
    pub weight_kg: f64,
    pub log_date: NaiveDate,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl WeightLog {
    pub fn display_weight(&self) -> String {
        format!("{:.1} kg", self.weight_kg)
    }
}

impl ServerIdentified for WeightLog {
    fn server_id(&self) -> &str {
        &self.id
    }
}

/// Payload for logging a weight. Logging twice for the same date overwrites.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[serde(rename_all = "camelCase")]
pub struct NewWeightLog {
    pub weight_kg: f64,
    pub log_date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl NewWeightLog {
    pub fn new(weight_kg: f64, log_date: NaiveDate) -> Self {
        Self {
            weight_kg,
            log_date,
            notes: None,
        }
    }

    /// Idempotency-relevant key: one pending submission stream per date
    pub fn mutation_key(&self) -> String {
        format!("weight:{}", self.log_date)
    }
}
