use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Last-known snapshot of the signed-in client, persisted locally.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[serde(rename_all = "camelCase")]
pub struct ClientProfile {
    pub id: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub dietitian_name: Option<String>,
    #[serde(default)]
    pub onboarding_completed: bool,
}

impl ClientProfile {
    pub fn display_name(&self) -> String {
        match (&self.first_name, &self.last_name) {
            (Some(first), Some(last)) => format!("{} {}", first, last),
            (Some(first), None) => first.clone(),
            (None, Some(last)) => last.clone(),
            (None, None) => self.phone.clone().unwrap_or_else(|| self.id.clone()),
        }
    }
}

/// Response to a successful OTP verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSession {
    pub token: String,
    pub client: ClientProfile,
}

/// Adherence scores computed by the server. Consumed read-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[serde(rename_all = "camelCase")]
pub struct AdherenceSummary {
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub score: f64,
    #[serde(default)]
    pub meals_logged: u32,
    #[serde(default)]
    pub weights_logged: u32,
}

impl AdherenceSummary {
    pub fn score_display(&self) -> String {
        format!("{:.0}%", (self.score * 100.0).clamp(0.0, 100.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name_fallbacks() {
        let mut profile = ClientProfile {
            id: "c1".into(),
            phone: Some("+15550100".into()),
            ..Default::default()
        };
        assert_eq!(profile.display_name(), "+15550100");
        profile.first_name = Some("Ana".into());
        assert_eq!(profile.display_name(), "Ana");
        profile.last_name = Some("Ruiz".into());
        assert_eq!(profile.display_name(), "Ana Ruiz");
    }

    #[test]
    fn test_score_display_clamps() {
        let summary = AdherenceSummary {
            period_start: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            period_end: NaiveDate::from_ymd_opt(2024, 1, 7).unwrap(),
            score: 0.857,
            meals_logged: 18,
            weights_logged: 6,
        };
        assert_eq!(summary.score_display(), "86%");
        let over = AdherenceSummary { score: 1.4, ..summary };
        assert_eq!(over.score_display(), "100%");
    }
}
