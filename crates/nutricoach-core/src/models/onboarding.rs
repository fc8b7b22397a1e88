//! Onboarding payloads, one variant per step.
//!
//! The backend accepts `PUT /onboarding/steps/{n}` with a step-specific body.
//! Each variant validates its own fields before it is sent.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sex {
    Female,
    Male,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityLevel {
    Sedentary,
    Light,
    Moderate,
    Active,
    VeryActive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Basics {
    pub first_name: String,
    pub last_name: String,
    pub birth_year: i32,
    pub sex: Sex,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BodyMetrics {
    pub height_cm: f64,
    pub weight_kg: f64,
    pub activity_level: ActivityLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Goals {
    pub target_weight_kg: f64,
    #[serde(default)]
    pub weekly_change_kg: Option<f64>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DietaryPreferences {
    #[serde(default)]
    pub restrictions: Vec<String>,
    #[serde(default)]
    pub allergies: Vec<String>,
    #[serde(default)]
    pub meals_per_day: Option<u8>,
}

/// A single onboarding step, keyed by its step number.
#[derive(Debug, Clone, PartialEq)]
pub enum OnboardingStep {
    Basics(Basics),
    BodyMetrics(BodyMetrics),
    Goals(Goals),
    DietaryPreferences(DietaryPreferences),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OnboardingError {
    #[error("Unknown onboarding step {0}")]
    UnknownStep(u8),

    #[error("Invalid payload for step {step}: {reason}")]
    InvalidPayload { step: u8, reason: String },

    #[error("{field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> OnboardingError {
    OnboardingError::Invalid {
        field,
        reason: reason.into(),
    }
}

impl OnboardingStep {
    pub const FIRST: u8 = 1;
    pub const LAST: u8 = 4;

    pub fn number(&self) -> u8 {
        match self {
            OnboardingStep::Basics(_) => 1,
            OnboardingStep::BodyMetrics(_) => 2,
            OnboardingStep::Goals(_) => 3,
            OnboardingStep::DietaryPreferences(_) => 4,
        }
    }

    /// Decode a step body received as untyped JSON
    pub fn from_payload(step: u8, payload: Value) -> Result<Self, OnboardingError> {
        let decode_err = |e: serde_json::Error| OnboardingError::InvalidPayload {
            step,
            reason: e.to_string(),
        };
        let parsed = match step {
            1 => OnboardingStep::Basics(serde_json::from_value(payload).map_err(decode_err)?),
            2 => OnboardingStep::BodyMetrics(serde_json::from_value(payload).map_err(decode_err)?),
            3 => OnboardingStep::Goals(serde_json::from_value(payload).map_err(decode_err)?),
            4 => OnboardingStep::DietaryPreferences(
                serde_json::from_value(payload).map_err(decode_err)?,
            ),
            other => return Err(OnboardingError::UnknownStep(other)),
        };
        parsed.validate()?;
        Ok(parsed)
    }

    /// Encode the step body for the wire
    pub fn to_payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            OnboardingStep::Basics(v) => serde_json::to_value(v),
            OnboardingStep::BodyMetrics(v) => serde_json::to_value(v),
            OnboardingStep::Goals(v) => serde_json::to_value(v),
            OnboardingStep::DietaryPreferences(v) => serde_json::to_value(v),
        }
    }

    pub fn validate(&self) -> Result<(), OnboardingError> {
        match self {
            OnboardingStep::Basics(b) => {
                if b.first_name.trim().is_empty() {
                    return Err(invalid("firstName", "is required"));
                }
                if b.last_name.trim().is_empty() {
                    return Err(invalid("lastName", "is required"));
                }
                if !(1900..=2020).contains(&b.birth_year) {
                    return Err(invalid("birthYear", format!("{} is out of range", b.birth_year)));
                }
            }
            OnboardingStep::BodyMetrics(m) => {
                if !(50.0..=260.0).contains(&m.height_cm) {
                    return Err(invalid("heightCm", "must be between 50 and 260"));
                }
                if !(20.0..=400.0).contains(&m.weight_kg) {
                    return Err(invalid("weightKg", "must be between 20 and 400"));
                }
            }
            OnboardingStep::Goals(g) => {
                if !(20.0..=400.0).contains(&g.target_weight_kg) {
                    return Err(invalid("targetWeightKg", "must be between 20 and 400"));
                }
                if let Some(rate) = g.weekly_change_kg {
                    if rate.abs() > 1.5 {
                        return Err(invalid("weeklyChangeKg", "must be at most 1.5 kg per week"));
                    }
                }
            }
            OnboardingStep::DietaryPreferences(p) => {
                if let Some(n) = p.meals_per_day {
                    if !(1..=8).contains(&n) {
                        return Err(invalid("mealsPerDay", "must be between 1 and 8"));
                    }
                }
                if p.restrictions.iter().chain(&p.allergies).any(|s| s.trim().is_empty()) {
                    return Err(invalid("restrictions", "entries must not be blank"));
                }
            }
        }
        Ok(())
    }
}
