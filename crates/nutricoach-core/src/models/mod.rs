//! Data models for the diet-coaching API.
//!
//! This module contains the data structures exchanged with the backend:
//!
//! - `WeightLog`, `NewWeightLog`: Body-weight entries keyed by logical date
//! - `MealLog`, `NewMealLog`, `PhotoAttachment`: Meal entries and their photo
//! - `ClientProfile`, `AdherenceSummary`: Client snapshot and server-computed scores
//! - `OnboardingStep`: Step-keyed onboarding payloads

pub mod meal;
pub mod onboarding;
pub mod profile;
pub mod weight;

pub use meal::{MealLog, MealType, NewMealLog, PhotoAttachment, UploadTicket};
pub use onboarding::{
    ActivityLevel, Basics, BodyMetrics, DietaryPreferences, Goals, OnboardingError, OnboardingStep,
    Sex,
};
pub use profile::{AdherenceSummary, AuthSession, ClientProfile};
pub use weight::{NewWeightLog, WeightLog};

/// Entities whose canonical identifier is assigned by the server.
pub trait ServerIdentified {
    fn server_id(&self) -> &str;
}
