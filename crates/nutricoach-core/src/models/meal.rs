use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::ServerIdentified;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[serde(rename_all = "lowercase")]
pub enum MealType {
    Breakfast,
    Lunch,
    Dinner,
    Snack,
}

impl MealType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "breakfast" => Some(MealType::Breakfast),
            "lunch" => Some(MealType::Lunch),
            "dinner" => Some(MealType::Dinner),
            "snack" => Some(MealType::Snack),
            _ => None,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            MealType::Breakfast => "Breakfast",
            MealType::Lunch => "Lunch",
            MealType::Dinner => "Dinner",
            MealType::Snack => "Snack",
        }
    }
}

/// A meal entry as persisted by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[serde(rename_all = "camelCase")]
pub struct MealLog {
    pub id: String,
    pub meal_type: MealType,
    pub description: String,
    pub log_date: NaiveDate,
    #[serde(default)]
    pub calories: Option<u32>,
    #[serde(default)]
    pub photo_url: Option<String>,
    #[serde(default)]
    pub client_ref: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl ServerIdentified for MealLog {
    fn server_id(&self) -> &str {
        &self.id
    }
}

/// Payload for logging a meal.
///
/// `client_ref` is a client-generated placeholder; the server assigns the real id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[serde(rename_all = "camelCase")]
pub struct NewMealLog {
    pub client_ref: String,
    pub meal_type: MealType,
    pub description: String,
    pub log_date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calories: Option<u32>,
}

impl NewMealLog {
    pub fn new(meal_type: MealType, description: impl Into<String>, log_date: NaiveDate) -> Self {
        Self {
            client_ref: format!("local-{:016x}", rand::random::<u64>()),
            meal_type,
            description: description.into(),
            log_date,
            calories: None,
        }
    }

    pub fn mutation_key(&self) -> String {
        format!("meal:{}:{}", self.log_date, self.client_ref)
    }
}

/// Binary attachment uploaded after a meal is logged.
#[derive(Clone, PartialEq)]
pub struct PhotoAttachment {
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl PhotoAttachment {
    pub fn jpeg(bytes: Vec<u8>) -> Self {
        Self {
            content_type: "image/jpeg".to_string(),
            bytes,
        }
    }

    /// Guess the content type from a file extension, defaulting to JPEG
    pub fn from_path_bytes(path: &str, bytes: Vec<u8>) -> Self {
        let lower = path.to_lowercase();
        let content_type = if lower.ends_with(".png") {
            "image/png"
        } else if lower.ends_with(".heic") {
            "image/heic"
        } else if lower.ends_with(".webp") {
            "image/webp"
        } else {
            "image/jpeg"
        };
        Self {
            content_type: content_type.to_string(),
            bytes,
        }
    }
}

impl std::fmt::Debug for PhotoAttachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhotoAttachment")
            .field("content_type", &self.content_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Presigned upload target returned by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadTicket {
    pub upload_url: String,
    pub file_key: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meal_type_parse() {
        assert_eq!(MealType::parse("Lunch"), Some(MealType::Lunch));
        assert_eq!(MealType::parse(" snack "), Some(MealType::Snack));
        assert_eq!(MealType::parse("brunch"), None);
    }

    #[test]
    fn test_new_meal_log_placeholder_refs_are_unique() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 2).unwrap();
        let a = NewMealLog::new(MealType::Dinner, "Pasta", date);
        let b = NewMealLog::new(MealType::Dinner, "Pasta", date);
        assert!(a.client_ref.starts_with("local-"));
        assert_ne!(a.client_ref, b.client_ref);
        assert!(a.mutation_key().starts_with("meal:2024-03-02:local-"));
    }

    #[test]
    fn test_meal_log_wire_format() {
        let json = r#"{"id":"m-42","mealType":"breakfast","description":"Oats","logDate":"2024-03-02","clientRef":"local-1"}"#;
        let meal: MealLog = serde_json::from_str(json).expect("parse meal");
        assert_eq!(meal.server_id(), "m-42");
        assert_eq!(meal.meal_type, MealType::Breakfast);
        assert_eq!(meal.photo_url, None);
    }

    #[test]
    fn test_photo_content_type() {
        assert_eq!(PhotoAttachment::from_path_bytes("a.PNG", vec![]).content_type, "image/png");
        assert_eq!(PhotoAttachment::from_path_bytes("a.jpg", vec![]).content_type, "image/jpeg");
        assert_eq!(format!("{:?}", PhotoAttachment::jpeg(vec![1, 2, 3])), "PhotoAttachment { content_type: \"image/jpeg\", len: 3 }");
    }
}
