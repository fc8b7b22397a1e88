//! Application root.
//!
//! `Coach` owns the one `QueryClient` for the process and wires it to the
//! request gateway, token store and connectivity monitor. Front ends hold a
//! `Coach` and go through its queries and mutations; nothing else writes
//! the cache.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{Local, NaiveDate};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::api::{ApiClient, ErrorKind, NormalizedError, ReqwestTransport, TransportError};
use crate::auth::TokenStore;
use crate::cache::{
    merge_into_list, Mutation, QueryClient, QueryKey, QueryObserver, QueryOptions,
};
use crate::config::Config;
use crate::connectivity::ConnectivityMonitor;
use crate::models::{
    AdherenceSummary, ClientProfile, MealLog, NewMealLog, NewWeightLog, OnboardingStep,
    PhotoAttachment, WeightLog,
};
use crate::storage::keychain::SERVICE_NAME;
use crate::storage::{DeviceKey, FileStore, KeyValueStore, KeyringStore, Sealer};
use crate::upload::{
    with_secondary_upload, Decoupled, DecoupledMutation, UploadDiagnostics, WithAttachment,
};

// ============================================================================
// Constants
// ============================================================================

/// Number of weight entries kept in the cached history list
pub const WEIGHT_HISTORY_PAGE: usize = 30;

/// Number of meals kept per cached day
pub const MEALS_PAGE: usize = 50;

/// Adherence scores are recomputed server side; refetching often buys nothing
const ADHERENCE_STALE_SECS: u64 = 5 * 60;

const PROFILE_STALE_SECS: u64 = 10 * 60;

// ============================================================================
// Query keys
// ============================================================================

pub fn weight_history_key() -> QueryKey {
    QueryKey::from(["weightLogs", "history"])
}

pub fn meals_key(date: NaiveDate) -> QueryKey {
    QueryKey::from(["meals"]).with(date)
}

pub fn adherence_key() -> QueryKey {
    QueryKey::from(["adherence", "summary"])
}

pub fn profile_key() -> QueryKey {
    QueryKey::from(["profile"])
}

/// The diet-coaching client: cached queries, ordered mutations and session
/// handling over one API connection.
#[derive(Clone)]
pub struct Coach {
    api: ApiClient,
    queries: QueryClient,
    log_weight: Mutation<NewWeightLog, WeightLog>,
    log_meal: DecoupledMutation<NewMealLog, MealLog, PhotoAttachment>,
    submit_onboarding: Mutation<OnboardingStep, ()>,
}

impl Coach {
    pub fn new(api: ApiClient, connectivity: ConnectivityMonitor) -> Self {
        let queries = QueryClient::new(connectivity);
        let log_weight = log_weight_mutation(&api, &queries);
        let log_meal = log_meal_mutation(&api, &queries);
        let submit_onboarding = onboarding_mutation(&api, &queries);
        Self {
            api,
            queries,
            log_weight,
            log_meal,
            submit_onboarding,
        }
    }

    /// Production wiring: keychain token, sealed on-disk client snapshot and
    /// a reqwest transport.
    pub async fn from_config(config: &Config, connectivity: ConnectivityMonitor) -> Result<Self> {
        let secure: Arc<dyn KeyValueStore> = Arc::new(KeyringStore::new(SERVICE_NAME));
        let device_key = DeviceKey::load_or_create(SERVICE_NAME).await?;
        let local: Arc<dyn KeyValueStore> = Arc::new(FileStore::sealed(
            config.data_dir.clone(),
            Sealer::new(&device_key),
        ));
        let tokens = TokenStore::new(secure, local);

        let transport = Arc::new(ReqwestTransport::new()?);
        let api = ApiClient::new(transport, tokens, &config.api_base_url)
            .with_timeouts(config.request_timeout, config.upload_timeout);

        info!(base_url = %api.base_url(), "Coach client configured");
        Ok(Self::new(api, connectivity))
    }

    /// Spawn the cache's reconnect listener and garbage collector
    pub fn start(&self) -> JoinHandle<()> {
        self.queries.start()
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn queries(&self) -> &QueryClient {
        &self.queries
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        self.queries.connectivity()
    }

    pub fn tokens(&self) -> &TokenStore {
        self.api.tokens()
    }

    pub fn upload_diagnostics(&self) -> &UploadDiagnostics {
        self.queries.upload_diagnostics()
    }

    // =========================================================================
    // Queries
    // =========================================================================

    fn query<T, F, Fut>(&self, key: QueryKey, options: QueryOptions, fetch: F) -> QueryObserver<T>
    where
        T: serde::Serialize + serde::de::DeserializeOwned + Send + 'static,
        F: Fn(ApiClient) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, TransportError>> + Send + 'static,
    {
        let api = self.api.clone();
        self.queries.subscribe(
            key,
            move || {
                let request = fetch(api.clone());
                async move { request.await.map_err(NormalizedError::from) }
            },
            options,
        )
    }

    /// Most recent weight entries, newest first
    pub fn weight_history(&self) -> QueryObserver<Vec<WeightLog>> {
        self.query(weight_history_key(), QueryOptions::default(), |api| async move {
            api.fetch_weight_logs(WEIGHT_HISTORY_PAGE).await
        })
    }

    pub fn meals_for(&self, date: NaiveDate) -> QueryObserver<Vec<MealLog>> {
        self.query(meals_key(date), QueryOptions::default(), move |api| async move {
            api.fetch_meals(date).await
        })
    }

    pub fn meals_today(&self) -> QueryObserver<Vec<MealLog>> {
        self.meals_for(Local::now().date_naive())
    }

    pub fn adherence_summary(&self) -> QueryObserver<AdherenceSummary> {
        let options = QueryOptions::default().stale_after(Duration::from_secs(ADHERENCE_STALE_SECS));
        self.query(adherence_key(), options, |api| async move {
            api.fetch_adherence().await
        })
    }

    pub fn profile(&self) -> QueryObserver<ClientProfile> {
        let options = QueryOptions::default().stale_after(Duration::from_secs(PROFILE_STALE_SECS));
        self.query(profile_key(), options, |api| async move { api.fetch_profile().await })
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    pub fn log_weight_mutation(&self) -> &Mutation<NewWeightLog, WeightLog> {
        &self.log_weight
    }

    pub fn log_meal_mutation(&self) -> &DecoupledMutation<NewMealLog, MealLog, PhotoAttachment> {
        &self.log_meal
    }

    /// Log a weight. A second entry for the same date replaces the first.
    pub async fn log_weight(&self, entry: NewWeightLog) -> Result<WeightLog, NormalizedError> {
        self.log_weight.mutate(entry).await
    }

    /// Log a meal and, once it is saved, upload its photo in the background.
    ///
    /// The meal result does not depend on the photo upload.
    pub async fn log_meal(
        &self,
        entry: NewMealLog,
        photo: Option<PhotoAttachment>,
    ) -> Result<Decoupled<MealLog>, NormalizedError> {
        self.log_meal.mutate(WithAttachment::new(entry, photo)).await
    }

    pub async fn submit_onboarding(&self, step: OnboardingStep) -> Result<(), NormalizedError> {
        step.validate()
            .map_err(|e| NormalizedError::new(ErrorKind::ValidationError, e.to_string(), false))?;
        self.submit_onboarding.mutate(step).await
    }

    // =========================================================================
    // Session
    // =========================================================================

    pub async fn request_otp(&self, phone: &str) -> Result<(), NormalizedError> {
        Ok(self.api.request_otp(phone).await?)
    }

    /// Verify an OTP code, persist the session and seed the profile query
    pub async fn verify_otp(&self, phone: &str, code: &str) -> Result<ClientProfile, NormalizedError> {
        let session = self.api.verify_otp(phone, code).await?;
        self.queries.set_query_data(&profile_key(), &session.client)?;
        info!(client_id = %session.client.id, "Signed in");
        Ok(session.client)
    }

    /// Restore the persisted session, if it is still valid.
    ///
    /// Returns the last known client snapshot and seeds the profile query
    /// with it so screens have data before the first fetch completes.
    pub async fn restore_session(&self) -> Result<Option<ClientProfile>> {
        let tokens = self.tokens();
        if tokens.check_session_expiry().await? {
            info!("Session expired after inactivity");
            tokens.clear_client_data().await?;
            return Ok(None);
        }
        if tokens.get_token().await?.is_none() {
            debug!("No stored session");
            return Ok(None);
        }
        let profile = tokens.get_client_data().await?;
        if let Some(profile) = &profile {
            self.queries.set_query_data(&profile_key(), profile)?;
        }
        Ok(profile)
    }

    pub async fn is_authenticated(&self) -> bool {
        matches!(self.tokens().get_token().await, Ok(Some(_)))
    }

    /// Forget the session and every cached query
    pub async fn sign_out(&self) -> Result<()> {
        let tokens = self.tokens();
        tokens.remove_token().await?;
        tokens.clear_client_data().await?;
        self.queries.clear();
        info!("Signed out");
        Ok(())
    }
}

fn log_weight_mutation(api: &ApiClient, queries: &QueryClient) -> Mutation<NewWeightLog, WeightLog> {
    let api = api.clone();
    queries
        .mutation("log_weight", move |entry: NewWeightLog| {
            let api = api.clone();
            async move { api.log_weight(&entry).await.map_err(NormalizedError::from) }
        })
        .key(NewWeightLog::mutation_key)
        .on_success(|queries, _, saved: &WeightLog| {
            queries.update_query_data::<Vec<WeightLog>, _>(&weight_history_key(), |history| {
                merge_into_list(history, saved.clone(), |w| w.log_date, WEIGHT_HISTORY_PAGE);
            });
        })
        .invalidates(QueryKey::from(["weightLogs"]))
        .invalidates(QueryKey::from(["adherence"]))
}

fn log_meal_mutation(
    api: &ApiClient,
    queries: &QueryClient,
) -> DecoupledMutation<NewMealLog, MealLog, PhotoAttachment> {
    let primary = {
        let api = api.clone();
        queries
            .mutation("log_meal", move |entry: NewMealLog| {
                let api = api.clone();
                async move { api.log_meal(&entry).await.map_err(NormalizedError::from) }
            })
            .key(NewMealLog::mutation_key)
            .on_success(|queries, _, saved: &MealLog| {
                merge_meal(queries, saved);
            })
            .invalidates(QueryKey::from(["meals"]))
            .invalidates(QueryKey::from(["adherence"]))
    };

    let api = api.clone();
    let queries = queries.clone();
    with_secondary_upload(primary, move |meal_id: String, photo: PhotoAttachment| {
        let api = api.clone();
        let queries = queries.clone();
        async move {
            let updated = api
                .upload_meal_photo(&meal_id, &photo)
                .await
                .map_err(NormalizedError::from)?;
            merge_meal(&queries, &updated);
            Ok(())
        }
    })
}

fn merge_meal(queries: &QueryClient, meal: &MealLog) {
    queries.update_query_data::<Vec<MealLog>, _>(&meals_key(meal.log_date), |meals| {
        merge_into_list(meals, meal.clone(), |m| m.id.clone(), MEALS_PAGE);
    });
}

fn onboarding_mutation(api: &ApiClient, queries: &QueryClient) -> Mutation<OnboardingStep, ()> {
    let api = api.clone();
    queries
        .mutation("submit_onboarding", move |step: OnboardingStep| {
            let api = api.clone();
            async move { api.submit_onboarding_step(&step).await.map_err(NormalizedError::from) }
        })
        .key(|step| format!("onboarding:{}", step.number()))
        .invalidates(profile_key())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::{ok, status, ScriptedTransport};
    use crate::api::HttpRequest;
    use crate::cache::QueryStatus;
    use crate::models::{Basics, MealType, Sex};
    use reqwest::Method;
    use serde_json::{json, Value};
    use std::sync::Mutex;

    const BASE: &str = "https://api.test/v1";

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    /// Minimal stateful stand-in for the backend
    #[derive(Default)]
    struct Backend {
        weights: Vec<Value>,
        meals: Vec<Value>,
        next_id: u32,
        fail_photo_upload: bool,
    }

    impl Backend {
        fn handle(&mut self, request: &HttpRequest) -> Result<crate::api::HttpResponse, TransportError> {
            if request.url.starts_with("https://storage.test/") {
                return if self.fail_photo_upload {
                    Err(TransportError::NoResponse("connection reset".into()))
                } else {
                    status(200, json!(null))
                };
            }

            let path = request.url.trim_start_matches(BASE).trim_start_matches('/');
            let (path, query) = path.split_once('?').unwrap_or((path, ""));
            let body = request.json_body().cloned().unwrap_or(Value::Null);
            let segments: Vec<&str> = path.split('/').collect();

            match (request.method.as_str(), segments.as_slice()) {
                ("GET", ["weight-logs"]) => ok(json!(self.weights)),
                ("POST", ["weight-logs"]) => {
                    self.next_id += 1;
                    let entry = json!({
                        "id": format!("w-{}", self.next_id),
                        "weightKg": body["weightKg"],
                        "logDate": body["logDate"],
                    });
                    self.weights.retain(|w| w["logDate"] != body["logDate"]);
                    self.weights.insert(0, entry.clone());
                    ok(entry)
                }
                ("GET", ["meal-logs"]) => {
                    let day = query.trim_start_matches("date=");
                    let meals: Vec<&Value> =
                        self.meals.iter().filter(|m| m["logDate"] == day).collect();
                    ok(json!(meals))
                }
                ("POST", ["meal-logs"]) => {
                    self.next_id += 1;
                    let meal = json!({
                        "id": format!("meal-{}", self.next_id),
                        "mealType": body["mealType"],
                        "description": body["description"],
                        "logDate": body["logDate"],
                        "clientRef": body["clientRef"],
                    });
                    self.meals.insert(0, meal.clone());
                    ok(meal)
                }
                ("POST", ["meal-logs", id, "photo", "upload-url"]) => ok(json!({
                    "uploadUrl": format!("https://storage.test/put/{}", id),
                    "fileKey": format!("meals/{}.jpg", id),
                })),
                ("POST", ["meal-logs", id, "photo"]) => {
                    let meal = self.meals.iter_mut().find(|m| m["id"] == *id);
                    match meal {
                        Some(meal) => {
                            meal["photoUrl"] = json!(format!("https://cdn.test/{}", body["fileKey"].as_str().unwrap_or("")));
                            ok(meal.clone())
                        }
                        None => status(404, json!({"message": "Meal not found"})),
                    }
                }
                ("GET", ["adherence", "summary"]) => ok(json!({
                    "periodStart": "2024-01-01",
                    "periodEnd": "2024-01-07",
                    "score": 0.8,
                    "mealsLogged": self.meals.len(),
                    "weightsLogged": self.weights.len(),
                })),
                ("GET", ["clients", "me"]) => ok(json!({"id": "c-1", "firstName": "Ana"})),
                ("PUT", ["onboarding", "steps", _]) => ok(Value::Null),
                ("POST", ["auth", "otp", "verify"]) => ok(json!({
                    "token": "tok-123",
                    "client": {"id": "c-1", "firstName": "Ana", "phone": "+15550100"},
                })),
                _ => status(404, json!({"message": "No route"})),
            }
        }
    }

    struct Harness {
        coach: Coach,
        transport: ScriptedTransport,
        backend: Arc<Mutex<Backend>>,
        tokens: TokenStore,
    }

    fn harness(online: bool) -> Harness {
        let backend = Arc::new(Mutex::new(Backend::default()));
        let state = backend.clone();
        let transport = ScriptedTransport::new(move |request| state.lock().unwrap().handle(request));
        harness_with(transport, backend, online)
    }

    fn harness_with(
        transport: ScriptedTransport,
        backend: Arc<Mutex<Backend>>,
        online: bool,
    ) -> Harness {
        let tokens = TokenStore::in_memory();
        let api = ApiClient::new(Arc::new(transport.clone()), tokens.clone(), BASE);
        let coach = Coach::new(api, ConnectivityMonitor::new(online));
        Harness {
            coach,
            transport,
            backend,
            tokens,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_weight_log_is_queued_then_merged_at_head() {
        let h = harness(false);
        let background = h.coach.start();
        let mut history = h.coach.weight_history();

        let task = {
            let coach = h.coach.clone();
            tokio::spawn(async move { coach.log_weight(NewWeightLog::new(72.0, date("2024-01-01"))).await })
        };
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(h.transport.requests().is_empty(), "nothing is sent while offline");
        assert!(h.coach.log_weight_mutation().is_pending());

        h.coach.connectivity().report(true);
        let saved = task.await.unwrap().unwrap();
        assert_eq!(saved.weight_kg, 72.0);
        assert_eq!(h.transport.count(Method::POST, "/weight-logs"), 1);

        let snap = history.settled().await;
        let entries = snap.data.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].weight_kg, 72.0);
        assert_eq!(entries[0].log_date, date("2024-01-01"));
        assert_eq!(h.transport.count(Method::POST, "/weight-logs"), 1);
        background.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_day_weight_replaces_entry() {
        let h = harness(true);
        {
            let mut backend = h.backend.lock().unwrap();
            backend.weights.push(json!({"id": "w-0", "weightKg": 75.0, "logDate": "2023-12-31"}));
        }
        let mut history = h.coach.weight_history();
        history.settled().await;

        h.coach.log_weight(NewWeightLog::new(72.0, date("2024-01-01"))).await.unwrap();
        h.coach.log_weight(NewWeightLog::new(71.5, date("2024-01-01"))).await.unwrap();

        // Optimistic state, before any refetch lands
        let optimistic = history.data().unwrap();
        let same_day: Vec<_> = optimistic.iter().filter(|w| w.log_date == date("2024-01-01")).collect();
        assert_eq!(same_day.len(), 1);
        assert_eq!(same_day[0].weight_kg, 71.5);
        assert_eq!(optimistic[0].log_date, date("2024-01-01"));

        let settled = history.settled().await.data.unwrap();
        assert_eq!(settled.len(), 2);
        assert_eq!(settled[0].weight_kg, 71.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_recovers_after_two_server_errors() {
        let transport = ScriptedTransport::sequence(vec![
            status(500, json!({"message": "db down"})),
            status(500, json!({"message": "db down"})),
            ok(json!({"periodStart": "2024-01-01", "periodEnd": "2024-01-07", "score": 0.5})),
        ]);
        let h = harness_with(transport, Arc::new(Mutex::new(Backend::default())), true);

        let start = tokio::time::Instant::now();
        let mut adherence = h.coach.adherence_summary();
        let snap = adherence.settled().await;

        assert_eq!(snap.status, QueryStatus::Success);
        assert_eq!(snap.data.unwrap().score_display(), "50%");
        assert_eq!(h.transport.requests().len(), 3);
        // Backoff of 1s then 2s
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(3000));
        assert!(elapsed < Duration::from_millis(3100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_meal_logged_even_when_photo_upload_fails() {
        let h = harness(true);
        h.backend.lock().unwrap().fail_photo_upload = true;
        let day = date("2024-01-02");
        let mut meals = h.coach.meals_for(day);
        meals.settled().await;

        let entry = NewMealLog::new(MealType::Lunch, "Chicken salad", day);
        let placeholder = entry.client_ref.clone();
        let result = h
            .coach
            .log_meal(entry, Some(PhotoAttachment::jpeg(vec![0xFF, 0xD8])))
            .await
            .unwrap();
        assert_eq!(result.output.id, "meal-1");
        assert_eq!(result.output.client_ref.as_deref(), Some(placeholder.as_str()));

        let upload = result.upload.unwrap();
        assert_eq!(upload.owner_id(), "meal-1");
        let settled = upload.settled().await.unwrap();
        assert_eq!(settled.error.map(|e| e.title()), Some("Connection Error"));

        let failures = h.coach.upload_diagnostics().failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].mutation, "log_meal");

        let cached = meals.settled().await.data.unwrap();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].photo_url, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_meal_photo_upload_updates_cache() {
        let h = harness(true);
        let day = date("2024-01-02");
        let mut meals = h.coach.meals_for(day);
        meals.settled().await;

        let result = h
            .coach
            .log_meal(
                NewMealLog::new(MealType::Dinner, "Salmon", day),
                Some(PhotoAttachment::jpeg(vec![1, 2, 3])),
            )
            .await
            .unwrap();
        assert!(result.upload.unwrap().settled().await.unwrap().succeeded());

        let uploads = h.transport.requests();
        let put = uploads
            .iter()
            .find(|r| r.url == "https://storage.test/put/meal-1")
            .unwrap();
        assert!(put.bearer.is_none());

        let cached = meals.settled().await.data.unwrap();
        assert_eq!(
            cached[0].photo_url.as_deref(),
            Some("https://cdn.test/meals/meal-1.jpg")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_clears_token() {
        let transport = ScriptedTransport::new(|_| status(401, json!({"message": "Token expired"})));
        let h = harness_with(transport, Arc::new(Mutex::new(Backend::default())), true);
        h.tokens.set_token("stale-token").await.unwrap();

        let mut history = h.coach.weight_history();
        let snap = history.settled().await;

        assert_eq!(snap.status, QueryStatus::Error);
        let error = snap.error.unwrap();
        assert_eq!(error.title(), "Session Expired");
        assert!(error.is_unauthorized());
        assert_eq!(h.tokens.get_token().await.unwrap(), None);
        assert!(!h.coach.is_authenticated().await);
        // Not retryable, so a single attempt
        assert_eq!(h.transport.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_in_restore_and_sign_out() {
        let h = harness(true);
        let client = h.coach.verify_otp("+15550100", "123456").await.unwrap();
        assert_eq!(client.display_name(), "Ana");
        assert!(h.coach.is_authenticated().await);
        assert_eq!(
            h.coach.queries().get_query_data::<ClientProfile>(&profile_key()),
            Some(client.clone())
        );

        h.coach.queries().clear();
        let restored = h.coach.restore_session().await.unwrap();
        assert_eq!(restored, Some(client));
        assert!(h.coach.queries().contains(&profile_key()));

        h.coach.sign_out().await.unwrap();
        assert!(!h.coach.is_authenticated().await);
        assert!(h.coach.queries().is_empty());
        assert_eq!(h.coach.restore_session().await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_onboarding_validated_before_sending() {
        let h = harness(true);
        let invalid = OnboardingStep::Basics(Basics {
            first_name: String::new(),
            last_name: "Silva".into(),
            birth_year: 1990,
            sex: Sex::Female,
        });
        let err = h.coach.submit_onboarding(invalid).await.unwrap_err();
        assert_eq!(err.title(), "Validation Error");
        assert!(!err.retryable);
        assert!(h.transport.requests().is_empty());

        let valid = OnboardingStep::Basics(Basics {
            first_name: "Ana".into(),
            last_name: "Silva".into(),
            birth_year: 1990,
            sex: Sex::Female,
        });
        h.coach.submit_onboarding(valid).await.unwrap();
        assert_eq!(h.transport.count(Method::PUT, "/onboarding/steps/1"), 1);
    }
}
