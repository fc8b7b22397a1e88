//! Request gateway for the diet-coaching REST API.
//!
//! This module provides the `ApiClient` struct: a single wrapper around the
//! HTTP transport that attaches the bearer token, enforces timeouts, unwraps
//! the `{success, data}` envelope, and clears the token on a 401.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use reqwest::Method;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::auth::TokenStore;
use crate::models::{
    AdherenceSummary, AuthSession, ClientProfile, MealLog, NewMealLog, NewWeightLog,
    OnboardingStep, PhotoAttachment, UploadTicket, WeightLog,
};

use super::transport::{HttpRequest, HttpResponse, RequestBody, Transport};
use super::TransportError;

// ============================================================================
// Constants
// ============================================================================

/// Default timeout for JSON requests.
pub const REQUEST_TIMEOUT_SECS: u64 = 15;

/// Timeout for binary payload uploads (meal photos).
pub const UPLOAD_TIMEOUT_SECS: u64 = 60;

/// Per-call options.
#[derive(Debug, Clone, Copy)]
pub struct RequestConfig {
    /// Overrides the client's default timeout
    pub timeout: Option<Duration>,
    /// Attach the bearer token when one is stored
    pub authenticated: bool,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            authenticated: true,
        }
    }
}

impl RequestConfig {
    pub fn anonymous() -> Self {
        Self {
            authenticated: false,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

fn default_success() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default = "default_success")]
    success: bool,
    data: Option<T>,
}

/// API client for the coaching backend.
/// Clone is cheap - the transport and token store are shared.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    tokens: TokenStore,
    base_url: String,
    request_timeout: Duration,
    upload_timeout: Duration,
}

impl ApiClient {
    pub fn new(transport: Arc<dyn Transport>, tokens: TokenStore, base_url: &str) -> Self {
        Self {
            transport,
            tokens,
            base_url: base_url.trim_end_matches('/').to_string(),
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            upload_timeout: Duration::from_secs(UPLOAD_TIMEOUT_SECS),
        }
    }

    pub fn with_timeouts(mut self, request: Duration, upload: Duration) -> Self {
        self.request_timeout = request;
        self.upload_timeout = upload;
        self
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Send one request and unwrap the response envelope.
    ///
    /// Fails with the raw `TransportError`; callers normalize it.
    pub async fn request<T, B>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        config: RequestConfig,
    ) -> Result<T, TransportError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let body = body
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| TransportError::Other(format!("Failed to encode request body: {}", e)))?
            .map(RequestBody::Json);

        let bearer = if config.authenticated {
            self.bearer_token().await
        } else {
            None
        };
        let authenticated = bearer.is_some();

        let request = HttpRequest {
            method,
            url: self.url(path),
            bearer,
            body,
            timeout: config.timeout.unwrap_or(self.request_timeout),
        };
        let response = self.send(request).await?;
        let response = self.check_response(response).await?;

        if authenticated {
            if let Err(e) = self.tokens.record_activity().await {
                debug!(error = %e, "Failed to record session activity");
            }
        }
        Self::unwrap_envelope(response)
    }

    async fn bearer_token(&self) -> Option<String> {
        match self.tokens.get_token().await {
            Ok(token) => token,
            Err(e) => {
                // Unauthenticated calls still go through and fail naturally
                warn!(error = %e, "Failed to read auth token, sending without credentials");
                None
            }
        }
    }

    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let timeout = request.timeout;
        let method = request.method.clone();
        let url = request.url.clone();
        debug!(%method, url = %url, "Sending request");

        match tokio::time::timeout(timeout, self.transport.send(request)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(%method, url = %url, timeout_ms = timeout.as_millis() as u64, "Request timed out");
                Err(TransportError::Timeout)
            }
        }
    }

    /// Check if the response is successful, returning an error with body if not.
    /// A 401 clears the stored token before the error is returned.
    async fn check_response(&self, response: HttpResponse) -> Result<HttpResponse, TransportError> {
        if response.is_success() {
            return Ok(response);
        }
        if response.status == 401 {
            info!("Received 401, clearing stored credentials");
            if let Err(e) = self.tokens.remove_token().await {
                warn!(error = %e, "Failed to clear auth token after 401");
            }
        }
        Err(TransportError::from_status(response.status, &response.body))
    }

    fn unwrap_envelope<T: DeserializeOwned>(response: HttpResponse) -> Result<T, TransportError> {
        let body = response.body.trim();
        let envelope: Envelope<T> = if body.is_empty() {
            Envelope {
                success: true,
                data: None,
            }
        } else {
            serde_json::from_str(body)?
        };

        if !envelope.success {
            return Err(TransportError::from_status(response.status, &response.body));
        }
        match envelope.data {
            Some(data) => Ok(data),
            None => Ok(serde_json::from_value(Value::Null)?),
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, TransportError> {
        self.request::<T, Value>(Method::GET, path, None, RequestConfig::default())
            .await
    }

    async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, TransportError> {
        self.request(Method::POST, path, Some(body), RequestConfig::default())
            .await
    }

    // ===== Auth =====

    pub async fn request_otp(&self, phone: &str) -> Result<(), TransportError> {
        self.request(
            Method::POST,
            "auth/otp/request",
            Some(&json!({ "phone": phone })),
            RequestConfig::anonymous(),
        )
        .await
    }

    /// Verify an OTP code and persist the resulting session
    pub async fn verify_otp(&self, phone: &str, code: &str) -> Result<AuthSession, TransportError> {
        let session: AuthSession = self
            .request(
                Method::POST,
                "auth/otp/verify",
                Some(&json!({ "phone": phone, "code": code })),
                RequestConfig::anonymous(),
            )
            .await?;

        self.tokens
            .set_token(&session.token)
            .await
            .map_err(|e| TransportError::Other(format!("Failed to store session: {:#}", e)))?;
        if let Err(e) = self.tokens.set_client_data(&session.client).await {
            warn!(error = %e, "Failed to persist client snapshot");
        }
        Ok(session)
    }

    // ===== Data Fetching Methods =====

    pub async fn fetch_profile(&self) -> Result<ClientProfile, TransportError> {
        let profile: ClientProfile = self.get("clients/me").await?;
        if let Err(e) = self.tokens.set_client_data(&profile).await {
            warn!(error = %e, "Failed to persist client snapshot");
        }
        Ok(profile)
    }

    pub async fn fetch_weight_logs(&self, limit: usize) -> Result<Vec<WeightLog>, TransportError> {
        self.get(&format!("weight-logs?limit={}", limit)).await
    }

    pub async fn fetch_meals(&self, date: NaiveDate) -> Result<Vec<MealLog>, TransportError> {
        self.get(&format!("meal-logs?date={}", date)).await
    }

    pub async fn fetch_adherence(&self) -> Result<AdherenceSummary, TransportError> {
        self.get("adherence/summary").await
    }

    // ===== Mutations =====

    pub async fn log_weight(&self, entry: &NewWeightLog) -> Result<WeightLog, TransportError> {
        self.post("weight-logs", entry).await
    }

    pub async fn log_meal(&self, entry: &NewMealLog) -> Result<MealLog, TransportError> {
        self.post("meal-logs", entry).await
    }

    pub async fn submit_onboarding_step(&self, step: &OnboardingStep) -> Result<(), TransportError> {
        step.validate()
            .map_err(|e| TransportError::Other(e.to_string()))?;
        let payload = step.to_payload()?;
        self.request(
            Method::PUT,
            &format!("onboarding/steps/{}", step.number()),
            Some(&payload),
            RequestConfig::default(),
        )
        .await
    }

    // ===== Presigned photo upload =====

    /// Step 1: ask the server where to PUT the bytes
    pub async fn request_meal_photo_upload(
        &self,
        meal_id: &str,
        content_type: &str,
    ) -> Result<UploadTicket, TransportError> {
        self.post(
            &format!("meal-logs/{}/photo/upload-url", meal_id),
            &json!({ "contentType": content_type }),
        )
        .await
    }

    /// Step 2: PUT the bytes to the presigned URL. No bearer token is sent.
    pub async fn upload_to_presigned_url(
        &self,
        ticket: &UploadTicket,
        photo: &PhotoAttachment,
    ) -> Result<(), TransportError> {
        let request = HttpRequest {
            method: Method::PUT,
            url: ticket.upload_url.clone(),
            bearer: None,
            body: Some(RequestBody::Bytes {
                content_type: photo.content_type.clone(),
                bytes: photo.bytes.clone(),
            }),
            timeout: self.upload_timeout,
        };
        let response = self.send(request).await?;
        if response.is_success() {
            Ok(())
        } else {
            Err(TransportError::from_status(response.status, &response.body))
        }
    }

    /// Step 3: register the uploaded file against the meal
    pub async fn register_meal_photo(
        &self,
        meal_id: &str,
        file_key: &str,
    ) -> Result<MealLog, TransportError> {
        self.post(
            &format!("meal-logs/{}/photo", meal_id),
            &json!({ "fileKey": file_key }),
        )
        .await
    }

    /// Run the full three-step photo flow for a persisted meal
    pub async fn upload_meal_photo(
        &self,
        meal_id: &str,
        photo: &PhotoAttachment,
    ) -> Result<MealLog, TransportError> {
        let ticket = self
            .request_meal_photo_upload(meal_id, &photo.content_type)
            .await?;
        self.upload_to_presigned_url(&ticket, photo).await?;
        self.register_meal_photo(meal_id, &ticket.file_key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::{ok, status, ScriptedTransport};
    use crate::api::{normalize, ErrorKind};

    const BASE: &str = "https://api.test/v1";

    fn client(transport: &ScriptedTransport, tokens: &TokenStore) -> ApiClient {
        ApiClient::new(Arc::new(transport.clone()), tokens.clone(), BASE)
    }

    #[tokio::test]
    async fn test_attaches_bearer_when_present() {
        let transport = ScriptedTransport::new(|_| ok(json!([])));
        let tokens = TokenStore::in_memory();
        let api = client(&transport, &tokens);

        api.fetch_weight_logs(30).await.unwrap();
        tokens.set_token("jwt-abc").await.unwrap();
        api.fetch_weight_logs(30).await.unwrap();

        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].bearer, None);
        assert_eq!(requests[1].bearer.as_deref(), Some("jwt-abc"));
        assert_eq!(requests[1].url, "https://api.test/v1/weight-logs?limit=30");
        assert_eq!(requests[1].timeout, Duration::from_secs(REQUEST_TIMEOUT_SECS));
    }

    #[tokio::test]
    async fn test_401_clears_token() {
        let transport = ScriptedTransport::new(|_| status(401, json!({"message": "jwt expired"})));
        let tokens = TokenStore::in_memory();
        tokens.set_token("stale").await.unwrap();
        let api = client(&transport, &tokens);

        let err = api.fetch_profile().await.unwrap_err();
        assert_eq!(err.status(), Some(401));
        assert_eq!(tokens.get_token().await.unwrap(), None);

        let normalized = normalize(&err);
        assert_eq!(normalized.kind, ErrorKind::SessionExpired);
        assert_eq!(normalized.message, "jwt expired");

        // A second 401 with no token is still fine
        assert!(api.fetch_profile().await.is_err());
        assert_eq!(transport.requests().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_enforced_by_gateway() {
        let transport =
            ScriptedTransport::new(|_| ok(json!([]))).with_delay(Duration::from_secs(20));
        let tokens = TokenStore::in_memory();
        let api = client(&transport, &tokens);

        let err = api.fetch_weight_logs(10).await.unwrap_err();
        assert_eq!(err, TransportError::Timeout);
        assert_eq!(normalize(&err).title(), "Request Timeout");
    }

    #[tokio::test]
    async fn test_envelope_failure_is_an_error() {
        let transport = ScriptedTransport::new(|_| {
            Ok(HttpResponse {
                status: 200,
                body: r#"{"success": false, "message": "Duplicate entry"}"#.to_string(),
            })
        });
        let api = client(&transport, &TokenStore::in_memory());

        let err = api.fetch_adherence().await.unwrap_err();
        let normalized = normalize(&err);
        assert_eq!(normalized.title(), "Request Failed");
        assert_eq!(normalized.message, "Duplicate entry");
        assert!(!normalized.retryable);
    }

    #[tokio::test]
    async fn test_empty_body_for_unit_response() {
        let transport = ScriptedTransport::new(|_| {
            Ok(HttpResponse {
                status: 204,
                body: String::new(),
            })
        });
        let api = client(&transport, &TokenStore::in_memory());
        api.request_otp("+15550100").await.unwrap();
        assert_eq!(transport.requests()[0].bearer, None);
    }

    #[test]
    fn test_envelope_data_is_optional() {
        // Payload types need not implement Default
        #[derive(Debug, Deserialize, PartialEq)]
        struct Ticket {
            id: String,
        }

        let ticket: Ticket = ApiClient::unwrap_envelope(HttpResponse {
            status: 200,
            body: r#"{"success": true, "data": {"id": "t1"}}"#.to_string(),
        })
        .unwrap();
        assert_eq!(ticket, Ticket { id: "t1".into() });

        ApiClient::unwrap_envelope::<()>(HttpResponse {
            status: 200,
            body: r#"{"success": true}"#.to_string(),
        })
        .unwrap();
    }

    #[tokio::test]
    async fn test_verify_otp_persists_session() {
        let transport = ScriptedTransport::new(|_| {
            ok(json!({"token": "fresh", "client": {"id": "c1", "firstName": "Ana"}}))
        });
        let tokens = TokenStore::in_memory();
        let api = client(&transport, &tokens);

        let session = api.verify_otp("+15550100", "123456").await.unwrap();
        assert_eq!(session.client.id, "c1");
        assert_eq!(tokens.get_token().await.unwrap().as_deref(), Some("fresh"));
        assert_eq!(
            tokens.get_client_data().await.unwrap().and_then(|c| c.first_name),
            Some("Ana".to_string())
        );
    }

    #[tokio::test]
    async fn test_photo_flow_uses_presigned_url_without_bearer() {
        let transport = ScriptedTransport::new(|req| {
            if req.url.ends_with("/photo/upload-url") {
                ok(json!({"uploadUrl": "https://bucket.test/put/abc", "fileKey": "meals/abc.jpg"}))
            } else if req.url.starts_with("https://bucket.test") {
                Ok(HttpResponse { status: 200, body: String::new() })
            } else {
                ok(json!({
                    "id": "m1", "mealType": "lunch", "description": "Salad",
                    "logDate": "2024-01-01", "photoUrl": "https://cdn.test/meals/abc.jpg"
                }))
            }
        });
        let tokens = TokenStore::in_memory();
        tokens.set_token("jwt").await.unwrap();
        let api = client(&transport, &tokens);

        let meal = api
            .upload_meal_photo("m1", &PhotoAttachment::jpeg(vec![0xff, 0xd8]))
            .await
            .unwrap();
        assert!(meal.photo_url.is_some());

        let requests = transport.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[1].method, Method::PUT);
        assert_eq!(requests[1].bearer, None);
        assert_eq!(requests[1].timeout, Duration::from_secs(UPLOAD_TIMEOUT_SECS));
        assert_eq!(requests[2].json_body(), Some(&json!({"fileKey": "meals/abc.jpg"})));
    }

    #[tokio::test]
    async fn test_onboarding_validated_before_sending() {
        let transport = ScriptedTransport::new(|_| ok(Value::Null));
        let api = client(&transport, &TokenStore::in_memory());

        let bad = OnboardingStep::from_payload(
            3,
            json!({"targetWeightKg": 70.0}),
        )
        .map(|step| match step {
            OnboardingStep::Goals(mut g) => {
                g.target_weight_kg = 5.0;
                OnboardingStep::Goals(g)
            }
            other => other,
        })
        .unwrap();
        assert!(api.submit_onboarding_step(&bad).await.is_err());
        assert!(transport.requests().is_empty());

        let good = OnboardingStep::from_payload(3, json!({"targetWeightKg": 70.0})).unwrap();
        api.submit_onboarding_step(&good).await.unwrap();
        assert_eq!(transport.requests()[0].url, "https://api.test/v1/onboarding/steps/3");
    }
}
