use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::models::ClientProfile;
use crate::storage::{KeyValueStore, MemoryStore};

const TOKEN_KEY: &str = "auth_token";
const CLIENT_DATA_KEY: &str = "client_data";
const LAST_ACTIVITY_KEY: &str = "last_activity";

/// Session idle limit in days.
/// The backend keeps tokens valid for a month of inactivity.
const SESSION_IDLE_DAYS: i64 = 30;

/// Bearer credential plus session bookkeeping.
///
/// The token lives in a secure backend (keychain in production); the client
/// snapshot and last-activity marker live in the local backend.
/// Clone is cheap and every clone sees the same storage.
#[derive(Clone)]
pub struct TokenStore {
    secure: Arc<dyn KeyValueStore>,
    local: Arc<dyn KeyValueStore>,
    idle_limit: Duration,
}

impl TokenStore {
    pub fn new(secure: Arc<dyn KeyValueStore>, local: Arc<dyn KeyValueStore>) -> Self {
        Self {
            secure,
            local,
            idle_limit: Duration::days(SESSION_IDLE_DAYS),
        }
    }

    /// A store backed entirely by memory, nothing survives the process
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), Arc::new(MemoryStore::new()))
    }

    pub fn with_idle_limit(mut self, idle_limit: Duration) -> Self {
        self.idle_limit = idle_limit;
        self
    }

    pub async fn get_token(&self) -> Result<Option<String>> {
        let token = self
            .secure
            .get(TOKEN_KEY)
            .await
            .context("Failed to read auth token")?;
        Ok(token.filter(|t| !t.is_empty()))
    }

    pub async fn set_token(&self, token: &str) -> Result<()> {
        self.secure
            .set(TOKEN_KEY, token)
            .await
            .context("Failed to store auth token")?;
        self.record_activity().await
    }

    /// Clear the token. Clearing an absent token is a no-op.
    pub async fn remove_token(&self) -> Result<()> {
        self.secure
            .remove(TOKEN_KEY)
            .await
            .context("Failed to remove auth token")?;
        self.local
            .remove(LAST_ACTIVITY_KEY)
            .await
            .context("Failed to clear last activity")?;
        debug!("Auth token cleared");
        Ok(())
    }

    pub async fn record_activity(&self) -> Result<()> {
        self.record_activity_at(Utc::now()).await
    }

    pub async fn record_activity_at(&self, at: DateTime<Utc>) -> Result<()> {
        self.local
            .set(LAST_ACTIVITY_KEY, &at.to_rfc3339())
            .await
            .context("Failed to record last activity")
    }

    pub async fn last_activity(&self) -> Result<Option<DateTime<Utc>>> {
        let raw = self
            .local
            .get(LAST_ACTIVITY_KEY)
            .await
            .context("Failed to read last activity")?;
        Ok(raw.and_then(|s| match DateTime::parse_from_rfc3339(&s) {
            Ok(dt) => Some(dt.with_timezone(&Utc)),
            Err(e) => {
                warn!(value = %s, error = %e, "Unreadable last-activity marker");
                None
            }
        }))
    }

    /// Returns `true` if a token exists but the session went idle for too
    /// long; the token is cleared in that case.
    pub async fn check_session_expiry(&self) -> Result<bool> {
        self.check_session_expiry_at(Utc::now()).await
    }

    pub async fn check_session_expiry_at(&self, now: DateTime<Utc>) -> Result<bool> {
        if self.get_token().await?.is_none() {
            return Ok(false);
        }
        let expired = match self.last_activity().await? {
            Some(last) => now - last > self.idle_limit,
            None => true,
        };
        if expired {
            info!("Session idle limit exceeded, clearing token");
            self.remove_token().await?;
        }
        Ok(expired)
    }

    pub async fn get_client_data(&self) -> Result<Option<ClientProfile>> {
        let raw = self
            .local
            .get(CLIENT_DATA_KEY)
            .await
            .context("Failed to read client data")?;
        match raw {
            Some(json) => {
                let profile = serde_json::from_str(&json).context("Failed to parse client data")?;
                Ok(Some(profile))
            }
            None => Ok(None),
        }
    }

    pub async fn set_client_data(&self, profile: &ClientProfile) -> Result<()> {
        let json = serde_json::to_string(profile)?;
        self.local
            .set(CLIENT_DATA_KEY, &json)
            .await
            .context("Failed to store client data")
    }

    pub async fn clear_client_data(&self) -> Result<()> {
        self.local
            .remove(CLIENT_DATA_KEY)
            .await
            .context("Failed to clear client data")
    }
}
