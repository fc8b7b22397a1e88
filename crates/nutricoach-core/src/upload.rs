//! Secondary uploads decoupled from the primary action they belong to.
//!
//! A secondary upload (a meal photo, for instance) starts only after the
//! primary mutation has succeeded, addressed by the id the server returned.
//! It gets a single attempt. Its outcome never changes the primary result;
//! failures are logged and kept in `UploadDiagnostics`.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::api::{normalize, NormalizedError, TransportError};
use crate::cache::Mutation;
use crate::cancel::CancelToken;
use crate::models::ServerIdentified;

/// Number of settled uploads kept for diagnostics
const DIAGNOSTICS_CAPACITY: usize = 50;

type UploadFn<P> =
    Arc<dyn Fn(String, P) -> BoxFuture<'static, Result<(), NormalizedError>> + Send + Sync>;

/// Input of a decoupled mutation: the primary input plus an optional payload
/// for the secondary upload.
#[derive(Debug, Clone)]
pub struct WithAttachment<I, P> {
    pub primary: I,
    pub attachment: Option<P>,
}

impl<I, P> WithAttachment<I, P> {
    pub fn new(primary: I, attachment: Option<P>) -> Self {
        Self { primary, attachment }
    }
}

/// Record of one settled secondary upload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecondaryUpload {
    /// Server id of the entity the upload belongs to
    pub owner_id: String,
    pub mutation: String,
    /// Short description of the payload, never the payload itself
    pub payload: String,
    pub attempted_at: DateTime<Utc>,
    pub settled_at: DateTime<Utc>,
    pub error: Option<NormalizedError>,
}

impl SecondaryUpload {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Bounded history of settled secondary uploads. Clones share the history.
#[derive(Debug, Clone, Default)]
pub struct UploadDiagnostics {
    entries: Arc<Mutex<VecDeque<SecondaryUpload>>>,
}

impl UploadDiagnostics {
    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<SecondaryUpload>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record(&self, upload: SecondaryUpload) {
        let mut entries = self.lock();
        if entries.len() == DIAGNOSTICS_CAPACITY {
            entries.pop_front();
        }
        entries.push_back(upload);
    }

    /// All recorded uploads, oldest first
    pub fn entries(&self) -> Vec<SecondaryUpload> {
        self.lock().iter().cloned().collect()
    }

    pub fn failures(&self) -> Vec<SecondaryUpload> {
        self.lock().iter().filter(|u| !u.succeeded()).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle to a secondary upload running in the background.
///
/// Dropping it does not cancel the upload.
pub struct UploadHandle {
    owner_id: String,
    task: JoinHandle<SecondaryUpload>,
}

impl UploadHandle {
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Wait for the upload to settle. `None` only if the task was torn down
    /// with the runtime before finishing.
    pub async fn settled(self) -> Option<SecondaryUpload> {
        self.task.await.ok()
    }
}

impl fmt::Debug for UploadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadHandle")
            .field("owner_id", &self.owner_id)
            .field("finished", &self.task.is_finished())
            .finish()
    }
}

/// Result of a decoupled mutation: the primary output plus the secondary
/// upload, if one was started.
#[derive(Debug)]
pub struct Decoupled<O> {
    pub output: O,
    pub upload: Option<UploadHandle>,
}

/// A mutation with a fire-and-forget secondary upload attached.
pub struct DecoupledMutation<I, O, P> {
    primary: Mutation<I, O>,
    build_upload: UploadFn<P>,
}

impl<I, O, P> Clone for DecoupledMutation<I, O, P> {
    fn clone(&self) -> Self {
        Self {
            primary: self.primary.clone(),
            build_upload: self.build_upload.clone(),
        }
    }
}

/// Attach a secondary upload to `primary`.
///
/// `build_upload` receives the server id from the primary output and the
/// attachment payload.
pub fn with_secondary_upload<I, O, P, F, Fut>(
    primary: Mutation<I, O>,
    build_upload: F,
) -> DecoupledMutation<I, O, P>
where
    F: Fn(String, P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), NormalizedError>> + Send + 'static,
{
    DecoupledMutation {
        primary,
        build_upload: Arc::new(move |owner_id, payload| build_upload(owner_id, payload).boxed()),
    }
}

impl<I, O, P> DecoupledMutation<I, O, P>
where
    I: Clone + Send + 'static,
    O: ServerIdentified + Send + 'static,
    P: fmt::Debug + Send + 'static,
{
    pub fn primary(&self) -> &Mutation<I, O> {
        &self.primary
    }

    pub fn is_pending(&self) -> bool {
        self.primary.is_pending()
    }

    pub async fn mutate(&self, input: WithAttachment<I, P>) -> Result<Decoupled<O>, NormalizedError> {
        self.mutate_with(input, &CancelToken::new()).await
    }

    /// Run the primary mutation; on success start the secondary upload.
    ///
    /// `cancel` applies to the primary mutation only.
    pub async fn mutate_with(
        &self,
        input: WithAttachment<I, P>,
        cancel: &CancelToken,
    ) -> Result<Decoupled<O>, NormalizedError> {
        let WithAttachment { primary, attachment } = input;
        let output = self.primary.mutate_with(primary, cancel).await?;
        let upload = attachment.map(|payload| self.spawn_upload(output.server_id().to_string(), payload));
        Ok(Decoupled { output, upload })
    }

    fn spawn_upload(&self, owner_id: String, payload: P) -> UploadHandle {
        let summary = format!("{:?}", payload);
        let build_upload = self.build_upload.clone();
        let diagnostics = self.primary.client().upload_diagnostics().clone();
        let mutation = self.primary.name().to_string();
        let owner = owner_id.clone();

        let task = tokio::spawn(async move {
            let attempted_at = Utc::now();
            let upload = AssertUnwindSafe(async { build_upload(owner.clone(), payload).await });
            let error = match upload.catch_unwind().await {
                Ok(Ok(())) => None,
                Ok(Err(error)) => Some(error),
                Err(_) => Some(normalize(&TransportError::Unknown)),
            };

            match &error {
                None => info!(mutation = %mutation, owner_id = %owner, "Secondary upload completed"),
                Some(error) => warn!(
                    mutation = %mutation,
                    owner_id = %owner,
                    payload = %summary,
                    error = %error,
                    "Secondary upload failed"
                ),
            }

            let record = SecondaryUpload {
                owner_id: owner,
                mutation,
                payload: summary,
                attempted_at,
                settled_at: Utc::now(),
                error,
            };
            diagnostics.record(record.clone());
            record
        });

        UploadHandle { owner_id, task }
    }
}
