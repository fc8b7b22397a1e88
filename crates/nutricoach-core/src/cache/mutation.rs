//! Mutation side of the cache: ordered, connectivity-aware command execution
//! with an optimistic merge and effect invalidation on success.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use tracing::{debug, info, warn};

use crate::api::NormalizedError;
use crate::cancel::CancelToken;

use super::key::QueryKey;
use super::query::QueryClient;
use super::retry::RetryPolicy;

type RunFn<I, O> = Arc<dyn Fn(I) -> BoxFuture<'static, Result<O, NormalizedError>> + Send + Sync>;
type KeyFn<I> = Arc<dyn Fn(&I) -> String + Send + Sync>;
type SuccessFn<I, O> = Arc<dyn Fn(&QueryClient, &I, &O) + Send + Sync>;

/// A server-side command bound to a `QueryClient`.
///
/// Calls sharing a logical key run one at a time in the order they were
/// issued. While offline, calls are held rather than dropped.
pub struct Mutation<I, O> {
    client: QueryClient,
    name: Arc<str>,
    run: RunFn<I, O>,
    key_fn: KeyFn<I>,
    retry: RetryPolicy,
    effects: Vec<QueryKey>,
    on_success: Option<SuccessFn<I, O>>,
    pending: Arc<AtomicUsize>,
}

impl<I, O> Clone for Mutation<I, O> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            name: self.name.clone(),
            run: self.run.clone(),
            key_fn: self.key_fn.clone(),
            retry: self.retry.clone(),
            effects: self.effects.clone(),
            on_success: self.on_success.clone(),
            pending: self.pending.clone(),
        }
    }
}

impl QueryClient {
    /// Define a mutation named `name` that runs `f`.
    ///
    /// Defaults: a single attempt, every call shares one ordering lane, no
    /// effects, no cache merge.
    pub fn mutation<I, O, F, Fut>(&self, name: &str, f: F) -> Mutation<I, O>
    where
        I: Send + 'static,
        O: Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, NormalizedError>> + Send + 'static,
    {
        let lane: String = name.to_string();
        Mutation {
            client: self.clone(),
            name: Arc::from(name),
            run: Arc::new(move |input| f(input).boxed()),
            key_fn: Arc::new(move |_| lane.clone()),
            retry: RetryPolicy::mutation_default(),
            effects: Vec::new(),
            on_success: None,
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl<I, O> Mutation<I, O>
where
    I: Clone + Send + 'static,
    O: Send + 'static,
{
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Ordering key for a call. Calls with different keys may interleave.
    pub fn key<K>(mut self, key_fn: K) -> Self
    where
        K: Fn(&I) -> String + Send + Sync + 'static,
    {
        self.key_fn = Arc::new(key_fn);
        self
    }

    /// Queries to mark stale (by prefix) after a successful call
    pub fn invalidates(mut self, prefix: QueryKey) -> Self {
        self.effects.push(prefix);
        self
    }

    /// Cache writer run on success, before the effects are invalidated
    pub fn on_success<S>(mut self, on_success: S) -> Self
    where
        S: Fn(&QueryClient, &I, &O) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(on_success));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client(&self) -> &QueryClient {
        &self.client
    }

    /// True while any call of this mutation is queued or running
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst) > 0
    }

    pub async fn mutate(&self, input: I) -> Result<O, NormalizedError> {
        self.mutate_with(input, &CancelToken::new()).await
    }

    /// Run the mutation, giving up early if `cancel` fires while the call is
    /// waiting for its turn, for connectivity or for a backoff delay.
    pub async fn mutate_with(&self, input: I, cancel: &CancelToken) -> Result<O, NormalizedError> {
        let _pending = PendingGuard::enter(&self.pending);
        let lane_key = (self.key_fn)(&input);
        let result = self.execute(&lane_key, input, cancel).await;
        self.client.prune_lanes();
        result
    }

    async fn execute(
        &self,
        lane_key: &str,
        input: I,
        cancel: &CancelToken,
    ) -> Result<O, NormalizedError> {
        let lane = self.client.mutation_lane(lane_key);
        let _turn = tokio::select! {
            guard = lane.lock() => guard,
            _ = cancel.cancelled() => return Err(NormalizedError::cancelled()),
        };

        let connectivity = self.client.connectivity();
        if !connectivity.is_connected() {
            info!(mutation = %self.name, key = lane_key, "Offline, mutation paused until reconnect");
            connectivity.wait_online(cancel).await?;
            debug!(mutation = %self.name, key = lane_key, "Connectivity restored, resuming mutation");
        }

        let run = self.run.clone();
        let attempt_input = input.clone();
        let result = self
            .retry
            .run(&self.name, cancel, || run(attempt_input.clone()))
            .await;

        match result {
            Ok(output) => {
                if let Some(on_success) = &self.on_success {
                    on_success(&self.client, &input, &output);
                }
                for prefix in &self.effects {
                    self.client.invalidate(prefix);
                }
                debug!(mutation = %self.name, key = lane_key, "Mutation succeeded");
                Ok(output)
            }
            Err(error) => {
                warn!(mutation = %self.name, key = lane_key, error = %error, "Mutation failed");
                Err(error)
            }
        }
    }
}

struct PendingGuard(Arc<AtomicUsize>);

impl PendingGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
