//! Device reachability signal.
//!
//! `ConnectivityMonitor` holds the live `ConnectivityState`. Only the platform
//! signal (`report`) writes it; the cache scheduler reads and subscribes.
//! There is no internal debouncing.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::api::NormalizedError;
use crate::cancel::CancelToken;

/// How long a single reachability probe may take before counting as offline
const PROBE_TIMEOUT_SECS: u64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityState {
    pub is_connected: bool,
}

/// Process-wide online/offline signal.
/// Clone is cheap; all clones observe the same state.
#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<ConnectivityState>>,
}

impl ConnectivityMonitor {
    pub fn new(initially_connected: bool) -> Self {
        let (tx, _rx) = watch::channel(ConnectivityState {
            is_connected: initially_connected,
        });
        Self { tx: Arc::new(tx) }
    }

    pub fn state(&self) -> ConnectivityState {
        *self.tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected
    }

    /// Feed a platform reachability reading. Repeated readings are ignored.
    pub fn report(&self, connected: bool) {
        let changed = self.tx.send_if_modified(|state| {
            if state.is_connected == connected {
                false
            } else {
                state.is_connected = connected;
                true
            }
        });
        if changed {
            if connected {
                info!("Connectivity restored");
            } else {
                info!("Connectivity lost");
            }
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.tx.subscribe()
    }

    /// Wait until the device is online, or fail if cancelled first
    pub async fn wait_online(&self, cancel: &CancelToken) -> Result<(), NormalizedError> {
        let mut rx = self.subscribe();
        if rx.borrow().is_connected {
            return Ok(());
        }
        debug!("Offline, waiting for connectivity");
        tokio::select! {
            // The sender lives as long as `self`, so an error cannot happen here
            _ = rx.wait_for(|state| state.is_connected) => Ok(()),
            _ = cancel.cancelled() => Err(NormalizedError::cancelled()),
        }
    }

    /// Poll TCP reachability of `target` (`host:port`) and report it.
    ///
    /// Stands in for the platform reachability subscription on hosts that
    /// have none. Runs for the process lifetime.
    pub fn spawn_probe(&self, target: String, interval: Duration) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                monitor.report(probe_once(&target).await);
            }
        })
    }
}

/// One TCP reachability check against `target` (`host:port`)
pub async fn probe_once(target: &str) -> bool {
    let reachable = matches!(
        tokio::time::timeout(
            Duration::from_secs(PROBE_TIMEOUT_SECS),
            TcpStream::connect(target),
        )
        .await,
        Ok(Ok(_))
    );
    debug!(target, reachable, "Reachability probe");
    reachable
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Derive a `host:port` probe target from an http(s) base URL
pub fn probe_target(base_url: &str) -> Option<String> {
    let (scheme, rest) = base_url.split_once("://")?;
    let default_port = match scheme {
        "https" => 443,
        "http" => 80,
        _ => return None,
    };
    let authority = rest.split(['/', '?', '#']).next()?;
    let authority = authority.rsplit('@').next()?;
    if authority.is_empty() {
        return None;
    }
    let has_port = authority
        .rsplit_once(':')
        .map(|(_, port)| !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(false);
    if has_port && !authority.ends_with(']') {
        Some(authority.to_string())
    } else {
        Some(format!("{}:{}", authority, default_port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_transitions() {
        let monitor = ConnectivityMonitor::new(true);
        let mut rx = monitor.subscribe();
        assert!(monitor.is_connected());

        monitor.report(true);
        assert!(!rx.has_changed().unwrap());

        monitor.report(false);
        assert!(rx.has_changed().unwrap());
        assert!(!rx.borrow_and_update().is_connected);
        assert!(!monitor.is_connected());
    }

    #[tokio::test]
    async fn test_wait_online_resumes_on_reconnect() {
        let monitor = ConnectivityMonitor::new(false);
        let waiter = monitor.clone();
        let handle = tokio::spawn(async move { waiter.wait_online(&CancelToken::new()).await });

        tokio::task::yield_now().await;
        assert!(!handle.is_finished());

        monitor.report(true);
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_wait_online_cancelled() {
        let monitor = ConnectivityMonitor::new(false);
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = monitor.wait_online(&cancel).await.unwrap_err();
        assert_eq!(err.title(), "Request Cancelled");
    }

    #[tokio::test]
    async fn test_probe_once_reaches_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap().to_string();
        assert!(probe_once(&target).await);
    }

    #[test]
    fn test_probe_target() {
        assert_eq!(probe_target("https://api.example.com/v1").as_deref(), Some("api.example.com:443"));
        assert_eq!(probe_target("http://localhost:3000/api/v1").as_deref(), Some("localhost:3000"));
        assert_eq!(probe_target("http://10.0.2.2").as_deref(), Some("10.0.2.2:80"));
        assert_eq!(probe_target("ftp://host"), None);
        assert_eq!(probe_target("not a url"), None);
    }
}
