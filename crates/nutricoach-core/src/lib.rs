//! Nutricoach core library.
//!
//! The synchronization layer of the diet-coaching client: it keeps local
//! caches of server data fresh, runs user actions against the backend with
//! retries and offline pausing, and turns every failure into one
//! user-presentable error shape.
//!
//! Front ends construct one [`Coach`] at startup and use it for everything.

pub mod api;
pub mod auth;
pub mod cache;
pub mod cancel;
pub mod coach;
pub mod config;
pub mod connectivity;
pub mod models;
pub mod storage;
pub mod upload;

pub use api::{normalize, ApiClient, ErrorKind, NormalizedError, TransportError};
pub use auth::TokenStore;
pub use cache::{Mutation, QueryClient, QueryKey, QueryObserver, QueryOptions, QueryStatus, RetryPolicy};
pub use cancel::CancelToken;
pub use coach::Coach;
pub use config::{Config, ConfigError, ConfigFile};
pub use connectivity::{ConnectivityMonitor, ConnectivityState};
pub use upload::{Decoupled, SecondaryUpload, UploadDiagnostics, UploadHandle, WithAttachment};
