//! Query/mutation cache.
//!
//! Server data is cached per `QueryKey` and served stale-while-revalidate:
//! subscribers always see the last known data, even offline, while a
//! background refetch runs. Mutations run through per-key ordering lanes,
//! pause while offline, merge their result into cached lists on success and
//! then invalidate the queries they affect.

pub mod key;
pub mod merge;
pub mod mutation;
pub mod query;
pub mod retry;

pub use key::QueryKey;
pub use merge::{merge_into_list, MergeOutcome};
pub use mutation::Mutation;
pub use query::{QueryClient, QueryObserver, QueryOptions, QuerySnapshot, QueryStatus};
pub use retry::RetryPolicy;
