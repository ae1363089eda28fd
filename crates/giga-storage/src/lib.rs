//! Persistence for the sync pipeline plus the HTTP client used to reach the change feed.

mod http;
mod memory;
mod postgres;
mod store;

pub use http::{
    FetchError, FetchRequest, FetchedResponse, HttpClientConfig, HttpFetcher, RetryPolicy,
};
pub use memory::MemoryStore;
pub use postgres::{PgStore, PoolConfig};
pub use store::{
    CountryStore, DeletedChange, DeletedOutcome, PublishedChange, PublishedOutcome, SchoolStore,
    StagingStore, Store, StoreError, StoreResult, TaskRunStore,
};

