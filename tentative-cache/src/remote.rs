//! Contract of the remote procedure transport.
//!
//! The engine only needs a call that returns or fails, and a way to read the
//! authoritative value behind a cache key. Transport, authentication and
//! input validation live behind this trait.

use async_trait::async_trait;
use serde_json::Value;
use tentative_core::{CacheKey, RemoteFailure};

#[async_trait]
pub trait RemoteProcedureClient<V>: Send + Sync {
    /// Execute a mutation procedure.
    async fn invoke(&self, procedure: &str, args: &Value) -> Result<Value, RemoteFailure>;

    /// Read the server's current value for a cached query.
    async fn fetch(&self, key: &CacheKey) -> Result<V, RemoteFailure>;
}
