#[doc(hidden)]
pub mod scripted;
pub mod v2c;

use std::future::Future;

use thiserror::Error;

/// A single failed query. Never fatal to the caller's loop.
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("invalid object identifier `{0}`")]
    InvalidOid(String),
    #[error("opening session to {address}: {source}")]
    Session {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("request to {address} failed: {reason}")]
    Request { address: String, reason: String },
    #[error("agent {address} returned error status {status}")]
    ErrorStatus { address: String, status: u32 },
    #[error("response carried no value")]
    NoValue,
    #[error("unsupported value type: {0}")]
    UnsupportedValue(String),
    #[error("query task failed: {0}")]
    Task(String),
}

/// Issues one read of one value at one address.
pub trait QueryClient: Send + Sync + 'static {
    /// Fetch the integer value of `oid` from the agent at `address`.
    ///
    /// Wide enough for both signed integers and the full Counter64 range.
    fn get(
        &self,
        address: &str,
        community: &str,
        oid: &str,
    ) -> impl Future<Output = Result<i128, QueryError>> + Send;
}
