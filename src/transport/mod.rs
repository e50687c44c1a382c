//! Retrying HTTP execution.
//!
//! Every network call in the crate goes through [`HttpTransport::execute`]
//! with an explicit [`RetryPolicy`]. The policy's classifier maps each status
//! to a [`Disposition`]; transient failures are retried with exponential
//! backoff and jitter, fail-fast statuses are returned with the platform's
//! payload attached, and 401 is returned as
//! [`TransportError::Reauthenticate`] so the caller decides how to refresh
//! its credential.

mod error;
mod executor;
mod http;
mod policy;

pub use error::TransportError;
pub use executor::{Exchange, HttpTransport};
pub use http::{
    HttpClient, HttpClientError, HttpRequest, HttpResponse, Method, ReqwestHttpClient,
    ResponseFuture,
};
pub use policy::{classify_status, Disposition, RetryPolicy, StatusClassifier};
