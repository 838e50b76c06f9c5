//! Boundary to the component that talks to the Kubernetes API.
//!
//! The resolver never issues HTTP requests itself. It asks an [`EndpointClient`]
//! for raw byte streams and does all decoding on its own, so tests can drive it
//! with in-memory pipes.

use std::future::Future;
use std::pin::Pin;

use tokio::io::AsyncRead;

use crate::event::ResourceVersion;
use crate::target::Target;

/// Error type for client failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A response body being read from the API server.
pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

/// Opens connections to the `Endpoints` resource of a target.
///
/// Dropping a returned future or stream must abort the request and close the
/// connection; this is how watches are cancelled.
pub trait EndpointClient: Send + Sync + 'static {
    /// Opens a long-lived watch yielding JSON change events that happened after
    /// `since`.
    fn start_change_stream(
        &self,
        target: &Target,
        since: ResourceVersion,
    ) -> impl Future<Output = Result<ByteStream, BoxError>> + Send;

    /// Fetches the current `Endpoints` object as a single JSON document.
    ///
    /// A `version` of `0` asks for the most recent state.
    fn start_single_unary(
        &self,
        target: &Target,
        version: ResourceVersion,
    ) -> impl Future<Output = Result<ByteStream, BoxError>> + Send;
}
