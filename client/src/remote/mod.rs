//! The remote authority contract.

mod http;

pub use http::HttpAuthority;

use std::future::Future;

use tally_engine::{FieldSnapshot, ReconcileRequest, ReconcileResponse};

use crate::error::TransportError;

/// The server-side source of truth for the settings document.
///
/// Implementations do not retry or time out; the sync runtime bounds every
/// exchange and handles failures itself.
pub trait RemoteAuthority: Send + Sync + 'static {
    /// Submit pending changes.
    fn reconcile(
        &self,
        request: ReconcileRequest,
    ) -> impl Future<Output = Result<ReconcileResponse, TransportError>> + Send;

    /// Fetch the authority's full stamped document.
    fn snapshot(&self) -> impl Future<Output = Result<FieldSnapshot, TransportError>> + Send;
}
