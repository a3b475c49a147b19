//! HTTP client for the remote authority.

use std::future::Future;

use reqwest::{Client, Response};
use tally_engine::{FieldSnapshot, ReconcileRequest, ReconcileResponse};

use super::RemoteAuthority;
use crate::error::TransportError;

/// Talks to `POST {base}/settings/reconcile` and `GET {base}/settings/snapshot`.
#[derive(Debug, Clone)]
pub struct HttpAuthority {
    client: Client,
    base_url: String,
}

impl HttpAuthority {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    /// Use a preconfigured client (proxies, TLS, default headers).
    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn check_status(response: Response) -> Result<Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(TransportError::Status(status.as_u16()))
    }
}

impl RemoteAuthority for HttpAuthority {
    fn reconcile(
        &self,
        request: ReconcileRequest,
    ) -> impl Future<Output = Result<ReconcileResponse, TransportError>> + Send {
        let call = self
            .client
            .post(self.url("/settings/reconcile"))
            .json(&request)
            .send();

        async move {
            let response = check_status(call.await?)?;
            // The body is decoded in full before anything is applied
            Ok(response.json::<ReconcileResponse>().await?)
        }
    }

    fn snapshot(&self) -> impl Future<Output = Result<FieldSnapshot, TransportError>> + Send {
        let call = self.client.get(self.url("/settings/snapshot")).send();

        async move {
            let response = check_status(call.await?)?;
            Ok(response.json::<FieldSnapshot>().await?)
        }
    }
}
