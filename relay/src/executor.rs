use mtls_relay_common::{IdentityContext, RequestOutcome};
use reqwest::{header::CONTENT_TYPE, Method, StatusCode, Url};

use crate::error::RelayError;

const JSON_CONTENT_TYPE: &str = "application/json";

/// Performs one-shot HTTP(S) calls under a per-request identity.
///
/// A new HTTP client is built for every call from the identity's TLS
/// configuration, so no connection or session state outlives the request.
/// There are no retries and no timeout beyond the transport defaults.
#[derive(Debug, Clone, Default)]
pub struct RequestExecutor;

impl RequestExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Send one request and classify the response.
    ///
    /// Only `200` counts as success. A `200` whose content type mentions
    /// `application/json` is decoded; any other `200` body is returned as
    /// text. Every other status fails with the status code and body text.
    pub async fn execute(
        &self,
        url: &str,
        method: &str,
        body: Option<String>,
        identity: &IdentityContext,
    ) -> Result<RequestOutcome, RelayError> {
        let url = Url::parse(url).map_err(|e| RelayError::MalformedMessage(format!("Invalid URL {url:?}: {e}")))?;
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|_| RelayError::MalformedMessage(format!("Invalid HTTP method: {method}")))?;

        let client = reqwest::Client::builder()
            .use_preconfigured_tls((*identity.tls_config()).clone())
            .no_proxy()
            .build()?;

        tracing::debug!(
            "{} {} (client certificate: {})",
            method,
            url,
            identity.fingerprint().unwrap_or("none")
        );

        let mut request = client.request(method, url).header(CONTENT_TYPE, JSON_CONTENT_TYPE);
        if let Some(body) = body {
            request = request.body(body);
        }

        let response = request.send().await?;
        let status = response.status();

        if status != StatusCode::OK {
            let body = response.text().await?;
            return Err(RelayError::ProtocolStatus {
                status: status.as_u16(),
                body,
            });
        }

        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|content_type| content_type.contains(JSON_CONTENT_TYPE));

        let text = response.text().await?;
        if is_json {
            serde_json::from_str(&text)
                .map(RequestOutcome::Json)
                .map_err(RelayError::InvalidBody)
        } else {
            Ok(RequestOutcome::Text(text))
        }
    }
}
