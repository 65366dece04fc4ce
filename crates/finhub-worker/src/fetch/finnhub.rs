//! Finnhub REST client
//!
//! Authenticates with the `X-Finnhub-Token` header and maps transport and
//! status failures onto [`FetchError`] so the worker can tell a rate limit or
//! outage (retry later) from a bad request (drop).

use super::Fetcher;
use crate::error::FetchError;
use crate::model::RawResponse;
use async_trait::async_trait;
use finhub_common::types::Params;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Header carrying the API key (`X-Finnhub-Token`).
pub const TOKEN_HEADER: &str = "x-finnhub-token";

const USER_AGENT: &str = "finhub-worker/0.1";

/// Longest error body excerpt kept in a [`FetchError::Status`].
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Clone)]
pub struct FinnhubClient {
    client: Client,
    base_url: String,
}

impl FinnhubClient {
    pub fn new(
        api_key: &str,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, FetchError> {
        let mut token = HeaderValue::from_str(api_key)
            .map_err(|e| FetchError::Request(format!("API key is not a valid header value: {e}")))?;
        token.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(TOKEN_HEADER, token);

        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .build()
            .map_err(|e| FetchError::Request(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// GET `endpoint` with `params` as the query string.
    ///
    /// Null parameters are omitted. An empty body decodes to `null`.
    pub async fn get(&self, endpoint: &str, params: &Params) -> Result<Value, FetchError> {
        let url = format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'));
        let query = query_pairs(params);

        debug!(url = %url, params = ?query, "Fetching from Finnhub");

        let response = self.client.get(&url).query(&query).send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message: String = body.chars().take(MAX_ERROR_BODY).collect();
            warn!(url = %url, status = status.as_u16(), "Finnhub request failed");
            return Err(FetchError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let bytes = response.bytes().await?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }

        serde_json::from_slice(&bytes).map_err(|e| FetchError::Decode(e.to_string()))
    }
}

fn query_pairs(params: &Params) -> Vec<(String, String)> {
    params
        .iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (key.clone(), value)
        })
        .collect()
}

/// One Finnhub endpoint exposed as a [`Fetcher`].
#[derive(Debug, Clone)]
pub struct EndpointFetcher {
    client: Arc<FinnhubClient>,
    endpoint: String,
}

impl EndpointFetcher {
    pub fn new(client: Arc<FinnhubClient>, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl Fetcher for EndpointFetcher {
    async fn fetch(&self, params: &Params) -> Result<RawResponse, FetchError> {
        self.client.get(&self.endpoint, params).await
    }

    fn describe(&self) -> String {
        self.endpoint.clone()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_pairs_skip_nulls_and_stringify() {
        let params: Params = json!({"symbol": "AAPL", "limit": 10, "isin": null, "adjusted": true})
            .as_object()
            .cloned()
            .unwrap();

        let mut pairs = query_pairs(&params);
        pairs.sort();
        assert_eq!(
            pairs,
            vec![
                ("adjusted".to_string(), "true".to_string()),
                ("limit".to_string(), "10".to_string()),
                ("symbol".to_string(), "AAPL".to_string()),
            ]
        );
    }

    #[test]
    fn test_endpoint_describes_itself() {
        let client = Arc::new(FinnhubClient::new("k", "http://localhost", Duration::from_secs(1)).unwrap());
        let fetcher = EndpointFetcher::new(client, "/company-news");

        assert_eq!(fetcher.describe(), "/company-news");
    }

    #[test]
    fn test_invalid_api_key_rejected() {
        let err = FinnhubClient::new("bad\nkey", "http://localhost", Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, FetchError::Request(_)));
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = FinnhubClient::new("k", "https://finnhub.io/api/v1/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.base_url(), "https://finnhub.io/api/v1");
    }
}
