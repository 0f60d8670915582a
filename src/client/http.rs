//! Paced HTTP client shared by all sources.
//!
//! Epistemic foundation:
//! - K_i: Every request goes through the pacer (fixed interval + 429 backoff)
//! - K_i: The cookie store carries server-side session context between calls
//! - B_i: Server will respond within timeout (might fail)
//! - B_i: Response will be valid JSON (might fail)
//! - I^B: Retries are decided by callers from the error's `ErrorKind`

use super::Pacer;
use crate::models::{AcquireError, HttpConfig};
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// HTTP client with pacing, timeouts and a session cookie jar.
pub struct HttpClient {
    client: reqwest::Client,
    timeout: Duration,
    pacer: Arc<Pacer>,
}

impl HttpClient {
    /// Create a client from the `[http]` config section.
    pub fn new(config: &HttpConfig) -> Result<Self, AcquireError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_static("de-DE,de;q=0.9,en;q=0.8"),
        );

        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .cookie_store(true)
            .build()
            .map_err(AcquireError::Network)?;

        Ok(Self {
            client,
            timeout: config.timeout(),
            pacer: Arc::new(Pacer::new(config.request_interval())),
        })
    }

    pub fn pacer(&self) -> &Arc<Pacer> {
        &self.pacer
    }

    /// GET `url` and decode the JSON body.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T, AcquireError> {
        let response = self.send(self.client.get(url).query(query), url).await?;
        decode(response, url).await
    }

    /// POST a JSON body to `url` and return the (successful) status.
    pub async fn post_json<B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<StatusCode, AcquireError> {
        let response = self.send(self.client.post(url).json(body), url).await?;
        Ok(response.status())
    }

    /// Pace, send, and turn error statuses into classified errors.
    async fn send(&self, request: RequestBuilder, url: &str) -> Result<Response, AcquireError> {
        let host = host_of(url);
        self.pacer.wait_turn(&host).await;

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                AcquireError::Timeout(self.timeout)
            } else {
                AcquireError::Network(e)
            }
        })?;

        let status = response.status();
        self.pacer.record_response(&host, status.as_u16());
        debug!(url, status = status.as_u16(), "HTTP response");

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AcquireError::RateLimited {
                retry_after_secs: retry_after(response.headers()).unwrap_or(1.0),
            });
        }
        if !status.is_success() {
            return Err(AcquireError::Http {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        Ok(response)
    }
}

async fn decode<T: DeserializeOwned>(response: Response, url: &str) -> Result<T, AcquireError> {
    let body = response.bytes().await.map_err(AcquireError::Network)?;
    serde_json::from_slice(&body).map_err(|e| AcquireError::Parse(format!("{url}: {e}")))
}

fn retry_after(headers: &HeaderMap) -> Option<f64> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
}

/// Host part of `url`, used as the pacing key.
pub fn host_of(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_of() {
        assert_eq!(
            host_of("https://www.rewe.de/api/wksmarketsearch?searchTerm=Berlin"),
            "www.rewe.de"
        );
        assert_eq!(host_of("not a url"), "");
    }

    #[test]
    fn test_retry_after_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);
        headers.insert(reqwest::header::RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(retry_after(&headers), Some(7.0));
    }

    #[test]
    fn test_client_builds_from_config() {
        let config = HttpConfig::default();
        let client = HttpClient::new(&config).unwrap();
        assert_eq!(client.pacer().interval(), config.request_interval());
    }
}
