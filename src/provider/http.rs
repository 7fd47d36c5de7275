//! Shared HTTP plumbing for the REST providers.

use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, CONTENT_TYPE, RETRY_AFTER};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use url::Url;

use super::error::ProviderError;

/// Wait applied when a 429 carries no usable Retry-After header.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(30);

/// Connection settings for one REST provider.
#[derive(Debug, Clone)]
pub struct HttpSettings {
  pub base_url: String,
  pub token: String,
  pub timeout: Duration,
}

/// Bearer-authenticated JSON client rooted at a base URL.
#[derive(Clone)]
pub(crate) struct HttpProvider {
  client: reqwest::Client,
  base_url: Url,
  token: String,
  timeout: Duration,
}

impl HttpProvider {
  pub fn new(settings: &HttpSettings) -> Result<Self> {
    let base_url = Url::parse(&settings.base_url)
      .map_err(|e| eyre!("Invalid provider URL {}: {}", settings.base_url, e))?;
    if base_url.cannot_be_a_base() {
      return Err(eyre!("Provider URL {} cannot be a base", settings.base_url));
    }

    let client = reqwest::Client::builder()
      .timeout(settings.timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url,
      token: settings.token.clone(),
      timeout: settings.timeout,
    })
  }

  /// Append path segments (percent-encoded) to the base URL.
  pub fn endpoint(&self, segments: &[&str]) -> Url {
    let mut url = self.base_url.clone();
    if let Ok(mut path) = url.path_segments_mut() {
      path.pop_if_empty().extend(segments);
    }
    url
  }

  pub async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, ProviderError> {
    let response = self
      .client
      .get(url)
      .bearer_auth(&self.token)
      .send()
      .await
      .map_err(|e| self.transport_error(e))?;

    let body = self.check(response).await?;
    serde_json::from_slice(&body).map_err(|e| ProviderError::Malformed(e.to_string()))
  }

  pub async fn post_json<B: Serialize>(&self, url: Url, body: &B) -> Result<(), ProviderError> {
    let payload = serde_json::to_vec(body).map_err(|e| ProviderError::Malformed(e.to_string()))?;

    let response = self
      .client
      .post(url)
      .bearer_auth(&self.token)
      .header(CONTENT_TYPE, "application/json")
      .body(payload)
      .send()
      .await
      .map_err(|e| self.transport_error(e))?;

    self.check(response).await.map(|_| ())
  }

  async fn check(&self, response: reqwest::Response) -> Result<Vec<u8>, ProviderError> {
    if let Some(err) = classify_status(response.status(), response.headers()) {
      return Err(err);
    }
    response
      .bytes()
      .await
      .map(|body| body.to_vec())
      .map_err(|e| self.transport_error(e))
  }

  fn transport_error(&self, err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
      ProviderError::Timeout(self.timeout)
    } else if err.is_decode() {
      ProviderError::Malformed(err.to_string())
    } else {
      ProviderError::NetworkUnavailable(err.to_string())
    }
  }
}

/// Map a non-success status to a provider error. Success maps to `None`.
pub(crate) fn classify_status(status: StatusCode, headers: &HeaderMap) -> Option<ProviderError> {
  if status.is_success() {
    return None;
  }

  let err = match status {
    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Unauthorized,
    StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited {
      retry_after: headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_RETRY_AFTER),
    },
    s if s.is_server_error() => {
      ProviderError::NetworkUnavailable(format!("server returned {}", s.as_u16()))
    }
    s => ProviderError::Malformed(format!("unexpected status {}", s.as_u16())),
  };
  Some(err)
}
