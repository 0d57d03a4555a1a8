// HTTP client for the request/response refinement service.
//
// Failures come back to the caller with the service's message; nothing here
// retries.

use std::time::Duration;

use cowrite_common::protocol::control::AiAction;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("no refinement service configured")]
    NotConfigured,
    #[error("local document is still loading")]
    NotHydrated,
    #[error("`{0}` has no refinement endpoint")]
    NotRefinable(AiAction),
    #[error("invalid refine_url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("refinement request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("refinement service returned {status}: {message}")]
    Status { status: u16, message: String },
}

#[derive(Debug, Serialize)]
struct RefineRequest<'a> {
    text: &'a str,
    action: &'static str,
}

#[derive(Debug, Deserialize)]
struct RefineResponse {
    text: String,
}

#[derive(Debug, Clone)]
pub struct RefineClient {
    http: reqwest::Client,
    base: Url,
}

impl RefineClient {
    pub fn new(base_url: &str) -> Result<Self, UpstreamError> {
        let invalid = |reason: String| UpstreamError::InvalidUrl { url: base_url.to_string(), reason };
        let mut base = Url::parse(base_url).map_err(|error| invalid(error.to_string()))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(invalid("expected http or https".to_string()));
        }
        // `Url::join` replaces the last segment unless the path ends in '/'.
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { http, base })
    }

    pub fn endpoint(&self, action: AiAction) -> Result<Url, UpstreamError> {
        let name = action.refine_endpoint().ok_or(UpstreamError::NotRefinable(action))?;
        self.base.join(name).map_err(|error| UpstreamError::InvalidUrl {
            url: self.base.to_string(),
            reason: error.to_string(),
        })
    }

    /// POST `{text, action}` and return the rewritten text.
    pub async fn refine(&self, action: AiAction, text: &str) -> Result<String, UpstreamError> {
        let url = self.endpoint(action)?;
        let action_name = action.refine_endpoint().ok_or(UpstreamError::NotRefinable(action))?;
        debug!(%url, chars = text.chars().count(), "sending refinement request");

        let response = self
            .http
            .post(url)
            .json(&RefineRequest { text, action: action_name })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Status { status: status.as_u16(), message: error_message(&body) });
        }
        let refined: RefineResponse = response.json().await?;
        Ok(refined.text)
    }
}

/// Pull a human-readable message out of an error body.
fn error_message(body: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        #[serde(alias = "error")]
        message: String,
    }

    match serde_json::from_str::<ErrorBody>(body) {
        Ok(parsed) => parsed.message,
        Err(_) if body.trim().is_empty() => "no details".to_string(),
        Err(_) => body.trim().to_string(),
    }
}
