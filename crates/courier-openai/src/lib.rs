//! OpenAI-compatible chat completion adapter.
//!
//! Works against any endpoint that accepts the `chat/completions` request shape
//! (hosted OpenAI, local text-generation servers, proxies).

use std::time::Duration;

use async_trait::async_trait;
use courier_core::{
    completion::{CompletionClient, CompletionRequest},
    errors::Error,
    Result,
};
use tracing::debug;

#[derive(Clone, Debug)]
pub struct OpenAiCompatClient {
    api_url: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

impl OpenAiCompatClient {
    /// `timeout` bounds the whole request; callers may apply a tighter one.
    pub fn new(api_url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("http client build failed: {e}")))?;
        Ok(Self {
            api_url: api_url.into(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            http,
        })
    }
}

#[async_trait]
impl CompletionClient for OpenAiCompatClient {
    async fn complete(&self, req: &CompletionRequest) -> Result<String> {
        let mut call = self.http.post(&self.api_url).json(req);
        if let Some(key) = &self.api_key {
            call = call.bearer_auth(key);
        }

        let resp = call
            .send()
            .await
            .map_err(|e| Error::TransientApi(format!("completion request error: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::TransientApi(format!(
                "completion failed: {status} {}",
                body.chars().take(200).collect::<String>()
            )));
        }

        let v: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| Error::TransientApi(format!("completion json error: {e}")))?;

        let text = extract_text(&v).ok_or_else(|| {
            Error::TransientApi("completion response has no message content".to_string())
        })?;
        debug!(chars = text.len(), "completion received");
        Ok(text.to_string())
    }
}

/// `choices[0].message.content`, falling back to the legacy `{ "result": ... }` shape.
fn extract_text(v: &serde_json::Value) -> Option<&str> {
    v.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .or_else(|| v.get("result").and_then(|r| r.as_str()))
}
