//! Generic remote captioning endpoint.
//!
//! Remote inference endpoints differ wildly in schema, so this adapter
//! stays deliberately generic: raw image bytes in, best-effort caption
//! parsing out. Only `caption` is implemented; the pipeline treats the
//! other operations' "not supported" errors as a cue to skip those steps.

use async_trait::async_trait;
use serde_json::Value;

use super::{VlmProvider, VLM_TIMEOUT};
use crate::error::ProviderError;
use crate::types::CaptionLength;

pub struct RemoteProvider {
    endpoint_url: String,
    token: String,
    client: reqwest::Client,
}

impl RemoteProvider {
    pub fn new(endpoint_url: &str, token: &str) -> Self {
        Self {
            endpoint_url: endpoint_url.to_string(),
            token: token.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

/// Best-effort caption extraction across the response schemas remote
/// endpoints commonly use.
fn parse_caption(data: &Value) -> String {
    let caption = match data {
        Value::Object(obj) => ["caption", "generated_text", "text", "answer"]
            .iter()
            .filter_map(|key| obj.get(*key).and_then(|v| v.as_str()))
            .map(str::trim)
            .find(|s| !s.is_empty())
            .map(String::from)
            .unwrap_or_default(),
        Value::Array(items) => items
            .first()
            .and_then(|v| v.as_object())
            .and_then(|first| {
                ["generated_text", "text"]
                    .iter()
                    .filter_map(|key| first.get(*key).and_then(|v| v.as_str()))
                    .map(str::trim)
                    .find(|s| !s.is_empty())
            })
            .map(String::from)
            .unwrap_or_default(),
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    };

    if caption.is_empty() {
        data.to_string()
    } else {
        caption
    }
}

#[async_trait]
impl VlmProvider for RemoteProvider {
    fn name(&self) -> &str {
        "remote"
    }

    fn model_version(&self) -> &str {
        "remote_endpoint"
    }

    async fn caption(
        &self,
        image_ref: &str,
        _length: CaptionLength,
    ) -> Result<String, ProviderError> {
        let bytes = tokio::fs::read(image_ref)
            .await
            .map_err(|e| ProviderError::new(format!("failed to read image {image_ref}: {e}")))?;

        let resp = self
            .client
            .post(&self.endpoint_url)
            .bearer_auth(&self.token)
            .body(bytes)
            .timeout(VLM_TIMEOUT)
            .send()
            .await
            .map_err(|e| ProviderError::new(format!("remote caption request failed: {e}")))?;

        let status = resp.status();
        if status.as_u16() >= 400 {
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::with_status(
                format!("remote caption failed: {status} {text}"),
                status.as_u16(),
            ));
        }

        let data: Value = resp.json().await.map_err(|e| {
            ProviderError::new(format!("remote caption returned unparseable JSON: {e}"))
        })?;
        Ok(parse_caption(&data))
    }

    async fn detect(&self, _image_ref: &str, _object: &str) -> Result<Value, ProviderError> {
        Err(ProviderError::unsupported("detect", "remote"))
    }

    async fn segment(&self, _image_ref: &str, _object: &str) -> Result<Value, ProviderError> {
        Err(ProviderError::unsupported("segment", "remote"))
    }

    async fn query(&self, _image_ref: &str, _question: &str) -> Result<String, ProviderError> {
        Err(ProviderError::unsupported("query", "remote"))
    }
}
