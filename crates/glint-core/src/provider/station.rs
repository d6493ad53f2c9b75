//! Local station provider exposing the full VLM surface.
//!
//! The station is a local REST service with `/v1/{caption,detect,segment,
//! query}` endpoints that accept JSON bodies carrying an inline image URL.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{VlmProvider, VLM_TIMEOUT};
use crate::error::ProviderError;
use crate::image::ImagePreprocessor;
use crate::types::CaptionLength;

pub struct StationProvider {
    endpoint: String,
    preprocessor: ImagePreprocessor,
    client: reqwest::Client,
}

impl StationProvider {
    /// Accepts either a bare host (`http://localhost:2020`) or an already
    /// versioned endpoint (`http://localhost:2020/v1`); normalized to the
    /// bare host.
    pub fn new(endpoint: &str, preprocessor: ImagePreprocessor) -> Self {
        let mut base = endpoint.trim_end_matches('/').to_string();
        if let Some(stripped) = base.strip_suffix("/v1") {
            base = stripped.to_string();
        }
        Self {
            endpoint: base,
            preprocessor,
            client: reqwest::Client::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn image_url(&self, image_ref: &str) -> Result<String, ProviderError> {
        self.preprocessor
            .image_url(image_ref)
            .map_err(|e| ProviderError::new(format!("failed to read image {image_ref}: {e}")))
    }

    async fn post(&self, op: &str, body: Value) -> Result<Value, ProviderError> {
        let url = format!("{}/v1/{op}", self.endpoint);

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .timeout(VLM_TIMEOUT)
            .send()
            .await
            .map_err(|e| ProviderError::new(format!("station {op} request failed: {e}")))?;

        let status = resp.status();
        if status.as_u16() >= 400 {
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::with_status(
                format!("station {op} failed: {status} {text}"),
                status.as_u16(),
            ));
        }

        let data: Value = resp.json().await.map_err(|e| {
            ProviderError::new(format!("station {op} returned unparseable JSON: {e}"))
        })?;

        if body_reports_error(&data) {
            return Err(ProviderError::new(format!("station {op} error: {data}")));
        }
        Ok(data)
    }
}

/// A 2xx response can still carry a failure: an `error` field, or a
/// `status` of `rejected`/`timeout` when the station sheds load.
fn body_reports_error(data: &Value) -> bool {
    let Some(obj) = data.as_object() else {
        return false;
    };
    let errored = match obj.get("error") {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    };
    errored
        || matches!(
            obj.get("status").and_then(|v| v.as_str()),
            Some("rejected") | Some("timeout")
        )
}

/// Pull the first non-empty string out of `keys`, falling back to the
/// serialized body so callers always get a non-empty result.
fn text_or_body(data: &Value, keys: &[&str]) -> String {
    for key in keys {
        if let Some(s) = data.get(key).and_then(|v| v.as_str()) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    data.to_string()
}

#[async_trait]
impl VlmProvider for StationProvider {
    fn name(&self) -> &str {
        "local_station"
    }

    fn model_version(&self) -> &str {
        "local_station"
    }

    async fn caption(
        &self,
        image_ref: &str,
        length: CaptionLength,
    ) -> Result<String, ProviderError> {
        let body = json!({
            "stream": false,
            "length": length.as_str(),
            "image_url": self.image_url(image_ref)?,
        });
        let data = self.post("caption", body).await?;
        Ok(text_or_body(&data, &["caption", "text"]))
    }

    async fn detect(&self, image_ref: &str, object: &str) -> Result<Value, ProviderError> {
        let body = json!({
            "stream": false,
            "object": object,
            "image_url": self.image_url(image_ref)?,
        });
        self.post("detect", body).await
    }

    async fn segment(&self, image_ref: &str, object: &str) -> Result<Value, ProviderError> {
        let body = json!({
            "stream": false,
            "object": object,
            "image_url": self.image_url(image_ref)?,
        });
        self.post("segment", body).await
    }

    async fn query(&self, image_ref: &str, question: &str) -> Result<String, ProviderError> {
        let body = json!({
            "stream": false,
            "question": question,
            "image_url": self.image_url(image_ref)?,
        });
        let data = self.post("query", body).await?;
        Ok(text_or_body(&data, &["answer", "text", "caption"]))
    }
}
