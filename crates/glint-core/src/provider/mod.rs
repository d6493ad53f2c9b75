//! VLM provider trait, factory, and implementations.

mod remote;
mod station;

pub use remote::RemoteProvider;
pub use station::StationProvider;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::Config;
use crate::error::ProviderError;
use crate::image::ImagePreprocessor;
use crate::types::{CaptionLength, ProviderKind};

/// Per-operation timeout for VLM HTTP calls. Vision models are slow; the
/// station additionally reports its own `status: timeout` on overload.
pub(crate) const VLM_TIMEOUT: Duration = Duration::from_secs(180);

/// The four operations the enrichment pipeline needs from a VLM.
///
/// `image_ref` is a filesystem path or an `http`/`https`/`data:` URL;
/// implementations own whatever preprocessing their transport needs.
///
/// Uses `async_trait` because native async fn in trait is not object-safe
/// (the worker holds a `Box<dyn VlmProvider>`).
#[async_trait]
pub trait VlmProvider: Send + Sync {
    /// Provider name for logging.
    fn name(&self) -> &str;

    /// Stable model identifier persisted alongside results.
    fn model_version(&self) -> &str;

    /// Describe the image in one or a few sentences. Never returns an
    /// empty string on success.
    async fn caption(
        &self,
        image_ref: &str,
        length: CaptionLength,
    ) -> Result<String, ProviderError>;

    /// Locate instances of `object`; the raw response is handed to the
    /// detect normalizer.
    async fn detect(&self, image_ref: &str, object: &str) -> Result<Value, ProviderError>;

    /// Produce a segmentation mask for `object`; raw response goes to the
    /// segment normalizer.
    async fn segment(&self, image_ref: &str, object: &str) -> Result<Value, ProviderError>;

    /// Free-form visual question answering.
    async fn query(&self, image_ref: &str, question: &str) -> Result<String, ProviderError>;
}

/// Construct the configured provider. Called once at startup; providers
/// share no state with the job loop.
pub fn create_provider(config: &Config) -> Result<Box<dyn VlmProvider>, ProviderError> {
    match config.provider {
        ProviderKind::LocalStation => Ok(Box::new(StationProvider::new(
            &config.endpoint,
            ImagePreprocessor::from_config(config),
        ))),
        ProviderKind::Remote => {
            let url = config.remote_url.clone().ok_or_else(|| {
                ProviderError::new("remote provider requires GLINT_REMOTE_URL to be set")
            })?;
            let token = config.remote_token.clone().ok_or_else(|| {
                ProviderError::new("remote provider requires GLINT_REMOTE_TOKEN to be set")
            })?;
            Ok(Box::new(RemoteProvider::new(&url, &token)))
        }
    }
}
