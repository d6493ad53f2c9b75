//! Caption embeddings for semantic search.
//!
//! Wraps a MiniLM-style sentence transformer exported to ONNX. The
//! embedder is process-wide and lazily initialized: the first failed load
//! disables the feature for the lifetime of the process, and per-caption
//! failures are logged and swallowed. Enrichment never waits on or fails
//! because of this module.

use std::path::Path;
use std::sync::{Mutex, OnceLock};

use ort::session::Session;
use ort::value::Value;

use crate::error::EmbeddingError;
use crate::math;

/// Packed caption embedding ready for the `asset_embeddings` row.
#[derive(Debug, Clone)]
pub struct EmbeddingBlob {
    pub model: String,
    pub dim: usize,
    /// `dim` little-endian f32 values, L2-normalized
    pub bytes: Vec<u8>,
}

static EMBEDDER: OnceLock<Option<TextEmbedder>> = OnceLock::new();

const MAX_SEQUENCE_LEN: usize = 256;

struct TextEmbedder {
    session: Mutex<Session>,
    tokenizer: tokenizers::Tokenizer,
    model: String,
}

impl TextEmbedder {
    /// Load `model.onnx` + `tokenizer.json` from `<model_dir>/<model>/`.
    fn load(model_dir: &Path, model: &str) -> Result<Self, EmbeddingError> {
        let dir = model_dir.join(model);
        let model_path = dir.join("model.onnx");
        let tokenizer_path = dir.join("tokenizer.json");

        if !model_path.exists() || !tokenizer_path.exists() {
            return Err(EmbeddingError(format!(
                "model files not found under {}",
                dir.display()
            )));
        }

        let session = Session::builder()
            .map_err(|e| EmbeddingError(format!("failed to create ONNX session builder: {e}")))?
            .commit_from_file(&model_path)
            .map_err(|e| EmbeddingError(format!("failed to load embedding model: {e}")))?;

        let tokenizer = tokenizers::Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| EmbeddingError(format!("failed to load tokenizer: {e}")))?;

        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
            model: model.to_string(),
        })
    }

    /// Encode one text into an L2-normalized vector: transformer forward
    /// pass, then mean pooling over the attention mask.
    fn encode(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| EmbeddingError(format!("tokenization failed: {e}")))?;

        let input_ids: Vec<i64> = encoding
            .get_ids()
            .iter()
            .take(MAX_SEQUENCE_LEN)
            .map(|&id| id as i64)
            .collect();
        let attention_mask: Vec<i64> = encoding
            .get_attention_mask()
            .iter()
            .take(MAX_SEQUENCE_LEN)
            .map(|&m| m as i64)
            .collect();
        let token_type_ids: Vec<i64> = encoding
            .get_type_ids()
            .iter()
            .take(MAX_SEQUENCE_LEN)
            .map(|&t| t as i64)
            .collect();

        let seq_len = input_ids.len();
        if seq_len == 0 {
            return Err(EmbeddingError("tokenizer produced no tokens".to_string()));
        }
        let shape = vec![1i64, seq_len as i64];

        let ids_value = Value::from_array((shape.clone(), input_ids))
            .map_err(|e| EmbeddingError(format!("failed to create input tensor: {e}")))?;
        let mask_value = Value::from_array((shape.clone(), attention_mask.clone()))
            .map_err(|e| EmbeddingError(format!("failed to create mask tensor: {e}")))?;
        let type_value = Value::from_array((shape, token_type_ids))
            .map_err(|e| EmbeddingError(format!("failed to create type tensor: {e}")))?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| EmbeddingError(format!("embedder lock poisoned: {e}")))?;

        let outputs = session
            .run(ort::inputs![
                "input_ids" => ids_value,
                "attention_mask" => mask_value,
                "token_type_ids" => type_value
            ])
            .map_err(|e| EmbeddingError(format!("embedder inference failed: {e}")))?;

        let hidden_state = outputs
            .iter()
            .find(|(name, _)| *name == "last_hidden_state")
            .or_else(|| outputs.iter().next())
            .ok_or_else(|| EmbeddingError("embedder produced no outputs".to_string()))?;

        let (out_shape, data) = hidden_state
            .1
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbeddingError(format!("failed to extract hidden state: {e}")))?;

        let hidden_dim = out_shape.last().map(|&d| d as usize).unwrap_or(0);
        if hidden_dim == 0 || data.len() < seq_len * hidden_dim {
            return Err(EmbeddingError(format!(
                "unexpected hidden state shape {out_shape:?}"
            )));
        }

        let mut pooled = vec![0f32; hidden_dim];
        let mut token_count = 0f32;
        for (i, &mask) in attention_mask.iter().enumerate() {
            if mask == 0 {
                continue;
            }
            token_count += 1.0;
            let row = &data[i * hidden_dim..(i + 1) * hidden_dim];
            for (acc, value) in pooled.iter_mut().zip(row) {
                *acc += value;
            }
        }
        if token_count > 0.0 {
            for value in pooled.iter_mut() {
                *value /= token_count;
            }
        }

        math::l2_normalize_in_place(&mut pooled);
        Ok(pooled)
    }
}

/// Initialize-once accessor. `None` means the embedder is disabled for
/// this process.
fn embedder(model_dir: &Path, model: &str) -> Option<&'static TextEmbedder> {
    EMBEDDER
        .get_or_init(|| match TextEmbedder::load(model_dir, model) {
            Ok(embedder) => {
                tracing::info!(model, "caption embedder ready");
                Some(embedder)
            }
            Err(err) => {
                tracing::warn!(model, error = %err, "caption embeddings disabled for this process");
                None
            }
        })
        .as_ref()
}

/// Encode a caption into a packed little-endian f32 blob.
///
/// Soft-fails: `None` simply means "no embedding this time" and the
/// enrichment commit proceeds without one.
pub fn embed_caption(model_dir: &Path, model: &str, text: &str) -> Option<EmbeddingBlob> {
    let embedder = embedder(model_dir, model)?;
    match embedder.encode(text) {
        Ok(vector) => Some(EmbeddingBlob {
            model: embedder.model.clone(),
            dim: vector.len(),
            bytes: to_le_bytes(&vector),
        }),
        Err(err) => {
            tracing::warn!(error = %err, "caption embedding failed");
            None
        }
    }
}

fn to_le_bytes(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 4);
    for value in values {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}
