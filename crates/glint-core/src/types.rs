//! Core value types shared across the pipeline.

/// One asset's worth of work, materialized from `assets ⋈ asset_ai` at
/// lease time. Lives for a single pass through the pipeline and is never
/// persisted.
#[derive(Debug, Clone)]
pub struct Job {
    pub asset_id: String,
    pub project_id: String,
    pub original_name: String,
    pub mime_type: String,
    pub storage_path: String,
    pub storage_url: Option<String>,
    pub sha256: String,
}

/// `asset_ai.status` values. Transitions form the DAG
/// `pending → processing → {done, failed, pending}`; only the worker moves
/// a row out of `processing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

impl AssetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetStatus::Pending => "pending",
            AssetStatus::Processing => "processing",
            AssetStatus::Done => "done",
            AssetStatus::Failed => "failed",
        }
    }
}

/// Caption verbosity understood by the station `/v1/caption` endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptionLength {
    Short,
    Normal,
    Long,
}

impl CaptionLength {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptionLength::Short => "short",
            CaptionLength::Normal => "normal",
            CaptionLength::Long => "long",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "short" => Some(CaptionLength::Short),
            "normal" => Some(CaptionLength::Normal),
            "long" => Some(CaptionLength::Long),
            _ => None,
        }
    }
}

/// Where tag candidates come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagsMode {
    /// Free-form "list objects" query only
    Query,
    /// Caption tokenization only
    Caption,
    /// Query first, caption tokens fill the remaining slots
    Hybrid,
}

impl TagsMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "query" => Some(TagsMode::Query),
            "caption" => Some(TagsMode::Caption),
            "hybrid" => Some(TagsMode::Hybrid),
            _ => None,
        }
    }
}

/// Source of the filename-alias title.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameMode {
    /// Reuse the caption (no extra VLM call)
    Caption,
    /// Dedicated query asking for a short title
    Query,
}

impl NameMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "caption" => Some(NameMode::Caption),
            "query" => Some(NameMode::Query),
            _ => None,
        }
    }
}

/// Which VLM adapter to construct at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// Local station exposing the full caption/detect/segment/query surface
    LocalStation,
    /// Generic remote endpoint, caption only
    Remote,
}

impl ProviderKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "local_station" => Some(ProviderKind::LocalStation),
            "remote" => Some(ProviderKind::Remote),
            _ => None,
        }
    }
}
