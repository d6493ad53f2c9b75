//! Tag discovery: candidate generation, normalization, and detect-based
//! verification.
//!
//! Candidates are cheap guesses (a "list the objects" query plus caption
//! tokens); `detect` is the ground truth. Only candidates that come back
//! with at least one bounding box are kept, so every stored tag can be
//! highlighted in the UI.

use std::collections::HashSet;

use serde::Serialize;
use serde_json::Value;

use crate::normalize::{self, DetectBox, SegmentBbox};
use crate::provider::VlmProvider;
use crate::types::TagsMode;

/// Caption tokens that are never object candidates.
const CAPTION_STOPWORDS: &[&str] = &[
    "the", "and", "with", "without", "from", "into", "over", "under", "near", "behind", "front",
    "left", "right", "top", "bottom", "this", "that", "these", "those", "there", "here", "image",
    "photo", "picture", "view", "scene", "very", "more", "most", "some", "many", "few", "one",
    "two", "three",
];

/// Words stripped from candidates so tags stay noun-like. The VLM often
/// answers with adjective+noun phrases; for tags we prefer the noun.
const MODIFIER_WORDS: &[&str] = &[
    // articles / structure
    "a", "an", "the", "of", "and", "with", "without", "in", "on", "at",
    // colors
    "white", "black", "red", "green", "blue", "yellow", "orange", "purple", "pink", "brown",
    "gray", "grey", "gold", "silver",
    // positions / shapes / common modifiers
    "left", "right", "top", "bottom", "center", "central", "upper", "lower", "front", "back",
    "circular", "round", "square", "rectangular", "evenly", "even", "large", "small", "big",
    "tiny", "smooth", "shiny", "side",
    // presentation verbs that leak in from captions and query output
    "show", "shows", "showing", "depict", "depicts", "depicted", "present", "presents",
    "presenting", "placed", "arranged",
    // generic non-object terms
    "image", "photo", "picture", "scene",
    // number words
    "one", "two", "three", "four", "five", "six", "seven", "eight", "nine", "ten", "first",
    "second", "third",
];

/// Verified detection payload stored per kept tag (serialized into
/// `asset_segments.bbox_json`).
#[derive(Debug, Clone, Serialize)]
pub struct TagDetection {
    pub tag: String,
    pub boxes: Vec<DetectBox>,
    pub raw: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segment_bbox: Option<SegmentBbox>,
}

/// One kept tag with its grounding artifacts, in discovery order.
#[derive(Debug)]
pub struct DiscoveredTag {
    pub tag: String,
    pub svg: Option<String>,
    pub detection: TagDetection,
}

/// Drives candidate generation and verification against a provider.
pub struct TagDiscovery<'a> {
    provider: &'a dyn VlmProvider,
    mode: TagsMode,
    max_tags: usize,
}

impl<'a> TagDiscovery<'a> {
    pub fn new(provider: &'a dyn VlmProvider, mode: TagsMode, max_tags: usize) -> Self {
        Self {
            provider,
            mode,
            max_tags,
        }
    }

    /// Produce up to `max_tags` detect-confirmed tags for the image,
    /// with best-effort segmentation masks attached.
    pub async fn discover(&self, image_ref: &str, caption: &str) -> Vec<DiscoveredTag> {
        let candidates = self.candidates(image_ref, caption).await;

        let mut kept: Vec<DiscoveredTag> = Vec::new();
        // Probe a few more candidates than we plan to keep, then stop once
        // we have enough.
        let probe_limit = std::cmp::max(24, self.max_tags * 3);
        for candidate in candidates.into_iter().take(probe_limit) {
            if kept.len() >= self.max_tags {
                break;
            }
            let response = match self.provider.detect(image_ref, &candidate).await {
                Ok(response) => response,
                Err(err) => {
                    tracing::debug!(tag = %candidate, error = %err, "detect failed, skipping candidate");
                    continue;
                }
            };
            let boxes = normalize::detect_boxes(&response);
            if boxes.is_empty() {
                continue;
            }
            kept.push(DiscoveredTag {
                tag: candidate.clone(),
                svg: None,
                detection: TagDetection {
                    tag: candidate,
                    boxes,
                    raw: response,
                    segment_bbox: None,
                },
            });
        }

        self.segment_kept(image_ref, &mut kept).await;
        kept
    }

    /// Ordered, normalized, deduplicated candidates: query results first,
    /// caption tokens fill the remaining slots.
    async fn candidates(&self, image_ref: &str, caption: &str) -> Vec<String> {
        let mut raw: Vec<String> = Vec::new();

        if matches!(self.mode, TagsMode::Query | TagsMode::Hybrid) {
            let question = format!(
                "List up to {} distinct objects visible in this image. \
                 Respond with ONLY a JSON array. Each item should be a short noun \
                 or noun phrase (1-2 words), lowercase, with no colors, counts, or \
                 adjectives. Example: [\"person\",\"dog\",\"coffee table\"].",
                self.max_tags * 2
            );
            match self.provider.query(image_ref, &question).await {
                Ok(answer) => raw.extend(normalize::query_candidates(&answer)),
                Err(err) => {
                    tracing::debug!(error = %err, "object query failed, falling back to caption tokens");
                }
            }
        }

        if matches!(self.mode, TagsMode::Caption | TagsMode::Hybrid) {
            for token in tokenize_candidates(caption) {
                if !raw.contains(&token) {
                    raw.push(token);
                }
            }
        }

        dedupe_preserve_order(raw.iter().map(|c| normalize_candidate(c)))
    }

    /// Segment each kept tag, best-effort. A provider that reports the
    /// operation as unsupported disables segmentation for the rest of the
    /// job; other failures just leave that tag without a mask.
    async fn segment_kept(&self, image_ref: &str, kept: &mut [DiscoveredTag]) {
        let mut supported = true;
        for entry in kept.iter_mut() {
            if !supported {
                continue;
            }
            match self.provider.segment(image_ref, &entry.tag).await {
                Ok(response) => {
                    entry.svg = normalize::segment_svg(&response);
                    entry.detection.segment_bbox = normalize::segment_bbox(&response);
                }
                Err(err) => {
                    if err.is_unsupported() {
                        tracing::debug!(error = %err, "segmentation unsupported, skipping remaining tags");
                        supported = false;
                    } else {
                        tracing::debug!(tag = %entry.tag, error = %err, "segment failed for tag");
                    }
                }
            }
        }
    }
}

/// Lightweight candidate extraction from a caption: lowercase, letters
/// only, length ≥ 3, stopwords dropped, first-occurrence order. Detect is
/// the real filter downstream.
pub fn tokenize_candidates(text: &str) -> Vec<String> {
    let cleaned: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_lowercase() { c } else { ' ' })
        .collect();

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for token in cleaned.split_whitespace() {
        if token.len() < 3 || CAPTION_STOPWORDS.contains(&token) {
            continue;
        }
        if seen.insert(token.to_string()) {
            out.push(token.to_string());
        }
    }
    out
}

/// Normalize one candidate into a short noun-like phrase, or an empty
/// string when nothing object-like survives.
pub fn normalize_candidate(candidate: &str) -> String {
    let lowered = candidate.trim().to_lowercase().replace(['_', '-'], " ");
    let cleaned: String = lowered
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect();
    let mut text = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");

    for article in ["a ", "an ", "the "] {
        if let Some(rest) = text.strip_prefix(article) {
            text = rest.trim().to_string();
            break;
        }
    }

    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return String::new();
    }

    let pruned: Vec<&str> = words
        .iter()
        .copied()
        .filter(|w| !MODIFIER_WORDS.contains(w) && !w.chars().all(|c| c.is_ascii_digit()))
        .collect();
    // A candidate made only of modifiers and numbers is not an object.
    if pruned.is_empty() {
        return String::new();
    }

    // Short phrases survive intact; detect handles them reasonably well.
    let keep = pruned.len().min(3);
    let result = pruned[..keep].join(" ");
    if result.len() < 2 {
        return String::new();
    }
    result
}

/// Deduplicate, dropping empties, preserving first-occurrence order.
pub fn dedupe_preserve_order<I: IntoIterator<Item = String>>(items: I) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for item in items {
        if item.is_empty() || !seen.insert(item.clone()) {
            continue;
        }
        out.push(item);
    }
    out
}
