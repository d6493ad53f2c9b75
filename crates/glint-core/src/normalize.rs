//! Tolerant normalizers for the three unstable VLM response shapes.
//!
//! Response schemas drift across model versions, so rather than modeling
//! every variant in the type system these functions share one contract:
//! never fail, return the canonical form or nothing.

use serde::Serialize;
use serde_json::Value;

/// One detection box. Coordinates are whatever the VLM returned (the
/// station reports them normalized 0–1); min/max corners are preserved
/// when the source shape carried them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectBox {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x_min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y_min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x_max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y_max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

impl DetectBox {
    fn from_xywh(x: f64, y: f64, w: f64, h: f64, score: Option<f64>) -> Self {
        Self {
            x,
            y,
            w,
            h,
            x_min: None,
            y_min: None,
            x_max: None,
            y_max: None,
            score,
        }
    }
}

/// Bounding box reported alongside a segmentation mask.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SegmentBbox {
    pub x_min: f64,
    pub y_min: f64,
    pub x_max: f64,
    pub y_max: f64,
}

/// Accept numbers and numeric strings; anything else is "absent".
fn num(value: &Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

/// Normalize a detect response into a list of boxes.
///
/// Walks into `result` when present, then into the first of
/// `objects | detections | boxes`. Recognized element shapes:
/// `{x_min,y_min,x_max,y_max}`, `{x,y,w,h}`, `{box:{x,y,w,h}}`, and
/// `[x1,y1,x2,y2]`. Boxes with non-positive width or height are dropped;
/// malformed entries are skipped without failing the parse.
pub fn detect_boxes(response: &Value) -> Vec<DetectBox> {
    let mut data = response;
    if let Some(inner) = data.get("result") {
        data = inner;
    }
    if data.is_object() {
        for key in ["objects", "detections", "boxes"] {
            if let Some(inner) = data.get(key) {
                data = inner;
                break;
            }
        }
    }
    let Some(items) = data.as_array() else {
        return Vec::new();
    };

    let mut boxes = Vec::new();
    for item in items {
        if let Some(obj) = item.as_object() {
            let score = obj.get("score").and_then(num);

            // Station-style min/max corners, normalized 0..1.
            if let (Some(x_min), Some(y_min), Some(x_max), Some(y_max)) = (
                obj.get("x_min").and_then(num),
                obj.get("y_min").and_then(num),
                obj.get("x_max").and_then(num),
                obj.get("y_max").and_then(num),
            ) {
                boxes.push(DetectBox {
                    x: x_min,
                    y: y_min,
                    w: x_max - x_min,
                    h: y_max - y_min,
                    x_min: Some(x_min),
                    y_min: Some(y_min),
                    x_max: Some(x_max),
                    y_max: Some(y_max),
                    score,
                });
                continue;
            }

            if let (Some(x), Some(y), Some(w), Some(h)) = (
                obj.get("x").and_then(num),
                obj.get("y").and_then(num),
                obj.get("w").and_then(num),
                obj.get("h").and_then(num),
            ) {
                boxes.push(DetectBox::from_xywh(x, y, w, h, score));
                continue;
            }

            if let Some(inner) = obj.get("box").and_then(|v| v.as_object()) {
                if let (Some(x), Some(y), Some(w), Some(h)) = (
                    inner.get("x").and_then(num),
                    inner.get("y").and_then(num),
                    inner.get("w").and_then(num),
                    inner.get("h").and_then(num),
                ) {
                    boxes.push(DetectBox::from_xywh(x, y, w, h, score));
                }
                continue;
            }
        } else if let Some(corners) = item.as_array() {
            if corners.len() == 4 {
                if let (Some(x1), Some(y1), Some(x2), Some(y2)) = (
                    num(&corners[0]),
                    num(&corners[1]),
                    num(&corners[2]),
                    num(&corners[3]),
                ) {
                    boxes.push(DetectBox::from_xywh(x1, y1, x2 - x1, y2 - y1, None));
                }
            }
        }
    }

    boxes.retain(|b| b.w > 0.0 && b.h > 0.0);
    boxes
}

/// Normalize a segment response into an SVG string.
///
/// Accepts a raw string body, an `svg`/`mask_svg`/`result`/`output` field
/// that already starts with `<svg`, a nested `{result:{svg}}`, or a `path`
/// field (top-level or under `result`) holding an SVG path `d` attribute,
/// which is wrapped into a unit-viewBox SVG.
pub fn segment_svg(response: &Value) -> Option<String> {
    match response {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Object(obj) => {
            for key in ["svg", "mask_svg", "result", "output"] {
                if let Some(s) = obj.get(key).and_then(|v| v.as_str()) {
                    let trimmed = s.trim();
                    if trimmed.starts_with("<svg") {
                        return Some(trimmed.to_string());
                    }
                }
            }
            if let Some(result) = obj.get("result").and_then(|v| v.as_object()) {
                if let Some(s) = result.get("svg").and_then(|v| v.as_str()) {
                    let trimmed = s.trim();
                    if trimmed.starts_with("<svg") {
                        return Some(trimmed.to_string());
                    }
                }
                if let Some(path) = result.get("path").and_then(|v| v.as_str()) {
                    return wrap_path_to_svg(path);
                }
            }
            if let Some(path) = obj.get("path").and_then(|v| v.as_str()) {
                return wrap_path_to_svg(path);
            }
            None
        }
        _ => None,
    }
}

/// Wrap a bare SVG path `d` attribute into a renderable mask document.
fn wrap_path_to_svg(path: &str) -> Option<String> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return None;
    }
    let safe = trimmed.replace('"', "'");
    Some(format!(
        "<svg xmlns=\"http://www.w3.org/2000/svg\" viewBox=\"0 0 1 1\" preserveAspectRatio=\"none\"><path d=\"{safe}\" fill=\"white\" /></svg>"
    ))
}

/// Extract the bbox a segment response reports next to its mask, tolerant
/// of `result` nesting.
pub fn segment_bbox(response: &Value) -> Option<SegmentBbox> {
    let mut data = response;
    if let Some(inner) = data.get("result") {
        if inner.is_object() {
            data = inner;
        }
    }
    let bbox = data.get("bbox")?.as_object()?;
    Some(SegmentBbox {
        x_min: num(bbox.get("x_min")?)?,
        y_min: num(bbox.get("y_min")?)?,
        x_max: num(bbox.get("x_max")?)?,
        y_max: num(bbox.get("y_max")?)?,
    })
}

/// Turn a query response into a list of candidate strings.
///
/// A body that parses as a JSON array contributes its non-empty string
/// elements. Otherwise the text is split on the first separator present
/// among newline, comma, and semicolon, with bullet prefixes stripped.
pub fn query_candidates(text: &str) -> Vec<String> {
    let raw = text.trim();
    if raw.is_empty() {
        return Vec::new();
    }

    if let Ok(parsed) = serde_json::from_str::<Value>(raw) {
        if let Some(items) = parsed.as_array() {
            return items
                .iter()
                .filter_map(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
    }

    let normalized = raw.replace('\r', "\n");
    let mut parts: Vec<&str> = Vec::new();
    for sep in ['\n', ',', ';'] {
        if normalized.contains(sep) {
            parts = normalized.split(sep).collect();
            break;
        }
    }
    if parts.is_empty() {
        parts = vec![raw];
    }

    parts
        .into_iter()
        .filter_map(|part| {
            let cleaned = part.trim().trim_start_matches(['-', '•', '*']).trim();
            (!cleaned.is_empty()).then(|| cleaned.to_string())
        })
        .collect()
}
