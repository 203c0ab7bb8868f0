use crate::request::RequestKind;

const VIDEO_CUES: &[&str] = &["video", "animate", "animation", "clip of", "movie of"];
const VECTOR_CUES: &[&str] = &["vectorize", "vectorise", "svg", "trace this", "to vector"];
const ANALYZE_CUES: &[&str] = &[
    "analyze",
    "analyse",
    "describe",
    "what is in",
    "what's in",
    "caption",
];
const BLEND_CUES: &[&str] = &["blend", "combine", "merge", "mix", "fuse"];
const EDIT_HEADS: &[&str] = &[
    "edit", "replace", "remove", "add", "change", "make", "turn", "recolor", "erase",
];
const GENERATE_CUES: &[&str] = &[
    "draw",
    "generate",
    "create",
    "paint",
    "render",
    "sketch",
    "illustrate",
    "image of",
    "picture of",
    "photo of",
    "design a",
];

/// Chooses a tool for a free-form prompt when the caller did not name one.
///
/// `source_count` counts explicitly attached images; `has_cached` tells
/// whether a previous result can stand in as the implicit subject.
pub fn route_prompt(prompt: &str, source_count: usize, has_cached: bool) -> RequestKind {
    let lowered = prompt.trim().to_ascii_lowercase();
    let has_subject = source_count > 0 || has_cached;

    if contains_any(&lowered, VIDEO_CUES) {
        return RequestKind::Video;
    }
    if has_subject && contains_any(&lowered, VECTOR_CUES) {
        return RequestKind::Vectorize;
    }
    if has_subject && contains_any(&lowered, ANALYZE_CUES) {
        return RequestKind::Analyze;
    }
    if source_count >= 2 && contains_any(&lowered, BLEND_CUES) {
        return RequestKind::Blend;
    }
    if has_subject && is_edit_style_prompt(&lowered) {
        return RequestKind::Edit;
    }
    if contains_any(&lowered, GENERATE_CUES) {
        return RequestKind::Generate;
    }
    if source_count == 1 {
        return RequestKind::Edit;
    }
    RequestKind::Chat
}

pub fn is_edit_style_prompt(prompt: &str) -> bool {
    let mut tokens = prompt.split_whitespace();
    let head = tokens.next().unwrap_or("").trim().to_ascii_lowercase();
    EDIT_HEADS.iter().any(|candidate| *candidate == head)
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}
