//! Complexity scoring: a pure function over request features.
//!
//! Same inputs always produce the same score, capability set, and rationale
//! tags; nothing here performs IO.

use serde::Serialize;

use crate::constants::CHARS_PER_TOKEN;
use crate::pipeline::ExtractionKind;
use crate::router::catalog::{Capability, CapabilitySet};
use crate::text::looks_like_code;

const CHARS_PER_POINT: usize = 800;
const PAYLOAD_POINT_CAP: u32 = 25;
const POINTS_PER_FILE: u32 = 5;
const FILE_COUNT_CAP: u32 = 20;
const BYTES_PER_POINT: u64 = 200 * 1024;
const FILE_BYTES_CAP: u32 = 15;
const IMAGE_POINTS: u32 = 10;
const AUDIO_POINTS: u32 = 15;
const TABULAR_POINTS: u32 = 5;
const CAPABILITY_HINT_POINTS: u32 = 10;
const CODE_POINTS: u32 = 5;
const SCORE_CAP: u32 = 100;
const DEFAULT_OUTPUT_CEILING: u64 = 4_096;
const LONG_CONTEXT_NUM: u64 = 3;
const LONG_CONTEXT_DEN: u64 = 4;

/// Message view the scorer needs: role plus content.
#[derive(Debug, Clone)]
pub struct ScoredMessage {
    pub is_user: bool,
    pub content: String,
}

/// Per-file signal derived from the resolved extraction.
#[derive(Debug, Clone)]
pub struct FileSignal {
    pub bytes: u64,
    pub kind: ExtractionKind,
    pub text_len: usize,
}

#[derive(Debug, Clone)]
pub struct ScoreInput {
    pub messages: Vec<ScoredMessage>,
    pub files: Vec<FileSignal>,
    pub max_tokens_hint: Option<u32>,
    /// Smallest fast-tier context window in the catalog snapshot; drives the
    /// long-context requirement.
    pub fast_context_floor: u64,
}

/// Deterministic complexity verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComplexityScore {
    pub score: u8,
    pub required: CapabilitySet,
    pub estimated_input_tokens: u64,
    pub estimated_output_ceiling: u64,
    pub rationale: Vec<String>,
}

pub fn score(input: &ScoreInput) -> ComplexityScore {
    let mut points: u32 = 0;
    let mut rationale = Vec::new();
    let mut required = CapabilitySet::new();
    required.insert(Capability::Text);

    // Accumulated user-role content length.
    let user_chars: usize = input
        .messages
        .iter()
        .filter(|m| m.is_user)
        .map(|m| m.content.chars().count())
        .sum();
    let payload_points = ((user_chars / CHARS_PER_POINT) as u32).min(PAYLOAD_POINT_CAP);
    if payload_points > 0 {
        points += payload_points;
        rationale.push(format!("payload:{payload_points}"));
    }

    if !input.files.is_empty() {
        let count_points = (input.files.len() as u32 * POINTS_PER_FILE).min(FILE_COUNT_CAP);
        points += count_points;
        rationale.push(format!("files:{}", input.files.len()));

        let total_bytes: u64 = input.files.iter().map(|f| f.bytes).sum();
        let byte_points = ((total_bytes / BYTES_PER_POINT) as u32).min(FILE_BYTES_CAP);
        if byte_points > 0 {
            points += byte_points;
            rationale.push(format!("file-bytes:{byte_points}"));
        }
    }

    let has_image = input
        .files
        .iter()
        .any(|f| f.kind == ExtractionKind::ImageCaption);
    let has_audio = input
        .files
        .iter()
        .any(|f| f.kind == ExtractionKind::Transcript);
    let audible = input
        .files
        .iter()
        .any(|f| f.kind == ExtractionKind::Transcript && f.text_len > 0);
    let has_tabular = input.files.iter().any(|f| f.kind == ExtractionKind::Table);

    if has_image {
        points += IMAGE_POINTS;
        rationale.push("image-content".to_string());
        required.insert(Capability::Vision);
    }
    if has_audio {
        points += AUDIO_POINTS;
        rationale.push("audio-content".to_string());
    }
    if audible {
        required.insert(Capability::AudioUnderstanding);
    }
    if has_tabular {
        points += TABULAR_POINTS;
        rationale.push("tabular-content".to_string());
    }

    // Each required non-text capability is also an explicit complexity hint.
    let non_text_required = required
        .iter()
        .filter(|c| **c != Capability::Text)
        .count() as u32;
    if non_text_required > 0 {
        points += non_text_required * CAPABILITY_HINT_POINTS;
        rationale.push(format!("capabilities:{non_text_required}"));
    }

    let code_like = input
        .messages
        .iter()
        .filter(|m| m.is_user)
        .any(|m| looks_like_code(&m.content));
    if code_like {
        points += CODE_POINTS;
        rationale.push("code-content".to_string());
    }

    let message_chars: u64 = input
        .messages
        .iter()
        .map(|m| m.content.chars().count() as u64)
        .sum();
    let extraction_chars: u64 = input.files.iter().map(|f| f.text_len as u64).sum();
    let estimated_input_tokens = (message_chars + extraction_chars) / CHARS_PER_TOKEN;

    if estimated_input_tokens.saturating_mul(LONG_CONTEXT_DEN)
        > input.fast_context_floor.saturating_mul(LONG_CONTEXT_NUM)
    {
        required.insert(Capability::LongContext);
        rationale.push("long-context".to_string());
    }

    let estimated_output_ceiling = input
        .max_tokens_hint
        .map(u64::from)
        .unwrap_or(DEFAULT_OUTPUT_CEILING);

    ComplexityScore {
        score: points.min(SCORE_CAP) as u8,
        required,
        estimated_input_tokens,
        estimated_output_ceiling,
        rationale,
    }
}
