use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::db;

pub const DEFAULT_PASS_MARK: f64 = 60.0;
pub const DEFAULT_ASR_MIN_RATIO: f64 = 0.40;
pub const DEFAULT_EMOTION_THRESHOLD: f64 = 0.15;

/// Stutter units longer than this are treated as real words, not repeats.
const STUTTER_UNIT_MAX: usize = 4;

/// Function words ignored when picking the key noun from an expected-speech
/// string. English and Tagalog mixed, matching the content the app ships.
const STOP_WORDS: [&str; 15] = [
    "ang", "si", "na", "ng", "yung", "yong", "the", "is", "are", "am", "has", "have", "with", "a",
    "an",
];

const SETTINGS_KEY: &str = "scoring";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoringConfig {
    pub pass_mark: f64,
    pub asr_min_ratio: f64,
    pub emotion_thresholds: HashMap<String, f64>,
    pub emotion_default_threshold: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        let mut emotion_thresholds = HashMap::new();
        emotion_thresholds.insert("happy".to_string(), 0.30);
        emotion_thresholds.insert("sad".to_string(), 0.35);
        emotion_thresholds.insert("angry".to_string(), 0.35);
        emotion_thresholds.insert("surprised".to_string(), 0.35);
        emotion_thresholds.insert("neutral".to_string(), 0.30);
        ScoringConfig {
            pass_mark: DEFAULT_PASS_MARK,
            asr_min_ratio: DEFAULT_ASR_MIN_RATIO,
            emotion_thresholds,
            emotion_default_threshold: DEFAULT_EMOTION_THRESHOLD,
        }
    }
}

impl ScoringConfig {
    pub fn emotion_threshold(&self, label: &str) -> f64 {
        self.emotion_thresholds
            .get(label)
            .copied()
            .unwrap_or(self.emotion_default_threshold)
    }
}

/// Loads the scoring configuration from workspace settings, falling back to
/// compiled defaults field-by-field so partial documents stay usable.
pub fn load_config(conn: &Connection) -> ScoringConfig {
    let mut cfg = ScoringConfig::default();
    let Ok(Some(saved)) = db::settings_get_json(conn, SETTINGS_KEY) else {
        return cfg;
    };
    if let Some(v) = saved.get("passMark").and_then(|v| v.as_f64()) {
        cfg.pass_mark = v;
    }
    if let Some(v) = saved.get("asrMinRatio").and_then(|v| v.as_f64()) {
        cfg.asr_min_ratio = v;
    }
    if let Some(v) = saved.get("emotionDefaultThreshold").and_then(|v| v.as_f64()) {
        cfg.emotion_default_threshold = v;
    }
    if let Some(map) = saved.get("emotionThresholds").and_then(|v| v.as_object()) {
        for (label, value) in map {
            if let Some(t) = value.as_f64() {
                cfg.emotion_thresholds.insert(label.clone(), t);
            }
        }
    }
    cfg
}

pub fn save_config(conn: &Connection, cfg: &ScoringConfig) -> anyhow::Result<()> {
    db::settings_set_json(conn, SETTINGS_KEY, &serde_json::to_value(cfg)?)
}

/// Lowercases, strips quote/punctuation characters, and collapses runs of
/// whitespace. Hyphens survive so stutter collapsing can see them.
pub fn normalize_text(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    let stripped: String = lowered
        .chars()
        .map(|c| match c {
            '"' | '\'' | '\u{201c}' | '\u{201d}' | '.' | ',' | '?' | '!' => ' ',
            other => other,
        })
        .collect();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Collapses stutter repetitions of short units, both hyphen-joined
/// ("ma-ma-ma" -> "ma") and as consecutive tokens ("ma ma ma" -> "ma"),
/// for any repeat count.
pub fn collapse_stutters(text: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    for token in text.split_whitespace() {
        let token = collapse_hyphen_run(token);
        if let Some(prev) = out.last() {
            if *prev == token && token.chars().count() <= STUTTER_UNIT_MAX {
                continue;
            }
        }
        out.push(token);
    }
    out.join(" ")
}

fn collapse_hyphen_run(token: &str) -> String {
    let parts: Vec<&str> = token.split('-').collect();
    if parts.len() >= 2 {
        let unit = parts[0];
        if !unit.is_empty()
            && unit.chars().count() <= STUTTER_UNIT_MAX
            && parts.iter().all(|p| *p == unit)
        {
            return unit.to_string();
        }
    }
    token.to_string()
}

/// First content word of a normalized expected-speech string: length > 2 and
/// not a stop word. None when the string has no content word.
pub fn key_noun(expected_norm: &str) -> Option<&str> {
    expected_norm
        .split_whitespace()
        .filter(|t| t.chars().count() > 2)
        .find(|t| !STOP_WORDS.contains(t))
}

/// Binary choice scoring shared by mcq, recognition and listening
/// activities. Exact key match or nothing.
pub fn score_choice(expected_key: &str, submitted_key: &str) -> f64 {
    let expected = expected_key.trim();
    let submitted = submitted_key.trim();
    if expected.is_empty() || submitted.is_empty() {
        return 0.0;
    }
    if expected == submitted {
        100.0
    } else {
        0.0
    }
}

/// Fuzzy speech scoring, collapsed to {0, 100}. Passes when the key noun or
/// any expected content token is heard verbatim, or when the whole strings
/// are similar enough (normalized Levenshtein >= the configured ratio).
pub fn score_speech(cfg: &ScoringConfig, expected_raw: &str, heard_raw: &str) -> f64 {
    let expected = normalize_text(expected_raw);
    let heard = collapse_stutters(&normalize_text(heard_raw));
    if expected.is_empty() || heard.is_empty() {
        return 0.0;
    }

    let heard_tokens: HashSet<&str> = heard.split_whitespace().collect();
    let expected_tokens: Vec<&str> = expected
        .split_whitespace()
        .filter(|t| t.chars().count() > 2)
        .collect();

    if let Some(key) = key_noun(&expected) {
        if heard_tokens.contains(key) {
            return 100.0;
        }
    }
    if expected_tokens.iter().any(|t| heard_tokens.contains(t)) {
        return 100.0;
    }
    if strsim::normalized_levenshtein(&expected, &heard) >= cfg.asr_min_ratio {
        return 100.0;
    }
    0.0
}

/// Maps detector/content labels onto the five canonical emotions. English
/// and Tagalog synonyms fold together; unknown labels pass through so they
/// can still be compared verbatim.
pub fn canonical_emotion(label: &str) -> String {
    let normalized = label.trim().to_lowercase();
    match normalized.as_str() {
        "happy" | "joy" | "happiness" | "masaya" => "happy".to_string(),
        "angry" | "anger" | "mad" | "galit" | "disgust" => "angry".to_string(),
        "sad" | "sadness" | "malungkot" | "fear" => "sad".to_string(),
        "surprised" | "surprise" | "gulat" => "surprised".to_string(),
        "neutral" | "calm" | "kalma" => "neutral".to_string(),
        _ => normalized,
    }
}

/// Emotion scoring: canonical labels must match AND the detector confidence
/// must clear the per-emotion threshold. A matching label below threshold
/// scores 0.
pub fn score_emotion(
    cfg: &ScoringConfig,
    expected_label: &str,
    detected_label: &str,
    confidence: f64,
) -> f64 {
    let expected = canonical_emotion(expected_label);
    let detected = canonical_emotion(detected_label);
    if expected.is_empty() || detected.is_empty() {
        return 0.0;
    }
    if expected != detected {
        return 0.0;
    }
    if confidence >= cfg.emotion_threshold(&detected) {
        100.0
    } else {
        0.0
    }
}
