//! Pluggable speech and expression capabilities. The daemon itself never
//! runs a model; the shell that embeds it does, and hands results through
//! these seams. The built-in implementations decode what the shell sends so
//! the scoring path stays identical whichever side produced the signal.

use anyhow::Result;
use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct Transcription {
    pub text: String,
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct Detection {
    pub label: String,
    pub confidence: f64,
    pub all_scores: Vec<(String, f64)>,
}

pub trait Transcriber: Send {
    fn transcribe(&self, audio: &[u8], language_hint: &str) -> Result<Transcription>;
}

pub trait ExpressionDetector: Send {
    fn detect(&self, image: &[u8]) -> Result<Detection>;
}

/// Treats the "audio" payload as the transcript itself: the shell already
/// ran speech recognition and sends the text bytes through. Anything that
/// is not UTF-8 comes back as an empty transcript rather than an error, so
/// a silent or clipped recording scores zero instead of failing the call.
pub struct EchoTranscriber;

impl Transcriber for EchoTranscriber {
    fn transcribe(&self, audio: &[u8], _language_hint: &str) -> Result<Transcription> {
        let text = match std::str::from_utf8(audio) {
            Ok(s) => s.trim().to_string(),
            Err(_) => String::new(),
        };
        Ok(Transcription {
            text,
            confidence: None,
        })
    }
}

#[derive(Deserialize)]
struct DetectionPayload {
    label: String,
    confidence: f64,
    #[serde(default)]
    scores: Vec<(String, f64)>,
}

/// Counterpart for expressions. Tries the payload as a JSON object
/// `{"label": ..., "confidence": ..., "scores": [...]}` produced by the
/// shell's detector; anything else is treated as a frame with no usable
/// face and falls back to `no_face` at zero confidence, which no threshold
/// accepts.
pub struct HeuristicDetector;

impl ExpressionDetector for HeuristicDetector {
    fn detect(&self, image: &[u8]) -> Result<Detection> {
        let parsed = std::str::from_utf8(image)
            .ok()
            .and_then(|s| serde_json::from_str::<DetectionPayload>(s).ok());
        Ok(match parsed {
            Some(p) => Detection {
                label: p.label,
                confidence: p.confidence,
                all_scores: p.scores,
            },
            None => Detection {
                label: "no_face".to_string(),
                confidence: 0.0,
                all_scores: Vec::new(),
            },
        })
    }
}
