//! Transcript Provider Module
//!
//! Defines the collaborator trait for fetching transcripts plus two
//! implementations: an in-memory mock and a directory of JSON exports.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Deserialize;

use super::models::{Transcript, TranscriptSegment};
use crate::core::{CoreError, CoreResult};

// =============================================================================
// Transcript Provider Trait
// =============================================================================

/// Source of timestamped transcripts.
///
/// Implementations try `preferred_languages` in order and return the first
/// transcript they can supply. When none is available they fail with
/// [`CoreError::TranscriptUnavailable`].
#[async_trait]
pub trait TranscriptProvider: Send + Sync {
    /// Returns the provider name
    fn name(&self) -> &str;

    /// Fetches the transcript of `video_id`
    async fn fetch_transcript(
        &self,
        video_id: &str,
        preferred_languages: &[String],
    ) -> CoreResult<Transcript>;
}

fn unavailable(video_id: &str, preferred_languages: &[String]) -> CoreError {
    let reason = if preferred_languages.is_empty() {
        "no transcript available".to_string()
    } else {
        format!(
            "no transcript in any of [{}]",
            preferred_languages.join(", ")
        )
    };
    CoreError::TranscriptUnavailable {
        video_id: video_id.to_string(),
        reason,
    }
}

// =============================================================================
// Mock Provider (for testing)
// =============================================================================

/// In-memory transcript provider keyed by `(video_id, language)`
#[derive(Default)]
pub struct MockTranscriptProvider {
    transcripts: Mutex<HashMap<(String, String), Vec<(f64, f64, String)>>>,
    calls: Mutex<Vec<String>>,
}

impl MockTranscriptProvider {
    /// Creates an empty provider
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a transcript as `(start, end, text)` triples
    pub fn with_transcript(self, video_id: &str, language: &str, segments: &[(f64, f64, &str)]) -> Self {
        if let Ok(mut map) = self.transcripts.lock() {
            map.insert(
                (video_id.to_string(), language.to_string()),
                segments
                    .iter()
                    .map(|(s, e, t)| (*s, *e, t.to_string()))
                    .collect(),
            );
        }
        self
    }

    /// Video ids requested so far, in call order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl TranscriptProvider for MockTranscriptProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn fetch_transcript(
        &self,
        video_id: &str,
        preferred_languages: &[String],
    ) -> CoreResult<Transcript> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(video_id.to_string());
        }

        let map = self
            .transcripts
            .lock()
            .map_err(|_| CoreError::Internal("transcript map poisoned".to_string()))?;

        let found = if preferred_languages.is_empty() {
            map.iter()
                .filter(|((vid, _), _)| vid == video_id)
                .min_by(|a, b| a.0 .1.cmp(&b.0 .1))
                .map(|((_, lang), segs)| (lang.clone(), segs.clone()))
        } else {
            preferred_languages.iter().find_map(|lang| {
                map.get(&(video_id.to_string(), lang.clone()))
                    .map(|segs| (lang.clone(), segs.clone()))
            })
        };

        let (language, raw) = found.ok_or_else(|| unavailable(video_id, preferred_languages))?;

        let segments = raw
            .iter()
            .enumerate()
            .map(|(i, (start, end, text))| {
                TranscriptSegment::new(video_id, i, *start, *end, text).with_language(&language)
            })
            .collect();

        Ok(Transcript::with_segments(video_id, segments).with_language(&language))
    }
}

// =============================================================================
// JSON Directory Provider
// =============================================================================

/// Segment shape of exported caption files (`start` + `duration` in seconds)
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExportedSegment {
    text: String,
    start: f64,
    duration: f64,
}

/// Reads transcripts exported as `{video_id}.{lang}.json` files.
///
/// A file without a language suffix (`{video_id}.json`) is used when no
/// preferred language is requested.
pub struct JsonDirTranscriptProvider {
    root: PathBuf,
}

impl JsonDirTranscriptProvider {
    /// Creates a provider reading from `root`
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn candidate_paths(&self, video_id: &str, preferred_languages: &[String]) -> Vec<(Option<String>, PathBuf)> {
        if preferred_languages.is_empty() {
            return vec![(None, self.root.join(format!("{}.json", video_id)))];
        }
        preferred_languages
            .iter()
            .map(|lang| {
                (
                    Some(lang.clone()),
                    self.root.join(format!("{}.{}.json", video_id, lang)),
                )
            })
            .collect()
    }

    fn parse(video_id: &str, language: Option<&str>, body: &str) -> CoreResult<Transcript> {
        let exported: Vec<ExportedSegment> = serde_json::from_str(body).map_err(|e| {
            CoreError::TranscriptUnavailable {
                video_id: video_id.to_string(),
                reason: format!("malformed transcript export: {}", e),
            }
        })?;

        let segments = exported
            .into_iter()
            .enumerate()
            .map(|(i, seg)| {
                let segment =
                    TranscriptSegment::new(video_id, i, seg.start, seg.start + seg.duration, &seg.text);
                match language {
                    Some(lang) => segment.with_language(lang),
                    None => segment,
                }
            })
            .collect();

        let transcript = Transcript::with_segments(video_id, segments);
        Ok(match language {
            Some(lang) => transcript.with_language(lang),
            None => transcript,
        })
    }
}

#[async_trait]
impl TranscriptProvider for JsonDirTranscriptProvider {
    fn name(&self) -> &str {
        "json-dir"
    }

    async fn fetch_transcript(
        &self,
        video_id: &str,
        preferred_languages: &[String],
    ) -> CoreResult<Transcript> {
        crate::core::fs::validate_path_id_component(video_id, "videoId")
            .map_err(CoreError::ValidationError)?;

        for (language, path) in self.candidate_paths(video_id, preferred_languages) {
            match tokio::fs::read_to_string(&path).await {
                Ok(body) => return Self::parse(video_id, language.as_deref(), &body),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::debug!(path = %path.display(), "No transcript export at path");
                }
                Err(e) => return Err(CoreError::IoError(e)),
            }
        }

        Err(unavailable(video_id, preferred_languages))
    }
}

// =============================================================================
// Tests
// =============================================================================
