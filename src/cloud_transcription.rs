//! HTTP client for a faster-whisper ASR server.
//!
//! The stored audio file is uploaded as multipart form data to the
//! server's `/asr` endpoint and the returned segments are rendered into
//! the flat transcript format, one `[HH:MM:SS] text` line per segment.

use crate::settings::AppSettings;
use anyhow::{anyhow, Context, Result};
use log::debug;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Vocabulary hint sent to whisper when the user has not configured one.
pub const DEFAULT_INITIAL_PROMPT: &str = "This is a professional meeting recording with multiple speakers. \
The discussion may include project updates, action items, deadlines, and strategic planning. \
Speakers use common business terms like 'KPIs,' 'ROI,' 'milestones,' and 'stakeholders.' \
Transcribe with proper punctuation, capitalization, and paragraph breaks for clarity. \
Ignore filler words like 'um,' 'uh,' or 'you know' unless critical to context.";

// Transcribing an hours-long recording on CPU is slow; the request
// timeout has to absorb that.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(4 * 60 * 60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct AsrResponse {
    #[serde(default)]
    segments: Vec<AsrSegment>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AsrSegment {
    start: f64,
    text: String,
}

/// Transcribe a stored audio file via the configured whisper server.
///
/// `language` follows the meeting record; empty means auto-detect.
pub async fn transcribe_file(
    settings: &AppSettings,
    audio_path: &Path,
    language: &str,
) -> Result<String> {
    let audio_bytes = std::fs::read(audio_path)
        .with_context(|| format!("failed to read audio file {}", audio_path.display()))?;

    let file_name = audio_path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("audio.wav")
        .to_string();

    let base_url = settings.whisper_base_path.trim_end_matches('/');
    let url = format!("{}/asr", base_url);

    let language = if language.is_empty() { "auto" } else { language };
    let initial_prompt = if settings.initial_prompt.trim().is_empty() {
        DEFAULT_INITIAL_PROMPT
    } else {
        settings.initial_prompt.as_str()
    };

    debug!(
        "Starting transcription of {} ({} bytes) at {} (language: {})",
        file_name,
        audio_bytes.len(),
        url,
        language
    );

    let client = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(REQUEST_TIMEOUT)
        .build()
        .context("failed to build HTTP client")?;

    let audio_part = Part::bytes(audio_bytes)
        .file_name(file_name)
        .mime_str("audio/wav")
        .context("failed to create audio part")?;

    let form = Form::new().part("audio_file", audio_part);

    let response = client
        .post(&url)
        .query(&[
            ("task", "transcribe"),
            ("language", language),
            ("output", "json"),
            ("word_timestamps", "true"),
            ("initial_prompt", initial_prompt),
        ])
        .multipart(form)
        .send()
        .await
        .context("transcription request failed")?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Failed to read error response".to_string());
        return Err(anyhow!(
            "transcription failed with status {}: {}",
            status,
            error_text
        ));
    }

    let parsed: AsrResponse = response
        .json()
        .await
        .context("failed to parse transcription response")?;

    let transcript = segments_to_transcript(&parsed);
    debug!("Transcription completed, {} chars", transcript.len());
    Ok(transcript)
}

fn segments_to_transcript(response: &AsrResponse) -> String {
    if response.segments.is_empty() {
        return response.text.clone().unwrap_or_default().trim().to_string();
    }

    response
        .segments
        .iter()
        .map(|segment| format!("[{}] {}", format_clock(segment.start), segment.text.trim()))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Seconds to a zero-padded `HH:MM:SS` clock. Hours do not wrap, so a
/// marathon recording keeps monotonic timestamps.
fn format_clock(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    format!(
        "{:02}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_clock() {
        assert_eq!(format_clock(0.0), "00:00:00");
        assert_eq!(format_clock(9.9), "00:00:09");
        assert_eq!(format_clock(80.0), "00:01:20");
        assert_eq!(format_clock(3723.0), "01:02:03");
        assert_eq!(format_clock(-5.0), "00:00:00");
        // Hours keep counting past a day.
        assert_eq!(format_clock(90_000.0), "25:00:00");
    }

    #[test]
    fn test_segments_become_timestamped_lines() {
        let response = AsrResponse {
            segments: vec![
                AsrSegment {
                    start: 0.4,
                    text: " Hello everyone.".to_string(),
                },
                AsrSegment {
                    start: 12.0,
                    text: " Let's get started.".to_string(),
                },
            ],
            text: None,
        };
        assert_eq!(
            segments_to_transcript(&response),
            "[00:00:00] Hello everyone.\n[00:00:12] Let's get started."
        );
    }

    #[test]
    fn test_empty_segments_fall_back_to_text_body() {
        let response = AsrResponse {
            segments: vec![],
            text: Some("  plain text \n".to_string()),
        };
        assert_eq!(segments_to_transcript(&response), "plain text");

        let empty = AsrResponse {
            segments: vec![],
            text: None,
        };
        assert_eq!(segments_to_transcript(&empty), "");
    }
}
