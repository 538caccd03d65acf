//! Line-oriented transcript codec.
//!
//! The flat wire format is one utterance per line:
//! `[HH:MM:SS] [speaker] content`. Whisper output arrives without the
//! speaker tag (`[HH:MM:SS] text`); tags are added later by the LLM
//! review pass or by manual editing, so the parser has to accept both
//! shapes plus whatever a model or a human leaves behind.
//!
//! Parsing never fails: a line without a leading clock token keeps its
//! text and gets `00:00:00`, a bare `[]` means "speaker unknown", and
//! stray duplicate `[tag]` prefixes are dropped.

use serde::{Deserialize, Serialize};

/// Timestamp given to rows whose line carries no parseable clock token.
pub const DEFAULT_TIMESTAMP: &str = "00:00:00";

/// One utterance: a clock timestamp, who spoke, and what was said.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptRow {
    pub timestamp: String,
    pub speaker: String,
    pub content: String,
}

/// A parsed transcript: structured rows plus the raw line array they
/// came from.
///
/// Both are kept because edits are line-local: changing one row
/// re-serializes only its own line, everything else (including blank
/// lines, which produce no row but stay in `lines`) is carried through
/// verbatim when the full text is rebuilt.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    rows: Vec<TranscriptRow>,
    lines: Vec<String>,
}

impl Transcript {
    /// Parse a flat transcript into structured rows.
    ///
    /// Blank and whitespace-only lines yield no row but are preserved
    /// in the raw line array. Row order equals line order.
    pub fn parse(text: &str) -> Self {
        let lines: Vec<String> = text.split('\n').map(str::to_string).collect();
        let rows = lines
            .iter()
            .filter(|line| !line.trim().is_empty())
            .map(|line| parse_line(line))
            .collect();
        Self { rows, lines }
    }

    pub fn rows(&self) -> &[TranscriptRow] {
        &self.rows
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The flat text form: the raw lines rejoined with `\n`.
    pub fn full_text(&self) -> String {
        self.lines.join("\n")
    }

    /// Replace speaker and content of the row at `index`, keeping its
    /// timestamp, and re-serialize that line only. Returns the rebuilt
    /// full text, or `None` when the index is out of range.
    ///
    /// No other row or line is touched.
    pub fn update_row(&mut self, index: usize, speaker: &str, content: &str) -> Option<String> {
        let row = self.rows.get_mut(index)?;
        row.speaker = speaker.to_string();
        row.content = content.to_string();
        self.lines[index] = serialize_row(&row.timestamp, speaker, content);
        Some(self.full_text())
    }

    /// Distinct non-empty speaker names in first-seen order. Used as
    /// autocomplete suggestions, not as a source of truth.
    pub fn distinct_speakers(&self) -> Vec<String> {
        let mut seen: Vec<String> = Vec::new();
        for row in &self.rows {
            if !row.speaker.is_empty() && !seen.contains(&row.speaker) {
                seen.push(row.speaker.clone());
            }
        }
        seen
    }

    /// The audio window `[start, end)` in seconds covered by the row at
    /// `index`: its own timestamp up to the next line that still carries
    /// a leading clock token, or the total audio duration when no later
    /// line has one. An unknown duration leaves the window open-ended
    /// so playback simply runs on.
    ///
    /// Returns `None` when `index` is out of range.
    pub fn segment_window(
        &self,
        index: usize,
        total_duration_secs: Option<u32>,
    ) -> Option<(u32, Option<u32>)> {
        let row = self.rows.get(index)?;
        let start = clock_to_seconds(&row.timestamp);

        let mut end = total_duration_secs;
        for line in self.lines.iter().skip(index + 1) {
            if let Some((token, _)) = take_clock_token(line) {
                end = Some(clock_to_seconds(token));
                break;
            }
        }

        Some((start, end))
    }
}

/// Canonical line form for one row: `[HH:MM:SS] [speaker] content`.
///
/// The speaker brackets are emitted even when the name is empty; `[]`
/// is the marker `parse` reads back as "no speaker".
pub fn serialize_row(timestamp: &str, speaker: &str, content: &str) -> String {
    format!("[{}] [{}] {}", timestamp, speaker, content)
        .trim()
        .to_string()
}

/// Serialize rows into the flat text form, one line per row.
pub fn serialize(rows: &[TranscriptRow]) -> String {
    rows.iter()
        .map(|row| serialize_row(&row.timestamp, &row.speaker, &row.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// `HH:MM:SS` to total seconds. Malformed components count as zero.
pub fn clock_to_seconds(token: &str) -> u32 {
    token
        .split(':')
        .map(|part| part.parse::<u32>().unwrap_or(0))
        .fold(0, |total, part| total * 60 + part)
}

fn parse_line(line: &str) -> TranscriptRow {
    let (timestamp, rest) = match take_clock_token(line) {
        Some((token, rest)) => (token.to_string(), rest),
        None => (DEFAULT_TIMESTAMP.to_string(), line),
    };

    let mut rest = rest;
    let mut speaker = String::new();
    if let Some((tag, after)) = take_bracketed(rest) {
        speaker = tag.trim().to_string();
        rest = after;
        // Anything else bracketed at the head of the line is a stray
        // duplicate speaker tag, not content. Drop it.
        while let Some((_, after)) = take_bracketed(rest) {
            rest = after;
        }
    }

    TranscriptRow {
        timestamp,
        speaker,
        content: rest.trim().to_string(),
    }
}

/// Consume a leading `[HH:MM:SS]` token, tolerating surrounding
/// whitespace. Returns the clock text and the remainder of the line.
fn take_clock_token(line: &str) -> Option<(&str, &str)> {
    let inner = line.trim_start().strip_prefix('[')?;
    let bytes = inner.as_bytes();
    // Validate on bytes before slicing; a clock token is pure ASCII, so
    // the byte offsets are char boundaries once this passes.
    if bytes.len() < 9 || bytes[8] != b']' || !is_clock_token(&bytes[..8]) {
        return None;
    }
    Some((&inner[..8], inner[9..].trim_start()))
}

/// Consume one leading `[...]` token (interior may be empty but may not
/// contain `]`), tolerating surrounding whitespace.
fn take_bracketed(line: &str) -> Option<(&str, &str)> {
    let inner = line.trim_start().strip_prefix('[')?;
    let end = inner.find(']')?;
    Some((&inner[..end], inner[end + 1..].trim_start()))
}

/// Exactly `dd:dd:dd`. Hours are two digits but otherwise unbounded.
fn is_clock_token(bytes: &[u8]) -> bool {
    bytes.len() == 8
        && bytes[2] == b':'
        && bytes[5] == b':'
        && [0, 1, 3, 4, 6, 7]
            .iter()
            .all(|&i| bytes[i].is_ascii_digit())
}
