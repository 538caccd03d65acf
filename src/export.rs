//! CSV export of parsed transcript rows.

use crate::transcript::TranscriptRow;

const HEADER: &str = "Timestamp,Speaker,Content";

/// Render rows as a CSV document, one record per row. Fields containing
/// the delimiter, quotes or line breaks are quoted with embedded quotes
/// doubled.
pub fn transcript_to_csv(rows: &[TranscriptRow]) -> String {
    let mut out = String::from(HEADER);
    out.push_str("\r\n");
    for row in rows {
        out.push_str(&csv_field(&row.timestamp));
        out.push(',');
        out.push_str(&csv_field(&row.speaker));
        out.push(',');
        out.push_str(&csv_field(&row.content));
        out.push_str("\r\n");
    }
    out
}

/// Attachment file name for an exported transcript. Characters that are
/// unsafe in file names or HTTP headers are replaced.
pub fn export_file_name(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '\n' | '\r' => '_',
            other => other,
        })
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        "meeting.csv".to_string()
    } else {
        format!("{}.csv", cleaned)
    }
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
