//! Edit batches and their application to a document snapshot.

use serde::{Deserialize, Serialize};

use crate::position::{byte_index, offset_at, utf16_len};

/// An editor range, 1-based and end-exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Range {
    pub start_line_number: u32,
    pub start_column: u32,
    pub end_line_number: u32,
    pub end_column: u32,
}

/// One replacement inside an edit batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub range: Range,
    #[serde(default)]
    pub text: String,
}

impl Change {
    pub fn new(start: (u32, u32), end: (u32, u32), text: impl Into<String>) -> Self {
        Self {
            range: Range {
                start_line_number: start.0,
                start_column: start.1,
                end_line_number: end.0,
                end_column: end.1,
            },
            text: text.into(),
        }
    }
}

/// A change resolved against a concrete snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Splice<'a> {
    start: usize,
    end: usize,
    text: &'a str,
}

/// Applies `changes` to `text` and returns the new document.
///
/// All ranges resolve against the unmodified text and are applied from the
/// rightmost start offset to the leftmost, so no splice shifts a later one.
/// Out-of-range and inverted ranges are clamped rather than rejected.
pub fn apply(text: &str, changes: &[Change]) -> String {
    let len = utf16_len(text);
    let mut splices: Vec<Splice<'_>> = changes
        .iter()
        .map(|change| {
            let r = change.range;
            let a = offset_at(text, r.start_line_number, r.start_column).min(len);
            let b = offset_at(text, r.end_line_number, r.end_column).min(len);
            Splice {
                start: a.min(b),
                end: a.max(b),
                text: &change.text,
            }
        })
        .collect();

    // Stable sort keeps batch order for equal starts; reversing it makes the
    // later change land first.
    splices.sort_by_key(|s| s.start);
    splices.reverse();

    let mut out = text.to_string();
    for splice in splices {
        let current = utf16_len(&out);
        let start = splice.start.min(current);
        let end = splice.end.clamp(start, current);
        let from = byte_index(&out, start);
        let to = byte_index(&out, end);
        out.replace_range(from..to, splice.text);
    }
    out
}
