//! Line/column to absolute offset translation.
//!
//! Editor clients address text in UTF-16 code units, so every offset here is
//! a UTF-16 offset. A character outside the Basic Multilingual Plane counts
//! as two.

/// Converts a 1-based `line`/`column` pair into a 0-based UTF-16 offset into
/// `text`.
///
/// Positions past the end of a line clamp to that line's end, and lines past
/// the end of the document clamp to the end of the text.
pub fn offset_at(text: &str, line: u32, column: u32) -> usize {
    let line = line.max(1) as usize;
    let column = column.max(1) as usize;

    let mut offset = 0;
    for (index, content) in text.split('\n').enumerate() {
        let width = utf16_len(content);
        if index + 1 == line {
            return offset + (column - 1).min(width);
        }
        offset += width + 1;
    }

    // Every line was consumed; the trailing `+ 1` counted a newline that
    // does not exist.
    offset.saturating_sub(1)
}

/// Length of `text` in UTF-16 code units, the upper bound for any offset.
pub fn utf16_len(text: &str) -> usize {
    text.chars().map(char::len_utf16).sum()
}

/// Byte index of the UTF-16 offset `units` in `text`.
///
/// An offset that falls between the two halves of a surrogate pair snaps
/// back to the start of that character. Offsets past the end map to
/// `text.len()`.
pub fn byte_index(text: &str, units: usize) -> usize {
    let mut seen = 0;
    for (index, ch) in text.char_indices() {
        let next = seen + ch.len_utf16();
        if next > units {
            return index;
        }
        seen = next;
    }
    text.len()
}
