//! Full-content reconstruction for `textDocument/didChange`.
//!
//! spec.md §4.5 mandates full-document sync to the analyzer regardless of
//! what the client actually sent: a client may emit a single full-text
//! replacement, or a sequence of incremental `{range, rangeLength, text}`
//! edits. Either way the analyzer is always handed one `{text: <full>}`
//! change, built here by folding every `contentChanges` entry onto the
//! document's last known full text.

use serde_json::Value;

use crate::error::ProxyError;

/// Fold an ordered `contentChanges` array onto `base`, returning the
/// resulting full document text. An entry with no `range` is itself a
/// full-document replacement; an entry with a `range`
/// (`{start: {line, character}, end: {line, character}}`, both measured in
/// UTF-16 code units per the LSP base protocol) is spliced into the text
/// accumulated so far.
pub fn apply_content_changes(base: &str, changes: &[Value]) -> Result<String, ProxyError> {
    let mut text = base.to_string();
    for change in changes {
        let new_text = change["text"]
            .as_str()
            .ok_or_else(|| ProxyError::Protocol("contentChanges entry missing text".to_string()))?;
        text = match change.get("range") {
            None => new_text.to_string(),
            Some(range) => apply_range_edit(&text, range, new_text)?,
        };
    }
    Ok(text)
}

fn apply_range_edit(text: &str, range: &Value, new_text: &str) -> Result<String, ProxyError> {
    let start = position_to_offset(text, &range["start"])?;
    let end = position_to_offset(text, &range["end"])?;
    if start > end || end > text.len() {
        return Err(ProxyError::Protocol(
            "contentChanges range is out of bounds".to_string(),
        ));
    }
    let mut result = String::with_capacity(text.len() - (end - start) + new_text.len());
    result.push_str(&text[..start]);
    result.push_str(new_text);
    result.push_str(&text[end..]);
    Ok(result)
}

/// Convert an LSP `{line, character}` position (0-based line, `character` a
/// UTF-16 code unit offset into that line) into a byte offset into `text`.
fn position_to_offset(text: &str, position: &Value) -> Result<usize, ProxyError> {
    let line = position["line"]
        .as_u64()
        .ok_or_else(|| ProxyError::Protocol("range position missing line".to_string()))? as usize;
    let character = position["character"]
        .as_u64()
        .ok_or_else(|| ProxyError::Protocol("range position missing character".to_string()))?
        as usize;

    let mut offset = 0usize;
    for (i, raw_line) in split_keeping_terminators(text).enumerate() {
        let terminator_len = raw_line.len() - raw_line.trim_end_matches(['\n', '\r']).len();
        let content = &raw_line[..raw_line.len() - terminator_len];
        if i == line {
            return Ok(offset + utf16_offset_to_byte_offset(content, character));
        }
        offset += raw_line.len();
    }
    // `line` is one past the end (e.g. an empty document) — clamp to EOF.
    Ok(text.len())
}

/// Split into lines, keeping each line's trailing terminator attached so the
/// byte offsets summed in `position_to_offset` land exactly.
fn split_keeping_terminators(text: &str) -> impl Iterator<Item = &str> {
    let mut rest = text;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        match rest.find('\n') {
            Some(idx) => {
                let (line, tail) = rest.split_at(idx + 1);
                rest = tail;
                Some(line)
            }
            None => {
                let line = rest;
                rest = "";
                Some(line)
            }
        }
    })
}

/// Map a UTF-16 code unit offset within one line to a byte offset, clamping
/// to the line's length if `utf16_offset` runs past the end.
fn utf16_offset_to_byte_offset(line: &str, utf16_offset: usize) -> usize {
    let mut utf16_units = 0usize;
    for (byte_idx, ch) in line.char_indices() {
        if utf16_units >= utf16_offset {
            return byte_idx;
        }
        utf16_units += ch.len_utf16();
    }
    line.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn no_range_is_a_full_replacement() {
        let changes = vec![json!({ "text": "new full text" })];
        assert_eq!(apply_content_changes("old text", &changes).unwrap(), "new full text");
    }

    #[test]
    fn single_line_incremental_insert() {
        let base = "hello world";
        let changes = vec![json!({
            "range": { "start": {"line": 0, "character": 5}, "end": {"line": 0, "character": 5} },
            "text": ","
        })];
        assert_eq!(apply_content_changes(base, &changes).unwrap(), "hello, world");
    }

    #[test]
    fn single_line_incremental_replace() {
        let base = "hello world";
        let changes = vec![json!({
            "range": { "start": {"line": 0, "character": 6}, "end": {"line": 0, "character": 11} },
            "text": "rust"
        })];
        assert_eq!(apply_content_changes(base, &changes).unwrap(), "hello rust");
    }

    #[test]
    fn multi_line_range_delete() {
        let base = "line one\nline two\nline three";
        let changes = vec![json!({
            "range": { "start": {"line": 0, "character": 4}, "end": {"line": 2, "character": 4} },
            "text": ""
        })];
        assert_eq!(apply_content_changes(base, &changes).unwrap(), "line three");
    }

    #[test]
    fn multiple_changes_apply_in_sequence() {
        let base = "abc";
        let changes = vec![
            json!({
                "range": { "start": {"line": 0, "character": 0}, "end": {"line": 0, "character": 0} },
                "text": "X"
            }),
            json!({
                "range": { "start": {"line": 0, "character": 4}, "end": {"line": 0, "character": 4} },
                "text": "Y"
            }),
        ];
        assert_eq!(apply_content_changes(base, &changes).unwrap(), "XabcY");
    }

    #[test]
    fn errors_on_missing_text() {
        let changes = vec![json!({ "range": { "start": {"line": 0, "character": 0}, "end": {"line": 0, "character": 0} } })];
        assert!(apply_content_changes("abc", &changes).is_err());
    }

    #[test]
    fn errors_on_inverted_range() {
        let changes = vec![json!({
            "range": { "start": {"line": 0, "character": 5}, "end": {"line": 0, "character": 2} },
            "text": "x"
        })];
        assert!(apply_content_changes("hello", &changes).is_err());
    }
}
