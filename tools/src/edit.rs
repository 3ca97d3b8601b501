//! Batch text editing on top of LSP primitives.
//!
//! Callers submit line-range edit descriptors; the composer turns them
//! into position-range wire edits against the file as it is on disk,
//! guards bracket balance when asked to, and applies everything as one
//! workspace edit.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use polyglot_lsp::apply;
use polyglot_lsp::protocol::{self, Position, Range, TextEdit, WorkspaceEdit};

use crate::bracket;
use crate::{FileOpener, ToolError, absolutize};

/// What a descriptor does to its line range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EditKind {
    Replace,
    Insert,
    Delete,
}

/// One line-range edit in a batch.
///
/// Lines are 1-based and inclusive on both ends. `new_text` belongs to
/// non-regex replace/insert; the regex fields belong together and exclude
/// `new_text`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextEditOp {
    #[serde(rename = "type")]
    pub kind: EditKind,
    pub start_line: u32,
    pub end_line: u32,
    #[serde(default)]
    pub new_text: String,
    #[serde(default)]
    pub is_regex: bool,
    #[serde(default)]
    pub regex_pattern: String,
    #[serde(default)]
    pub regex_replace: String,
    #[serde(default)]
    pub preserve_brackets: bool,
    #[serde(default)]
    pub bracket_types: Vec<String>,
}

/// Apply a batch of edits to one file through the owning session.
///
/// Descriptors are processed bottom-up (sorted by start line, descending)
/// so earlier line numbers stay valid while later ones are edited. All
/// resulting wire edits target the file's URI in a single workspace edit.
pub async fn apply_text_edits<O: FileOpener>(
    opener: &O,
    file_path: &Path,
    mut edits: Vec<TextEditOp>,
) -> Result<String, ToolError> {
    let path = absolutize(file_path)?;
    opener.open_file(&path).await?;

    edits.sort_by(|a, b| b.start_line.cmp(&a.start_line));

    let content = std::fs::read_to_string(&path).map_err(|source| ToolError::Io {
        path: path.clone(),
        source,
    })?;

    let mut wire_edits = Vec::with_capacity(edits.len());
    for edit in &edits {
        if edit.is_regex && !edit.new_text.is_empty() {
            return Err(ToolError::InvalidArgument(format!(
                "edit at line {}: cannot combine isRegex with non-empty newText",
                edit.start_line
            )));
        }

        let range = compute_range(edit.start_line, edit.end_line, &content)?;

        if edit.preserve_brackets {
            bracket::check_bracket_balance(&content, edit)?;
        }

        if edit.is_regex && edit.kind == EditKind::Replace {
            wire_edits.push(regex_replace_edit(edit, range, &content)?);
            continue;
        }

        let wire = match edit.kind {
            EditKind::Insert => TextEdit {
                // Zero-width range at the start position.
                range: Range {
                    start: range.start,
                    end: range.start,
                },
                new_text: edit.new_text.clone(),
            },
            EditKind::Delete => TextEdit {
                range,
                new_text: String::new(),
            },
            EditKind::Replace => TextEdit {
                range,
                new_text: edit.new_text.clone(),
            },
        };
        wire_edits.push(wire);
    }

    let uri = protocol::path_to_file_uri(&path)
        .map_err(polyglot_lsp::SessionError::from)?
        .to_string();
    let mut changes = HashMap::new();
    changes.insert(uri, wire_edits);
    apply::apply_workspace_edit(&WorkspaceEdit {
        changes: Some(changes),
        document_changes: None,
    })?;

    Ok(
        "Successfully applied text edits.\nWARNING: line numbers may have changed. Re-read code \
         before applying additional edits."
            .to_string(),
    )
}

/// Resolve a 1-based inclusive line range against the file content.
///
/// A start line beyond the file collapses to a zero-width position at the
/// end of the last non-empty line (end-of-file insertion); otherwise the
/// range runs from column 0 of the start line to the end of the
/// (clamped) end line.
fn compute_range(start_line: u32, end_line: u32, content: &str) -> Result<Range, ToolError> {
    if start_line < 1 {
        return Err(ToolError::InvalidArgument(format!(
            "start line must be >= 1, got {start_line}"
        )));
    }
    if end_line < start_line {
        return Err(ToolError::InvalidArgument(format!(
            "end line {end_line} precedes start line {start_line}"
        )));
    }

    let eol = if content.contains("\r\n") { "\r\n" } else { "\n" };
    let lines: Vec<&str> = content.split(eol).collect();

    let start_idx = (start_line - 1) as usize;
    if start_idx >= lines.len() {
        let mut last = lines.len().saturating_sub(1);
        if last > 0 && lines[last].is_empty() {
            last -= 1;
        }
        let at_end = Position {
            line: last as u32,
            character: lines[last].len() as u32,
        };
        return Ok(Range {
            start: at_end,
            end: at_end,
        });
    }

    let end_idx = ((end_line - 1) as usize).min(lines.len() - 1);
    Ok(Range {
        start: Position {
            line: start_idx as u32,
            character: 0,
        },
        end: Position {
            line: end_idx as u32,
            character: lines[end_idx].len() as u32,
        },
    })
}

/// Build the wire edit for a regex replace descriptor: run the pattern
/// over the joined content of the selected lines and replace the whole
/// range with the result. Capture groups are referenced as `$1`, `$2`, …
fn regex_replace_edit(
    edit: &TextEditOp,
    range: Range,
    content: &str,
) -> Result<TextEdit, ToolError> {
    if edit.regex_pattern.is_empty() {
        return Err(ToolError::InvalidArgument(format!(
            "edit at line {}: regex pattern cannot be empty when isRegex is set",
            edit.start_line
        )));
    }

    let eol = if content.contains("\r\n") { "\r\n" } else { "\n" };
    let lines: Vec<&str> = content.split(eol).collect();

    let start_idx = (edit.start_line.saturating_sub(1)) as usize;
    let end_idx = ((edit.end_line.saturating_sub(1)) as usize).min(lines.len().saturating_sub(1));
    if start_idx > end_idx || start_idx >= lines.len() {
        return Err(ToolError::InvalidArgument(format!(
            "invalid range for regex replace: lines {}-{}",
            edit.start_line, edit.end_line
        )));
    }

    let selected = lines[start_idx..=end_idx].join(eol);

    let pattern = regex::Regex::new(&edit.regex_pattern).map_err(|e| {
        ToolError::InvalidArgument(format!(
            "invalid regex pattern {:?} for edit at line {}: {e}",
            edit.regex_pattern, edit.start_line
        ))
    })?;
    let replaced = pattern
        .replace_all(&selected, edit.regex_replace.as_str())
        .into_owned();

    Ok(TextEdit {
        range,
        new_text: replaced,
    })
}
