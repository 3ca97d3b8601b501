//! Applying workspace edits to the filesystem.
//!
//! The broker is the side that owns the disk: edits arriving through
//! `workspace/applyEdit`, produced by the edit composer, or returned from
//! a rename all funnel through [`apply_workspace_edit`].

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::protocol::{DocumentChange, TextEdit, WorkspaceEdit};

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("not a file URI: {0}")]
    InvalidUri(String),
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_err(path: &Path, source: std::io::Error) -> ApplyError {
    ApplyError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn uri_to_path(uri: &str) -> Result<PathBuf, ApplyError> {
    crate::protocol::file_uri_to_path(uri).ok_or_else(|| ApplyError::InvalidUri(uri.to_string()))
}

/// Apply every change in the edit to disk.
///
/// `changes` entries are applied per file; `documentChanges` entries are
/// decoded lazily and may be text edits or create/rename/delete file
/// operations. Entries that decode to no known shape are logged and
/// skipped.
pub fn apply_workspace_edit(edit: &WorkspaceEdit) -> Result<(), ApplyError> {
    if let Some(changes) = &edit.changes {
        for (uri, edits) in changes {
            let path = uri_to_path(uri)?;
            apply_text_edits_to_file(&path, edits)?;
        }
    }

    if let Some(document_changes) = &edit.document_changes {
        for raw in document_changes {
            apply_document_change(raw)?;
        }
    }

    Ok(())
}

fn apply_document_change(raw: &Value) -> Result<(), ApplyError> {
    let Some(change) = DocumentChange::from_value(raw) else {
        tracing::warn!("skipping unrecognized document change");
        return Ok(());
    };

    match change {
        DocumentChange::Edit(doc_edit) => {
            let path = uri_to_path(&doc_edit.text_document.uri)?;
            apply_text_edits_to_file(&path, &doc_edit.text_edits())
        }
        DocumentChange::Create(create) => {
            let path = uri_to_path(&create.uri)?;
            let options = create.options.unwrap_or_default();
            if path.exists() && !options.overwrite {
                if !options.ignore_if_exists {
                    tracing::warn!(path = %path.display(), "create skipped, file exists");
                }
                return Ok(());
            }
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
            }
            fs::write(&path, "").map_err(|e| io_err(&path, e))
        }
        DocumentChange::Rename(rename) => {
            let from = uri_to_path(&rename.old_uri)?;
            let to = uri_to_path(&rename.new_uri)?;
            let options = rename.options.unwrap_or_default();
            if to.exists() && !options.overwrite {
                tracing::warn!(path = %to.display(), "rename skipped, target exists");
                return Ok(());
            }
            fs::rename(&from, &to).map_err(|e| io_err(&from, e))
        }
        DocumentChange::Delete(delete) => {
            let path = uri_to_path(&delete.uri)?;
            match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::warn!(path = %path.display(), "delete skipped, file missing");
                    Ok(())
                }
                Err(e) => Err(io_err(&path, e)),
            }
        }
    }
}

/// Apply a batch of text edits to one file.
///
/// Edits are applied bottom-up (sorted descending by start position) so a
/// splice never shifts the positions of edits still to come.
pub fn apply_text_edits_to_file(path: &Path, edits: &[TextEdit]) -> Result<(), ApplyError> {
    if edits.is_empty() {
        return Ok(());
    }

    let mut content = fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    let eol = detect_eol(&content);

    let mut ordered: Vec<&TextEdit> = edits.iter().collect();
    ordered.sort_by(|a, b| {
        (b.range.start.line, b.range.start.character)
            .cmp(&(a.range.start.line, a.range.start.character))
    });

    for edit in ordered {
        splice(&mut content, eol, edit);
    }

    fs::write(path, &content).map_err(|e| io_err(path, e))
}

fn detect_eol(content: &str) -> &'static str {
    if content.contains("\r\n") { "\r\n" } else { "\n" }
}

/// Apply one edit to `content` in place.
///
/// Positions address (line, byte-within-line). A whole-line edit with
/// empty replacement text also consumes the adjoining line terminator —
/// the one after the range, or the one before it when the range ends the
/// file — so deleting a line deletes the line, not just its characters.
fn splice(content: &mut String, eol: &str, edit: &TextEdit) {
    let lines: Vec<&str> = content.split(eol).collect();

    let line_start = |idx: usize| -> usize {
        lines[..idx.min(lines.len())]
            .iter()
            .map(|l| l.len() + eol.len())
            .sum()
    };
    let line_len = |idx: usize| -> usize { lines.get(idx).map_or(0, |l| l.len()) };

    let offset_of = |line: u32, character: u32| -> usize {
        let line = line as usize;
        if line >= lines.len() {
            return content.len();
        }
        line_start(line) + (character as usize).min(line_len(line))
    };

    // Column offsets may come from servers counting UTF-16 units; snap
    // down to a character boundary rather than panic on a split char.
    let floor_boundary = |mut off: usize| {
        while off > 0 && !content.is_char_boundary(off) {
            off -= 1;
        }
        off
    };

    let mut start = floor_boundary(offset_of(edit.range.start.line, edit.range.start.character));
    let mut end = floor_boundary(offset_of(edit.range.end.line, edit.range.end.character));
    if end < start {
        end = start;
    }

    let whole_lines = edit.new_text.is_empty()
        && edit.range.start.character == 0
        && (edit.range.end.character as usize) >= line_len(edit.range.end.line as usize)
        && start < end;
    if whole_lines {
        if content[end..].starts_with(eol) {
            end += eol.len();
        } else if content[..start].ends_with(eol) {
            start -= eol.len();
        }
    }

    content.replace_range(start..end, &edit.new_text);
}
