//! The `rename_symbol` tool: ask the server for the rename edit, apply it
//! to disk, and summarize what changed.

use std::collections::BTreeMap;
use std::path::Path;

use polyglot_lsp::Session;
use polyglot_lsp::apply;
use polyglot_lsp::protocol::{self, DocumentChange, WorkspaceEdit};
use serde_json::json;

use crate::{ToolError, absolutize};

/// Rename the symbol at a 0-based (line, character) position across the
/// workspace. The server computes the workspace edit; the broker applies
/// it.
pub async fn rename_symbol(
    session: &Session,
    file_path: &Path,
    line: u32,
    character: u32,
    new_name: &str,
) -> Result<String, ToolError> {
    if new_name.is_empty() {
        return Err(ToolError::InvalidArgument("newName must not be empty".to_string()));
    }

    let path = absolutize(file_path)?;
    session.open_file(&path).await?;

    let uri = protocol::path_to_file_uri(&path)
        .map_err(polyglot_lsp::SessionError::from)?
        .to_string();
    let result = session
        .request(
            "textDocument/rename",
            Some(json!({
                "textDocument": { "uri": uri },
                "position": { "line": line, "character": character },
                "newName": new_name
            })),
        )
        .await?;

    if result.is_null() {
        return Ok(format!("Rename to '{new_name}' produced no changes."));
    }

    let edit: WorkspaceEdit = serde_json::from_value(result)
        .map_err(|e| ToolError::UnexpectedResponse(format!("rename result: {e}")))?;

    let per_file = count_edits(&edit);
    if per_file.is_empty() {
        return Ok(format!("Rename to '{new_name}' produced no changes."));
    }

    apply::apply_workspace_edit(&edit)?;

    let total: usize = per_file.values().sum();
    let mut summary = format!(
        "Renamed symbol to '{new_name}': {total} edit(s) across {} file(s).",
        per_file.len()
    );
    for (file, count) in &per_file {
        summary.push_str(&format!("\n  {file}: {count} edit(s)"));
    }
    Ok(summary)
}

/// Edit counts per file, across both the `changes` map and decodable
/// `documentChanges` entries. Sorted by file path for stable output.
pub(crate) fn count_edits(edit: &WorkspaceEdit) -> BTreeMap<String, usize> {
    let mut per_file = BTreeMap::new();

    let display = |uri: &str| {
        protocol::file_uri_to_path(uri)
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| uri.to_string())
    };

    if let Some(changes) = &edit.changes {
        for (uri, edits) in changes {
            if !edits.is_empty() {
                *per_file.entry(display(uri)).or_insert(0) += edits.len();
            }
        }
    }

    for raw in edit.document_changes.as_deref().unwrap_or_default() {
        match DocumentChange::from_value(raw) {
            Some(DocumentChange::Edit(doc_edit)) => {
                let count = doc_edit.text_edits().len();
                if count > 0 {
                    *per_file.entry(display(&doc_edit.text_document.uri)).or_insert(0) += count;
                }
            }
            Some(DocumentChange::Create(c)) => {
                *per_file.entry(display(&c.uri)).or_insert(0) += 1;
            }
            Some(DocumentChange::Rename(r)) => {
                *per_file.entry(display(&r.old_uri)).or_insert(0) += 1;
            }
            Some(DocumentChange::Delete(d)) => {
                *per_file.entry(display(&d.uri)).or_insert(0) += 1;
            }
            None => tracing::warn!("unrecognized document change in rename result"),
        }
    }

    per_file
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn counts_cover_changes_and_document_changes() {
        let edit: WorkspaceEdit = serde_json::from_value(json!({
            "changes": {
                "file:///w/a.go": [
                    {"range": {"start": {"line": 0, "character": 0}, "end": {"line": 0, "character": 3}}, "newText": "x"},
                    {"range": {"start": {"line": 5, "character": 0}, "end": {"line": 5, "character": 3}}, "newText": "x"}
                ]
            },
            "documentChanges": [{
                "textDocument": {"uri": "file:///w/b.go", "version": 3},
                "edits": [
                    {"range": {"start": {"line": 1, "character": 0}, "end": {"line": 1, "character": 3}}, "newText": "x"}
                ]
            }]
        }))
        .unwrap();

        let counts = count_edits(&edit);
        assert_eq!(counts.get("/w/a.go"), Some(&2));
        assert_eq!(counts.get("/w/b.go"), Some(&1));
    }

    #[test]
    fn empty_edit_counts_nothing() {
        let edit = WorkspaceEdit::default();
        assert!(count_edits(&edit).is_empty());
    }
}
