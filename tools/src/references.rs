//! The `find_references` tool: every place a named symbol is used.

use std::collections::BTreeMap;
use std::path::PathBuf;

use polyglot_lsp::Session;
use polyglot_lsp::protocol::{self, Location, workspace_symbols_from_value};
use serde_json::{Value, json};

use crate::ToolError;

/// Locate symbols named exactly `symbol_name`, then ask the server for
/// every reference to each (declaration included) and group them by file.
pub async fn find_references(
    session: &Session,
    symbol_name: &str,
    show_line_numbers: bool,
) -> Result<String, ToolError> {
    let result = session
        .request("workspace/symbol", Some(json!({ "query": symbol_name })))
        .await?;
    let symbols = workspace_symbols_from_value(result)
        .ok_or_else(|| ToolError::UnexpectedResponse("workspace/symbol result".to_string()))?;

    let mut locations = Vec::new();
    for symbol in symbols.iter().filter(|s| s.name == symbol_name) {
        let Some(path) = protocol::file_uri_to_path(&symbol.location.uri) else {
            continue;
        };
        if let Err(e) = session.open_file(&path).await {
            tracing::warn!(symbol = %symbol_name, "cannot open declaring file: {e}");
            continue;
        }

        let response = session
            .request(
                "textDocument/references",
                Some(json!({
                    "textDocument": { "uri": symbol.location.uri },
                    "position": {
                        "line": symbol.location.range.start.line,
                        "character": symbol.location.range.start.character
                    },
                    "context": { "includeDeclaration": true }
                })),
            )
            .await?;
        locations.extend(decode_locations(response)?);
    }

    Ok(format_references(symbol_name, &locations, show_line_numbers))
}

fn decode_locations(value: Value) -> Result<Vec<Location>, ToolError> {
    if value.is_null() {
        return Ok(Vec::new());
    }
    serde_json::from_value(value).map_err(|e| ToolError::UnexpectedResponse(e.to_string()))
}

/// Group locations per file (sorted by path, then line) and show the
/// referencing line from disk when it is readable.
pub(crate) fn format_references(
    symbol_name: &str,
    locations: &[Location],
    show_line_numbers: bool,
) -> String {
    if locations.is_empty() {
        return format!("No references found for {symbol_name}");
    }

    let mut by_file: BTreeMap<PathBuf, Vec<u32>> = BTreeMap::new();
    for location in locations {
        let Some(path) = protocol::file_uri_to_path(&location.uri) else {
            continue;
        };
        let lines = by_file.entry(path).or_default();
        let line = location.range.start.line;
        if !lines.contains(&line) {
            lines.push(line);
        }
    }

    let mut out = format!("References to '{symbol_name}':\n");
    for (path, mut lines) in by_file {
        lines.sort_unstable();
        out.push_str(&format!("\n{}:\n", path.display()));
        let content = std::fs::read_to_string(&path).unwrap_or_default();
        let file_lines: Vec<&str> = content.lines().collect();
        for line in lines {
            let text = file_lines.get(line as usize).copied().unwrap_or("").trim_end();
            if show_line_numbers {
                out.push_str(&format!("  L{}: {text}\n", line + 1));
            } else {
                out.push_str(&format!("  {text}\n"));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn location(uri: &str, line: u32) -> Location {
        serde_json::from_value(json!({
            "uri": uri,
            "range": {
                "start": {"line": line, "character": 0},
                "end": {"line": line, "character": 5}
            }
        }))
        .unwrap()
    }

    #[test]
    fn no_locations_reports_none() {
        assert_eq!(
            format_references("Missing", &[], true),
            "No references found for Missing"
        );
    }

    #[test]
    fn references_group_by_file_and_dedupe_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.go");
        std::fs::write(&path, "package main\nuse target\nmore target\n").unwrap();
        let uri = protocol::path_to_file_uri(&path).unwrap().to_string();

        let locations = vec![location(&uri, 2), location(&uri, 1), location(&uri, 1)];
        let out = format_references("target", &locations, true);

        assert!(out.contains(&format!("{}:", path.display())));
        assert!(out.contains("L2: use target"));
        assert!(out.contains("L3: more target"));
        // Duplicate line collapsed: exactly one L2 entry.
        assert_eq!(out.matches("L2:").count(), 1);
        // Sorted ascending: L2 before L3.
        assert!(out.find("L2:").unwrap() < out.find("L3:").unwrap());
    }

    #[test]
    fn unreadable_files_still_list_line_numbers() {
        let locations = vec![location("file:///nonexistent/z.go", 4)];
        let out = format_references("ghost", &locations, true);
        assert!(out.contains("/nonexistent/z.go"));
        assert!(out.contains("L5:"));
    }
}
