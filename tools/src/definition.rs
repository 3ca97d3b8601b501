//! The `read_definition` tool: locate a symbol by exact name and return
//! the source of its full definition.

use std::path::Path;

use polyglot_lsp::Session;
use polyglot_lsp::protocol::{
    self, DocumentSymbol, DocumentSymbolResponse, Location, Position, Range,
    workspace_symbols_from_value,
};
use serde_json::json;

use crate::{ToolError, add_line_numbers};

const BANNER: &str = "================================================================================";

/// Find symbols named exactly `symbol_name` via the session's workspace
/// index and print each definition's source.
pub async fn read_definition(
    session: &Session,
    symbol_name: &str,
    show_line_numbers: bool,
) -> Result<String, ToolError> {
    let result = session
        .request("workspace/symbol", Some(json!({ "query": symbol_name })))
        .await?;
    let symbols = workspace_symbols_from_value(result)
        .ok_or_else(|| ToolError::UnexpectedResponse("workspace/symbol result".to_string()))?;

    let mut definitions = Vec::new();
    for symbol in symbols.iter().filter(|s| s.name == symbol_name) {
        match render_definition(session, symbol_name, &symbol.location, show_line_numbers).await {
            Ok(text) => definitions.push(text),
            Err(e) => {
                tracing::warn!(symbol = %symbol_name, "skipping definition: {e}");
            }
        }
    }

    if definitions.is_empty() {
        return Ok(format!("{symbol_name} not found"));
    }
    Ok(definitions.join("\n"))
}

async fn render_definition(
    session: &Session,
    symbol_name: &str,
    location: &Location,
    show_line_numbers: bool,
) -> Result<String, ToolError> {
    let path = protocol::file_uri_to_path(&location.uri)
        .ok_or_else(|| ToolError::UnexpectedResponse(format!("non-file URI {}", location.uri)))?;

    let range = full_definition_range(session, &path, &location.uri, location.range).await;
    let source = read_range(&path, range)?;
    let source = if show_line_numbers {
        add_line_numbers(&source, range.start.line + 1)
    } else {
        source
    };

    Ok(format!(
        "{BANNER}\nSymbol: {symbol_name}\nFile: {}\nStart Position: Line {}, Column {}\nEnd Position: Line {}, Column {}\n{BANNER}\n{source}\n",
        path.display(),
        range.start.line + 1,
        range.start.character + 1,
        range.end.line + 1,
        range.end.character + 1,
    ))
}

/// The workspace index reports where the symbol's *name* is; the full
/// definition is the enclosing document symbol's range. Falls back to the
/// reported range when document symbols are unavailable.
async fn full_definition_range(
    session: &Session,
    path: &Path,
    uri: &str,
    reported: Range,
) -> Range {
    if session.open_file(path).await.is_err() {
        return reported;
    }
    let Ok(result) = session
        .request(
            "textDocument/documentSymbol",
            Some(protocol::text_document_params(uri)),
        )
        .await
    else {
        return reported;
    };

    match DocumentSymbolResponse::from_value(result) {
        Some(DocumentSymbolResponse::Nested(symbols)) => {
            deepest_enclosing(&symbols, reported.start).unwrap_or(reported)
        }
        _ => reported,
    }
}

/// Depth-first search for the innermost document symbol whose selection
/// range contains `position`; its full range is the definition body.
pub(crate) fn deepest_enclosing(symbols: &[DocumentSymbol], position: Position) -> Option<Range> {
    for symbol in symbols {
        if let Some(nested) = deepest_enclosing(&symbol.children, position) {
            return Some(nested);
        }
        if contains(symbol.selection_range, position) {
            return Some(symbol.range);
        }
    }
    None
}

fn contains(range: Range, position: Position) -> bool {
    let after_start = position.line > range.start.line
        || (position.line == range.start.line && position.character >= range.start.character);
    let before_end = position.line < range.end.line
        || (position.line == range.end.line && position.character <= range.end.character);
    after_start && before_end
}

fn read_range(path: &Path, range: Range) -> Result<String, ToolError> {
    let content = std::fs::read_to_string(path).map_err(|source| ToolError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let lines: Vec<&str> = content.lines().collect();
    if lines.is_empty() {
        return Ok(String::new());
    }
    let first = (range.start.line as usize).min(lines.len() - 1);
    let last = (range.end.line as usize).min(lines.len() - 1);
    Ok(lines[first..=last.max(first)].join("\n"))
}
