//! The `find_symbols` tool: workspace- or document-scoped symbol listings.

use std::path::Path;

use polyglot_lsp::Session;
use polyglot_lsp::protocol::{
    self, DocumentSymbol, DocumentSymbolResponse, SymbolInformation, symbol_kind_name,
    workspace_symbols_from_value,
};
use serde_json::json;

use crate::{ToolError, absolutize};

/// Search the workspace for symbols matching `query`, through whichever
/// Ready session the router picked.
pub async fn workspace_symbols(
    session: &Session,
    query: &str,
    show_line_numbers: bool,
) -> Result<String, ToolError> {
    let result = session
        .request("workspace/symbol", Some(json!({ "query": query })))
        .await?;
    let symbols = workspace_symbols_from_value(result)
        .ok_or_else(|| ToolError::UnexpectedResponse("workspace/symbol result".to_string()))?;

    if symbols.is_empty() {
        return Ok(format!("No symbols found matching '{query}'"));
    }
    Ok(symbols
        .iter()
        .map(|s| format_symbol_information(s, show_line_numbers))
        .collect::<Vec<_>>()
        .join("\n"))
}

/// List the symbols of one document, hierarchically when the server
/// supports it.
pub async fn document_symbols(
    session: &Session,
    file_path: &Path,
    show_line_numbers: bool,
) -> Result<String, ToolError> {
    let path = absolutize(file_path)?;
    session.open_file(&path).await?;

    let uri = protocol::path_to_file_uri(&path)
        .map_err(polyglot_lsp::SessionError::from)?
        .to_string();
    let result = session
        .request(
            "textDocument/documentSymbol",
            Some(protocol::text_document_params(&uri)),
        )
        .await?;

    let response = DocumentSymbolResponse::from_value(result)
        .ok_or_else(|| ToolError::UnexpectedResponse("documentSymbol result".to_string()))?;

    let listing = match response {
        DocumentSymbolResponse::Nested(symbols) => {
            let mut out = Vec::new();
            for symbol in &symbols {
                format_document_symbol(symbol, "", show_line_numbers, &mut out);
            }
            out
        }
        DocumentSymbolResponse::Flat(symbols) => symbols
            .iter()
            .map(|s| format_symbol_information(s, show_line_numbers))
            .collect(),
    };

    if listing.is_empty() {
        return Ok(format!("No symbols found in {}", path.display()));
    }
    Ok(listing.join("\n"))
}

/// `Kind: name (L3)` with children indented two spaces per level.
pub(crate) fn format_document_symbol(
    symbol: &DocumentSymbol,
    prefix: &str,
    show_line_numbers: bool,
    out: &mut Vec<String>,
) {
    let line = if show_line_numbers {
        format!(" (L{})", symbol.selection_range.start.line + 1)
    } else {
        String::new()
    };
    out.push(format!(
        "{prefix}{}: {}{line}",
        symbol_kind_name(symbol.kind),
        symbol.name
    ));

    let child_prefix = format!("{prefix}  ");
    for child in &symbol.children {
        format_document_symbol(child, &child_prefix, show_line_numbers, out);
    }
}

/// `Kind: name in container (L3) - /path/file.go`.
pub(crate) fn format_symbol_information(symbol: &SymbolInformation, show_line_numbers: bool) -> String {
    let container = symbol
        .container_name
        .as_deref()
        .filter(|c| !c.is_empty())
        .map(|c| format!(" in {c}"))
        .unwrap_or_default();
    let line = if show_line_numbers {
        format!(" (L{})", symbol.location.range.start.line + 1)
    } else {
        String::new()
    };
    let path = protocol::file_uri_to_path(&symbol.location.uri)
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| symbol.location.uri.clone());

    format!(
        "{}: {}{container}{line} - {path}",
        symbol_kind_name(symbol.kind),
        symbol.name
    )
}
