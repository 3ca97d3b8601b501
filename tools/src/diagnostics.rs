//! The `get_diagnostics` tool: cached-or-awaited diagnostics for one file,
//! formatted for the upstream client.

use std::path::Path;

use polyglot_lsp::Session;
use polyglot_lsp::protocol::{self, Diagnostic, severity_label};
use serde_json::Value;

use crate::{ToolError, absolutize, add_line_numbers};

const BANNER: &str =
    "============================================================";

/// Open the file in its session and report its diagnostics. Returns
/// whatever the cache holds once the session's diagnostics gate releases,
/// which may be nothing.
pub async fn get_diagnostics(
    session: &Session,
    file_path: &Path,
    include_context: bool,
    show_line_numbers: bool,
) -> Result<String, ToolError> {
    let path = absolutize(file_path)?;
    session.open_file(&path).await?;

    let uri = protocol::path_to_file_uri(&path)
        .map_err(polyglot_lsp::SessionError::from)?
        .to_string();
    let diagnostics = session.wait_for_diagnostics(&uri).await;

    let content = std::fs::read_to_string(&path).unwrap_or_default();
    Ok(format_diagnostics(
        &path.display().to_string(),
        &content,
        &diagnostics,
        include_context,
        show_line_numbers,
    ))
}

fn code_label(code: &Value) -> String {
    match code {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Render diagnostics the way the upstream client expects: a banner per
/// diagnostic with severity, location, message, and the offending source
/// line(s).
pub(crate) fn format_diagnostics(
    path: &str,
    content: &str,
    diagnostics: &[Diagnostic],
    include_context: bool,
    show_line_numbers: bool,
) -> String {
    if diagnostics.is_empty() {
        return format!("No diagnostics found for {path}");
    }

    let lines: Vec<&str> = content.lines().collect();
    let mut blocks = Vec::with_capacity(diagnostics.len());

    for diag in diagnostics {
        let start = diag.range.start;
        let mut block = format!(
            "{BANNER}\n[{}] {path}\nLocation: Line {}, Column {}\nMessage: {}\n",
            severity_label(diag.severity),
            start.line + 1,
            start.character + 1,
            diag.message
        );
        if let Some(source) = &diag.source {
            block.push_str(&format!("Source: {source}\n"));
        }
        if let Some(code) = &diag.code {
            block.push_str(&format!("Code: {}\n", code_label(code)));
        }
        block.push_str(BANNER);

        let first = start.line as usize;
        let last = if include_context {
            (diag.range.end.line as usize).max(first)
        } else {
            first
        };
        if first < lines.len() {
            let snippet = lines[first..=last.min(lines.len() - 1)].join("\n");
            let snippet = if show_line_numbers {
                add_line_numbers(&snippet, start.line + 1)
            } else {
                snippet
            };
            block.push('\n');
            block.push_str(&snippet);
            block.push('\n');
        }

        blocks.push(block);
    }

    blocks.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use polyglot_lsp::protocol::{Position, Range};
    use serde_json::json;

    fn diag(line: u32, severity: Option<u32>, message: &str) -> Diagnostic {
        serde_json::from_value(json!({
            "range": {
                "start": {"line": line, "character": 2},
                "end": {"line": line + 1, "character": 0}
            },
            "severity": severity,
            "message": message
        }))
        .unwrap()
    }

    #[test]
    fn empty_list_reports_no_diagnostics() {
        let out = format_diagnostics("/w/a.go", "package main\n", &[], false, true);
        assert_eq!(out, "No diagnostics found for /w/a.go");
    }

    #[test]
    fn block_carries_severity_location_and_line() {
        let out = format_diagnostics(
            "/w/a.go",
            "package main\nfunc main() {\n}\n",
            &[diag(1, Some(1), "missing return")],
            false,
            true,
        );
        assert!(out.contains("[ERROR] /w/a.go"));
        assert!(out.contains("Location: Line 2, Column 3"));
        assert!(out.contains("Message: missing return"));
        assert!(out.contains("2: func main() {"));
    }

    #[test]
    fn context_extends_to_the_range_end() {
        let out = format_diagnostics(
            "/w/a.go",
            "one\ntwo\nthree\nfour",
            &[diag(1, Some(2), "spans lines")],
            true,
            false,
        );
        assert!(out.contains("two\nthree"));
        assert!(!out.contains("1: "));
    }

    #[test]
    fn source_and_code_are_optional() {
        let mut with_meta = diag(0, Some(2), "w");
        with_meta.source = Some("vet".to_string());
        with_meta.code = Some(json!("SA1000"));

        let out = format_diagnostics("/f", "line", &[with_meta], false, false);
        assert!(out.contains("Source: vet"));
        assert!(out.contains("Code: SA1000"));

        let out = format_diagnostics("/f", "line", &[diag(0, None, "w")], false, false);
        assert!(!out.contains("Source:"));
        assert!(out.contains("[UNKNOWN]"));
    }

    #[test]
    fn diagnostic_past_eof_omits_the_snippet() {
        let d = Diagnostic {
            range: Range {
                start: Position { line: 99, character: 0 },
                end: Position { line: 99, character: 1 },
            },
            severity: Some(1),
            code: None,
            source: None,
            message: "phantom".to_string(),
        };
        let out = format_diagnostics("/f", "short file", &[d], false, true);
        assert!(out.contains("Location: Line 100, Column 1"));
        assert!(!out.contains("short file\n"));
    }
}
