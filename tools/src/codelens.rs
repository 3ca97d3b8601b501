//! The `get_codelens` and `execute_codelens` tools.

use std::path::Path;
use std::time::Duration;

use polyglot_lsp::Session;
use polyglot_lsp::protocol::{self, CodeLens};

use crate::{ToolError, absolutize};

/// Servers need a moment after didOpen before they can compute lenses.
const LENS_SETTLE_DELAY: Duration = Duration::from_secs(1);

async fn request_code_lenses(session: &Session, path: &Path) -> Result<Vec<CodeLens>, ToolError> {
    let uri = protocol::path_to_file_uri(path)
        .map_err(polyglot_lsp::SessionError::from)?
        .to_string();
    let result = session
        .request("textDocument/codeLens", Some(protocol::text_document_params(&uri)))
        .await?;
    if result.is_null() {
        return Ok(Vec::new());
    }
    serde_json::from_value(result).map_err(|e| ToolError::UnexpectedResponse(e.to_string()))
}

/// List the code lenses a server offers for one file, 1-indexed the way
/// `execute_codelens` expects them.
pub async fn get_code_lens(session: &Session, file_path: &Path) -> Result<String, ToolError> {
    let path = absolutize(file_path)?;
    session.open_file(&path).await?;

    let lenses = request_code_lenses(session, &path).await?;
    Ok(format_code_lenses(&path.display().to_string(), &lenses))
}

pub(crate) fn format_code_lenses(path: &str, lenses: &[CodeLens]) -> String {
    if lenses.is_empty() {
        return format!("No code lens found for {path}");
    }

    let mut out = format!("Code lens results for {path}:\n");
    for (i, lens) in lenses.iter().enumerate() {
        let line = lens.range.start.line + 1;
        match &lens.command {
            Some(cmd) => {
                out.push_str(&format!(
                    "{}. Line {line}: '{}' (command: {})\n",
                    i + 1,
                    cmd.title,
                    cmd.command
                ));
            }
            None => {
                out.push_str(&format!("{}. Line {line}: <unresolved>\n", i + 1));
            }
        }
    }
    out
}

/// Execute one code lens by its 1-based index from [`get_code_lens`],
/// resolving it first when the server deferred the command.
pub async fn execute_code_lens(
    session: &Session,
    file_path: &Path,
    index: usize,
) -> Result<String, ToolError> {
    let path = absolutize(file_path)?;
    session.open_file(&path).await?;
    tokio::time::sleep(LENS_SETTLE_DELAY).await;

    let lenses = request_code_lenses(session, &path).await?;
    if lenses.is_empty() {
        return Err(ToolError::InvalidArgument(format!(
            "no code lenses found in {}",
            path.display()
        )));
    }
    if index < 1 || index > lenses.len() {
        return Err(ToolError::InvalidArgument(format!(
            "invalid code lens index {index}; available range is 1-{}",
            lenses.len()
        )));
    }

    let mut lens = lenses[index - 1].clone();
    if lens.command.is_none() {
        let raw = serde_json::to_value(&lens)
            .map_err(|e| ToolError::UnexpectedResponse(e.to_string()))?;
        let resolved = session.request("codeLens/resolve", Some(raw)).await?;
        lens = serde_json::from_value(resolved)
            .map_err(|e| ToolError::UnexpectedResponse(e.to_string()))?;
    }

    let Some(command) = &lens.command else {
        return Err(ToolError::UnexpectedResponse(
            "code lens has no command after resolution".to_string(),
        ));
    };

    session
        .request(
            "workspace/executeCommand",
            Some(protocol::execute_command_params(command)),
        )
        .await?;

    Ok(format!(
        "Successfully executed code lens command: {}",
        command.title
    ))
}
