//! The upstream adapter: a JSON-RPC tool server on stdin/stdout.
//!
//! The upstream client speaks the same `Content-Length` framing the
//! language servers do, so the adapter reuses the LSP codec. It exposes
//! the broker's eight tools through `tools/list` / `tools/call`; each call
//! resolves to exactly one session through the router and returns either a
//! text result or an error with a textual reason.

use std::path::PathBuf;

use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};

use polyglot_lsp::codec::{CodecError, FrameReader, FrameWriter};
use polyglot_lsp::protocol::{Incoming, classify, error_frame, response_frame};
use polyglot_lsp::{Router, RouterError};
use polyglot_tools as tools;
use polyglot_tools::{TextEditOp, ToolError};

const INVALID_PARAMS: i64 = -32602;
const METHOD_NOT_FOUND: i64 = -32601;
const TOOL_FAILED: i64 = -32000;

struct RpcError {
    code: i64,
    message: String,
}

impl RpcError {
    fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<ToolError> for RpcError {
    fn from(err: ToolError) -> Self {
        let code = match err {
            ToolError::InvalidArgument(_) => INVALID_PARAMS,
            _ => TOOL_FAILED,
        };
        Self::new(code, err.to_string())
    }
}

impl From<RouterError> for RpcError {
    fn from(err: RouterError) -> Self {
        Self::new(TOOL_FAILED, err.to_string())
    }
}

/// Serve the tool protocol over the process's stdin/stdout until the
/// client closes the stream.
pub async fn serve(router: &Router) -> anyhow::Result<()> {
    serve_streams(router, tokio::io::stdin(), tokio::io::stdout()).await
}

async fn serve_streams<R, W>(router: &Router, input: R, output: W) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = FrameReader::new(input);
    let mut writer = FrameWriter::new(output);

    loop {
        let frame = match reader.read_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::info!("upstream client closed the stream");
                return Ok(());
            }
            Err(CodecError::MalformedFrame(reason)) => {
                tracing::warn!("skipping malformed upstream frame: {reason}");
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        match classify(&frame) {
            Some(Incoming::Request { id, method, params }) => {
                let reply = match handle_request(router, &method, params).await {
                    Ok(result) => response_frame(&id, result),
                    Err(e) => error_frame(&id, e.code, &e.message),
                };
                writer.write_frame(&reply).await?;
            }
            Some(Incoming::Notification { method, .. }) => {
                tracing::debug!(%method, "upstream notification ignored");
            }
            _ => {
                tracing::debug!("discarding malformed upstream message");
            }
        }
    }
}

async fn handle_request(
    router: &Router,
    method: &str,
    params: Option<Value>,
) -> Result<Value, RpcError> {
    match method {
        "initialize" => Ok(json!({
            "protocolVersion": "2024-11-05",
            "serverInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION")
            },
            "capabilities": { "tools": {} }
        })),
        "ping" => Ok(json!({})),
        "tools/list" => Ok(json!({ "tools": tool_descriptors() })),
        "tools/call" => {
            let call: ToolCall = decode(params)?;
            let text = dispatch_tool(router, &call.name, call.arguments).await?;
            Ok(json!({
                "content": [{ "type": "text", "text": text }],
                "isError": false
            }))
        }
        other => Err(RpcError::new(
            METHOD_NOT_FOUND,
            format!("Method not found: {other}"),
        )),
    }
}

fn decode<T: serde::de::DeserializeOwned>(params: Option<Value>) -> Result<T, RpcError> {
    serde_json::from_value(params.unwrap_or(Value::Null))
        .map_err(|e| RpcError::new(INVALID_PARAMS, format!("invalid arguments: {e}")))
}

#[derive(Deserialize)]
struct ToolCall {
    name: String,
    #[serde(default)]
    arguments: Option<Value>,
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ApplyTextEditArgs {
    file_path: PathBuf,
    edits: Vec<TextEditOp>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SymbolQueryArgs {
    symbol_name: String,
    language: String,
    #[serde(default = "default_true")]
    show_line_numbers: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct GetDiagnosticsArgs {
    file_path: PathBuf,
    #[serde(default)]
    include_context: bool,
    #[serde(default = "default_true")]
    show_line_numbers: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct GetCodeLensArgs {
    file_path: PathBuf,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ExecuteCodeLensArgs {
    file_path: PathBuf,
    index: usize,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RenameSymbolArgs {
    file_path: PathBuf,
    line: u32,
    character: u32,
    new_name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct FindSymbolsArgs {
    query: String,
    scope: String,
    #[serde(default)]
    file_path: Option<PathBuf>,
    #[serde(default = "default_true")]
    show_line_numbers: bool,
}

async fn dispatch_tool(
    router: &Router,
    name: &str,
    arguments: Option<Value>,
) -> Result<String, RpcError> {
    match name {
        "apply_text_edit" => {
            let args: ApplyTextEditArgs = decode(arguments)?;
            let session = router.session_for_path(&args.file_path)?;
            Ok(tools::apply_text_edits(session.as_ref(), &args.file_path, args.edits).await?)
        }
        "read_definition" => {
            let args: SymbolQueryArgs = decode(arguments)?;
            let session = router.session_for_language(&args.language)?;
            Ok(tools::definition::read_definition(
                session,
                &args.symbol_name,
                args.show_line_numbers,
            )
            .await?)
        }
        "find_references" => {
            let args: SymbolQueryArgs = decode(arguments)?;
            let session = router.session_for_language(&args.language)?;
            Ok(tools::references::find_references(
                session,
                &args.symbol_name,
                args.show_line_numbers,
            )
            .await?)
        }
        "get_diagnostics" => {
            let args: GetDiagnosticsArgs = decode(arguments)?;
            let session = router.session_for_path(&args.file_path)?;
            Ok(tools::diagnostics::get_diagnostics(
                session,
                &args.file_path,
                args.include_context,
                args.show_line_numbers,
            )
            .await?)
        }
        "get_codelens" => {
            let args: GetCodeLensArgs = decode(arguments)?;
            let session = router.session_for_path(&args.file_path)?;
            Ok(tools::codelens::get_code_lens(session, &args.file_path).await?)
        }
        "execute_codelens" => {
            let args: ExecuteCodeLensArgs = decode(arguments)?;
            let session = router.session_for_path(&args.file_path)?;
            Ok(tools::codelens::execute_code_lens(session, &args.file_path, args.index).await?)
        }
        "rename_symbol" => {
            let args: RenameSymbolArgs = decode(arguments)?;
            let session = router.session_for_path(&args.file_path)?;
            Ok(tools::rename::rename_symbol(
                session,
                &args.file_path,
                args.line,
                args.character,
                &args.new_name,
            )
            .await?)
        }
        "find_symbols" => {
            let args: FindSymbolsArgs = decode(arguments)?;
            match args.scope.as_str() {
                "document" => {
                    let Some(file_path) = &args.file_path else {
                        return Err(RpcError::new(
                            INVALID_PARAMS,
                            "filePath is required for document scope",
                        ));
                    };
                    let session = router.session_for_path(file_path)?;
                    Ok(tools::symbols::document_symbols(
                        session,
                        file_path,
                        args.show_line_numbers,
                    )
                    .await?)
                }
                "workspace" => {
                    let session = router.workspace_session()?;
                    Ok(
                        tools::symbols::workspace_symbols(session, &args.query, args.show_line_numbers)
                            .await?,
                    )
                }
                other => Err(RpcError::new(
                    INVALID_PARAMS,
                    format!("invalid scope '{other}': must be 'workspace' or 'document'"),
                )),
            }
        }
        other => Err(RpcError::new(
            INVALID_PARAMS,
            format!("unknown tool: {other}"),
        )),
    }
}

fn tool_descriptors() -> Vec<Value> {
    let file_path = json!({"type": "string", "description": "Path to the target file"});
    let show_line_numbers = json!({
        "type": "boolean",
        "default": true,
        "description": "Include line numbers in the output"
    });

    vec![
        json!({
            "name": "apply_text_edit",
            "description": "Apply multiple text edits to a file. Each edit names an operation (replace, insert, delete), an inclusive 1-based line range, and either literal replacement text or a regex pattern with capture-group replacement.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "filePath": file_path,
                    "edits": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "type": {"type": "string", "enum": ["replace", "insert", "delete"]},
                                "startLine": {"type": "integer", "description": "Start line of the range, inclusive"},
                                "endLine": {"type": "integer", "description": "End line of the range, inclusive"},
                                "newText": {"type": "string"},
                                "isRegex": {"type": "boolean"},
                                "regexPattern": {"type": "string"},
                                "regexReplace": {"type": "string", "description": "Replacement supporting capture groups like $1"},
                                "preserveBrackets": {"type": "boolean", "description": "Reject edits that would break bracket pairs"},
                                "bracketTypes": {"type": "array", "items": {"type": "string"}}
                            },
                            "required": ["type", "startLine", "endLine"]
                        }
                    }
                },
                "required": ["filePath", "edits"]
            }
        }),
        json!({
            "name": "read_definition",
            "description": "Read the full source of a symbol's definition, located by exact name.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "symbolName": {"type": "string"},
                    "language": {"type": "string", "description": "Language tag naming the session to query"},
                    "showLineNumbers": show_line_numbers
                },
                "required": ["symbolName", "language"]
            }
        }),
        json!({
            "name": "find_references",
            "description": "List every place a symbol is used, grouped by file.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "symbolName": {"type": "string"},
                    "language": {"type": "string", "description": "Language tag naming the session to query"},
                    "showLineNumbers": show_line_numbers
                },
                "required": ["symbolName", "language"]
            }
        }),
        json!({
            "name": "get_diagnostics",
            "description": "Report the language server's diagnostics for a file.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "filePath": file_path,
                    "includeContext": {"type": "boolean", "default": false},
                    "showLineNumbers": show_line_numbers
                },
                "required": ["filePath"]
            }
        }),
        json!({
            "name": "get_codelens",
            "description": "List the code lens hints a language server offers for a file.",
            "inputSchema": {
                "type": "object",
                "properties": { "filePath": file_path },
                "required": ["filePath"]
            }
        }),
        json!({
            "name": "execute_codelens",
            "description": "Execute one code lens command by its 1-based index from get_codelens.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "filePath": file_path,
                    "index": {"type": "integer", "minimum": 1}
                },
                "required": ["filePath", "index"]
            }
        }),
        json!({
            "name": "rename_symbol",
            "description": "Rename the symbol at a 0-based position across the workspace.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "filePath": file_path,
                    "line": {"type": "integer", "description": "0-based line of the symbol"},
                    "character": {"type": "integer", "description": "0-based character of the symbol"},
                    "newName": {"type": "string"}
                },
                "required": ["filePath", "line", "character", "newName"]
            }
        }),
        json!({
            "name": "find_symbols",
            "description": "Find symbols in the workspace or one document.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "scope": {"type": "string", "enum": ["workspace", "document"]},
                    "filePath": {"type": "string", "description": "Required when scope is 'document'"},
                    "showLineNumbers": show_line_numbers
                },
                "required": ["query", "scope"]
            }
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use polyglot_lsp::codec::{FrameReader, FrameWriter};
    use std::sync::Arc;

    async fn start_router() -> (tempfile::TempDir, Arc<Router>) {
        let dir = tempfile::tempdir().unwrap();
        let router = Router::start(dir.path(), &[]).await.unwrap();
        (dir, Arc::new(router))
    }

    /// Send `requests` through an in-memory stream pair and collect one
    /// reply per id-bearing request.
    async fn roundtrip(router: Arc<Router>, requests: Vec<Value>, expected: usize) -> Vec<Value> {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let serve_task = tokio::spawn(async move {
            serve_streams(router.as_ref(), server_read, server_write).await
        });

        let (client_read, client_write) = tokio::io::split(client);
        let mut writer = FrameWriter::new(client_write);
        for request in &requests {
            writer.write_frame(request).await.unwrap();
        }

        let mut reader = FrameReader::new(client_read);
        let mut replies = Vec::new();
        for _ in 0..expected {
            replies.push(reader.read_frame().await.unwrap().unwrap());
        }

        // Dropping both client halves closes the stream; the serve loop
        // sees EOF and returns.
        drop(reader);
        drop(writer);
        serve_task.await.unwrap().unwrap();
        replies
    }

    #[tokio::test]
    async fn initialize_and_list_tools() {
        let (_dir, router) = start_router().await;
        let replies = roundtrip(
            router,
            vec![
                json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}),
                json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
                json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}),
            ],
            2,
        )
        .await;
        assert!(replies[0]["result"]["capabilities"]["tools"].is_object());

        let tools = replies[1]["result"]["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 8);
        let names: Vec<&str> = tools.iter().filter_map(|t| t["name"].as_str()).collect();
        assert!(names.contains(&"apply_text_edit"));
        assert!(names.contains(&"find_symbols"));
    }

    #[tokio::test]
    async fn unknown_method_and_unknown_tool_are_errors() {
        let (_dir, router) = start_router().await;
        let replies = roundtrip(
            router,
            vec![
                json!({"jsonrpc": "2.0", "id": 1, "method": "bogus/method"}),
                json!({"jsonrpc": "2.0", "id": 2, "method": "tools/call",
                       "params": {"name": "not_a_tool", "arguments": {}}}),
            ],
            2,
        )
        .await;

        assert_eq!(replies[0]["error"]["code"], METHOD_NOT_FOUND);
        assert_eq!(replies[1]["error"]["code"], INVALID_PARAMS);
    }

    #[tokio::test]
    async fn unroutable_extension_fails_before_any_session_work() {
        let (_dir, router) = start_router().await;
        let replies = roundtrip(
            router,
            vec![json!({"jsonrpc": "2.0", "id": 7, "method": "tools/call", "params": {
                "name": "get_diagnostics",
                "arguments": {"filePath": "/w/main.zig"}
            }})],
            1,
        )
        .await;

        let message = replies[0]["error"]["message"].as_str().unwrap();
        assert!(message.contains("not supported"), "got: {message}");
    }

    #[tokio::test]
    async fn strict_argument_validation_rejects_unknown_fields() {
        let (_dir, router) = start_router().await;
        let replies = roundtrip(
            router,
            vec![json!({"jsonrpc": "2.0", "id": 3, "method": "tools/call", "params": {
                "name": "get_codelens",
                "arguments": {"filePath": "/w/a.go", "surprise": true}
            }})],
            1,
        )
        .await;

        assert_eq!(replies[0]["error"]["code"], INVALID_PARAMS);
    }

    #[tokio::test]
    async fn find_symbols_validates_scope() {
        let (_dir, router) = start_router().await;
        let replies = roundtrip(
            router,
            vec![
                json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": {
                    "name": "find_symbols",
                    "arguments": {"query": "x", "scope": "galaxy"}
                }}),
                json!({"jsonrpc": "2.0", "id": 2, "method": "tools/call", "params": {
                    "name": "find_symbols",
                    "arguments": {"query": "x", "scope": "document"}
                }}),
            ],
            2,
        )
        .await;

        assert!(replies[0]["error"]["message"]
            .as_str()
            .unwrap()
            .contains("invalid scope"));
        assert!(replies[1]["error"]["message"]
            .as_str()
            .unwrap()
            .contains("filePath is required"));
    }
}
