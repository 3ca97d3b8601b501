//! JSON-RPC envelope handling and the LSP payload types the broker speaks.
//!
//! Only the shapes the broker actually sends or consumes are typed here.
//! Union-shaped payloads (document changes, symbol results, glob patterns)
//! are carried as raw [`serde_json::Value`] and decoded on demand into the
//! first matching shape, so unknown variants pass through harmlessly.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

// ── JSON-RPC envelope ──────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct Request {
    pub jsonrpc: &'static str,
    pub id: i32,
    pub method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: i32, method: &'static str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Notification {
    pub jsonrpc: &'static str,
    pub method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    pub fn new(method: &'static str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
        }
    }
}

/// Error object from a JSON-RPC response.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
}

/// Build a success response to a server-issued request. The id is echoed
/// verbatim because servers may use string ids.
pub fn response_frame(id: &Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

/// Build an error response to a server-issued request.
pub fn error_frame(id: &Value, code: i64, message: &str) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}

pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INTERNAL_ERROR: i64 = -32603;

/// An inbound frame after classification.
///
/// A frame with id and method is a server request, id without method is a
/// response to one of our requests, method without id is a notification.
#[derive(Debug)]
pub enum Incoming {
    Request {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    Response {
        id: i32,
        body: Value,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
}

/// Classify a parsed frame, or `None` when it fits no JSON-RPC shape.
pub fn classify(frame: &Value) -> Option<Incoming> {
    let id = frame.get("id");
    let method = frame.get("method").and_then(Value::as_str);
    let has_outcome = frame.get("result").is_some() || frame.get("error").is_some();

    match (id, method) {
        (Some(id), Some(method)) => Some(Incoming::Request {
            id: id.clone(),
            method: method.to_string(),
            params: frame.get("params").cloned(),
        }),
        (Some(id), None) if has_outcome => Some(Incoming::Response {
            id: i32::try_from(id.as_i64()?).ok()?,
            body: frame.clone(),
        }),
        (None, Some(method)) => Some(Incoming::Notification {
            method: method.to_string(),
            params: frame.get("params").cloned(),
        }),
        _ => None,
    }
}

// ── Positions, ranges, edits ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Location {
    pub uri: String,
    pub range: Range,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextEdit {
    pub range: Range,
    #[serde(rename = "newText")]
    pub new_text: String,
}

/// A set of changes across workspace files, as servers hand them to us.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceEdit {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changes: Option<HashMap<String, Vec<TextEdit>>>,
    /// Entries are a union of TextDocumentEdit and file operations; kept
    /// raw and decoded via [`DocumentChange::from_value`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_changes: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextDocumentEdit {
    pub text_document: VersionedTextDocumentIdentifier,
    /// Plain or annotated text edits; annotated ones still carry
    /// `range`/`newText`, so decoding each entry as [`TextEdit`] works.
    pub edits: Vec<Value>,
}

impl TextDocumentEdit {
    /// The plain text edits in this change; entries that do not decode are
    /// skipped (snippet edits and other extensions).
    pub fn text_edits(&self) -> Vec<TextEdit> {
        self.edits
            .iter()
            .filter_map(|e| serde_json::from_value(e.clone()).ok())
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFile {
    pub uri: String,
    #[serde(default)]
    pub options: Option<FileOperationOptions>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameFile {
    pub old_uri: String,
    pub new_uri: String,
    #[serde(default)]
    pub options: Option<FileOperationOptions>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteFile {
    pub uri: String,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileOperationOptions {
    #[serde(default)]
    pub overwrite: bool,
    #[serde(default)]
    pub ignore_if_exists: bool,
}

/// One decoded `documentChanges` entry.
#[derive(Debug)]
pub enum DocumentChange {
    Edit(TextDocumentEdit),
    Create(CreateFile),
    Rename(RenameFile),
    Delete(DeleteFile),
}

impl DocumentChange {
    /// Decode one raw entry: file operations are discriminated by their
    /// `kind` field, everything else is tried as a text document edit.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value.get("kind").and_then(Value::as_str) {
            Some("create") => serde_json::from_value(value.clone()).ok().map(Self::Create),
            Some("rename") => serde_json::from_value(value.clone()).ok().map(Self::Rename),
            Some("delete") => serde_json::from_value(value.clone()).ok().map(Self::Delete),
            _ => serde_json::from_value(value.clone()).ok().map(Self::Edit),
        }
    }
}

// ── Text document identification and sync ──────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct VersionedTextDocumentIdentifier {
    pub uri: String,
    #[serde(default)]
    pub version: Option<i32>,
}

pub fn did_open_params(uri: &str, language_id: &str, version: i32, text: &str) -> Value {
    json!({
        "textDocument": {
            "uri": uri,
            "languageId": language_id,
            "version": version,
            "text": text
        }
    })
}

pub fn did_change_params(uri: &str, version: i32, text: &str) -> Value {
    json!({
        "textDocument": { "uri": uri, "version": version },
        "contentChanges": [{ "text": text }]
    })
}

pub fn did_close_params(uri: &str) -> Value {
    json!({ "textDocument": { "uri": uri } })
}

pub fn text_document_params(uri: &str) -> Value {
    json!({ "textDocument": { "uri": uri } })
}

// ── Diagnostics ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct PublishDiagnosticsParams {
    pub uri: String,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Diagnostic {
    pub range: Range,
    #[serde(default)]
    pub severity: Option<u32>,
    /// Number or string per the protocol; kept raw.
    #[serde(default)]
    pub code: Option<Value>,
    #[serde(default)]
    pub source: Option<String>,
    pub message: String,
}

/// Human label for an LSP severity number.
pub fn severity_label(severity: Option<u32>) -> &'static str {
    match severity {
        Some(1) => "ERROR",
        Some(2) => "WARNING",
        Some(3) => "INFO",
        Some(4) => "HINT",
        _ => "UNKNOWN",
    }
}

// ── Symbols ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolInformation {
    pub name: String,
    pub kind: u32,
    pub location: Location,
    #[serde(default)]
    pub container_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSymbol {
    pub name: String,
    #[serde(default)]
    pub detail: Option<String>,
    pub kind: u32,
    pub range: Range,
    pub selection_range: Range,
    #[serde(default)]
    pub children: Vec<DocumentSymbol>,
}

/// The two shapes `textDocument/documentSymbol` may return.
#[derive(Debug)]
pub enum DocumentSymbolResponse {
    Nested(Vec<DocumentSymbol>),
    Flat(Vec<SymbolInformation>),
}

impl DocumentSymbolResponse {
    /// Hierarchical first, flat second; `null` decodes to an empty nested
    /// list.
    pub fn from_value(value: Value) -> Option<Self> {
        if value.is_null() {
            return Some(Self::Nested(Vec::new()));
        }
        if let Ok(nested) = serde_json::from_value::<Vec<DocumentSymbol>>(value.clone()) {
            return Some(Self::Nested(nested));
        }
        serde_json::from_value::<Vec<SymbolInformation>>(value)
            .ok()
            .map(Self::Flat)
    }
}

/// Decode a `workspace/symbol` result; `null` means no matches.
pub fn workspace_symbols_from_value(value: Value) -> Option<Vec<SymbolInformation>> {
    if value.is_null() {
        return Some(Vec::new());
    }
    serde_json::from_value(value).ok()
}

/// The 26 standard symbol kinds, advertised in the initialize capability
/// set.
pub const SYMBOL_KIND_VALUE_SET: [u32; 26] = [
    1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26,
];

/// Readable name for a symbol kind number.
pub fn symbol_kind_name(kind: u32) -> String {
    let name = match kind {
        1 => "File",
        2 => "Module",
        3 => "Namespace",
        4 => "Package",
        5 => "Class",
        6 => "Method",
        7 => "Property",
        8 => "Field",
        9 => "Constructor",
        10 => "Enum",
        11 => "Interface",
        12 => "Function",
        13 => "Variable",
        14 => "Constant",
        15 => "String",
        16 => "Number",
        17 => "Boolean",
        18 => "Array",
        19 => "Object",
        20 => "Key",
        21 => "Null",
        22 => "EnumMember",
        23 => "Struct",
        24 => "Event",
        25 => "Operator",
        26 => "TypeParameter",
        other => return format!("UnknownKind({other})"),
    };
    name.to_string()
}

// ── Code lens and commands ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeLens {
    pub range: Range,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Command>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub title: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Vec<Value>>,
}

pub fn execute_command_params(command: &Command) -> Value {
    json!({
        "command": command.command,
        "arguments": command.arguments.clone().unwrap_or_default()
    })
}

// ── Dynamic registration / file watchers ───────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RegistrationParams {
    pub registrations: Vec<Registration>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub register_options: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct DidChangeWatchedFilesRegistrationOptions {
    pub watchers: Vec<FileSystemWatcher>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSystemWatcher {
    /// Plain glob string or a relative pattern object; kept raw.
    pub glob_pattern: Value,
    #[serde(default)]
    pub kind: Option<u32>,
}

/// One entry of a `workspace/didChangeWatchedFiles` notification, for the
/// external watcher to feed back through [`crate::Session::notify`].
#[derive(Debug, Clone, Serialize)]
pub struct FileEvent {
    pub uri: String,
    /// 1 = created, 2 = changed, 3 = deleted.
    #[serde(rename = "type")]
    pub change_type: u32,
}

pub fn did_change_watched_files_params(events: &[FileEvent]) -> Value {
    json!({ "changes": events })
}

// ── Apply edit / show message ──────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ApplyWorkspaceEditParams {
    #[serde(default)]
    pub label: Option<String>,
    pub edit: WorkspaceEdit,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyWorkspaceEditResult {
    pub applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ShowMessageParams {
    #[serde(rename = "type")]
    pub kind: u32,
    pub message: String,
}

// ── Initialization ─────────────────────────────────────────────────────

/// Build the canonical `initialize` params: broker identity, workspace
/// folder, the fixed capability set, and per-language server options.
pub fn initialize_params(root_uri: &str, workspace_name: &str, language: &str) -> Value {
    let mut params = json!({
        "processId": std::process::id(),
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION")
        },
        "rootUri": root_uri,
        "workspaceFolders": [{ "uri": root_uri, "name": workspace_name }],
        "capabilities": {
            "workspace": {
                "applyEdit": true,
                "workspaceEdit": { "documentChanges": true },
                "didChangeConfiguration": { "dynamicRegistration": false },
                "symbol": {
                    "dynamicRegistration": false,
                    "symbolKind": { "valueSet": SYMBOL_KIND_VALUE_SET }
                }
            },
            "textDocument": {
                "synchronization": {
                    "dynamicRegistration": false,
                    "willSave": false,
                    "willSaveWaitUntil": false,
                    "didSave": true
                },
                "rename": {
                    "dynamicRegistration": false,
                    "prepareSupport": false
                },
                "documentSymbol": {
                    "dynamicRegistration": false,
                    "hierarchicalDocumentSymbolSupport": true,
                    "symbolKind": { "valueSet": SYMBOL_KIND_VALUE_SET }
                },
                "codeLens": {},
                "publishDiagnostics": {
                    "relatedInformation": false,
                    "versionSupport": false
                }
            }
        },
        "trace": "off"
    });

    if let Some(options) = initialization_options(language) {
        params["initializationOptions"] = options;
    }
    params
}

/// Server-specific initialization options. gopls wants its code-lens
/// categories enumerated; other servers get nothing.
fn initialization_options(language: &str) -> Option<Value> {
    match language {
        "go" => Some(json!({
            "codelenses": {
                "generate": true,
                "regenerate_cgo": true,
                "test": true,
                "tidy": true,
                "upgrade_dependency": true,
                "vendor": true,
                "vulncheck": false
            }
        })),
        _ => None,
    }
}

// ── Path / URI conversion ──────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
#[error("cannot convert path to file URI: {}", path.display())]
pub struct PathToUriError {
    path: PathBuf,
}

pub fn path_to_file_uri(path: &Path) -> Result<url::Url, PathToUriError> {
    url::Url::from_file_path(path).map_err(|()| PathToUriError {
        path: path.to_path_buf(),
    })
}

pub fn file_uri_to_path(uri: &str) -> Option<PathBuf> {
    url::Url::parse(uri).ok().and_then(|u| u.to_file_path().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_request_response_notification() {
        let request = json!({"jsonrpc": "2.0", "id": 3, "method": "workspace/configuration"});
        assert!(matches!(
            classify(&request),
            Some(Incoming::Request { method, .. }) if method == "workspace/configuration"
        ));

        let response = json!({"jsonrpc": "2.0", "id": 3, "result": {}});
        assert!(matches!(
            classify(&response),
            Some(Incoming::Response { id: 3, .. })
        ));

        let error_response = json!({"jsonrpc": "2.0", "id": 4, "error": {"code": -1, "message": "x"}});
        assert!(matches!(
            classify(&error_response),
            Some(Incoming::Response { id: 4, .. })
        ));

        let notification = json!({"jsonrpc": "2.0", "method": "exit"});
        assert!(matches!(
            classify(&notification),
            Some(Incoming::Notification { method, .. }) if method == "exit"
        ));
    }

    #[test]
    fn classify_rejects_shapeless_frames() {
        assert!(classify(&json!({"jsonrpc": "2.0"})).is_none());
        // id without method and without result/error fits nothing
        assert!(classify(&json!({"jsonrpc": "2.0", "id": 9})).is_none());
    }

    #[test]
    fn request_serialization_omits_missing_params() {
        let req = Request::new(1, "shutdown", None);
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["method"], "shutdown");
        assert!(value.get("params").is_none(), "params must be absent, not null");

        let notif = Notification::new("initialized", Some(json!({})));
        let value = serde_json::to_value(&notif).unwrap();
        assert!(value.get("id").is_none());
        assert!(value.get("params").is_some());
    }

    #[test]
    fn initialize_params_carries_capability_set() {
        let params = initialize_params("file:///workspace", "workspace", "rust");
        assert_eq!(params["capabilities"]["workspace"]["applyEdit"], true);
        assert_eq!(
            params["capabilities"]["workspace"]["workspaceEdit"]["documentChanges"],
            true
        );
        assert_eq!(
            params["capabilities"]["textDocument"]["synchronization"]["didSave"],
            true
        );
        assert_eq!(
            params["capabilities"]["textDocument"]["documentSymbol"]
                ["hierarchicalDocumentSymbolSupport"],
            true
        );
        assert_eq!(
            params["capabilities"]["workspace"]["symbol"]["symbolKind"]["valueSet"]
                .as_array()
                .unwrap()
                .len(),
            26
        );
        assert_eq!(params["trace"], "off");
        assert!(params["processId"].is_number());
        assert!(params.get("initializationOptions").is_none());
    }

    #[test]
    fn initialize_params_sets_gopls_codelens_toggles() {
        let params = initialize_params("file:///w", "w", "go");
        let lenses = &params["initializationOptions"]["codelenses"];
        assert_eq!(lenses["test"], true);
        assert_eq!(lenses["vulncheck"], false);
    }

    #[test]
    fn publish_diagnostics_decodes_without_severity() {
        let params: PublishDiagnosticsParams = serde_json::from_value(json!({
            "uri": "file:///a.rs",
            "diagnostics": [{
                "range": {"start": {"line": 2, "character": 0}, "end": {"line": 2, "character": 5}},
                "message": "unused variable"
            }]
        }))
        .unwrap();
        assert_eq!(params.diagnostics.len(), 1);
        assert_eq!(severity_label(params.diagnostics[0].severity), "UNKNOWN");
        assert_eq!(severity_label(Some(1)), "ERROR");
        assert_eq!(severity_label(Some(4)), "HINT");
    }

    #[test]
    fn document_change_union_decodes_in_order() {
        let edit = json!({
            "textDocument": {"uri": "file:///a.rs", "version": 2},
            "edits": [
                {"range": {"start": {"line": 0, "character": 0}, "end": {"line": 0, "character": 1}}, "newText": "x"},
                {"range": {"start": {"line": 1, "character": 0}, "end": {"line": 1, "character": 0}}, "newText": "y", "annotationId": "a"}
            ]
        });
        match DocumentChange::from_value(&edit) {
            Some(DocumentChange::Edit(e)) => {
                assert_eq!(e.text_document.uri, "file:///a.rs");
                // the annotated edit still yields a plain TextEdit
                assert_eq!(e.text_edits().len(), 2);
            }
            other => panic!("expected Edit, got {other:?}"),
        }

        let create = json!({"kind": "create", "uri": "file:///new.rs"});
        assert!(matches!(
            DocumentChange::from_value(&create),
            Some(DocumentChange::Create(_))
        ));

        let rename = json!({"kind": "rename", "oldUri": "file:///a", "newUri": "file:///b"});
        assert!(matches!(
            DocumentChange::from_value(&rename),
            Some(DocumentChange::Rename(_))
        ));

        let delete = json!({"kind": "delete", "uri": "file:///a"});
        assert!(matches!(
            DocumentChange::from_value(&delete),
            Some(DocumentChange::Delete(_))
        ));
    }

    #[test]
    fn document_symbol_response_prefers_nested_shape() {
        let nested = json!([{
            "name": "main",
            "kind": 12,
            "range": {"start": {"line": 0, "character": 0}, "end": {"line": 3, "character": 1}},
            "selectionRange": {"start": {"line": 0, "character": 3}, "end": {"line": 0, "character": 7}},
            "children": []
        }]);
        assert!(matches!(
            DocumentSymbolResponse::from_value(nested),
            Some(DocumentSymbolResponse::Nested(v)) if v.len() == 1
        ));

        let flat = json!([{
            "name": "main",
            "kind": 12,
            "location": {
                "uri": "file:///a.go",
                "range": {"start": {"line": 0, "character": 0}, "end": {"line": 0, "character": 4}}
            }
        }]);
        assert!(matches!(
            DocumentSymbolResponse::from_value(flat),
            Some(DocumentSymbolResponse::Flat(v)) if v.len() == 1
        ));

        assert!(matches!(
            DocumentSymbolResponse::from_value(Value::Null),
            Some(DocumentSymbolResponse::Nested(v)) if v.is_empty()
        ));
    }

    #[test]
    fn workspace_symbols_null_is_empty() {
        assert!(workspace_symbols_from_value(Value::Null).unwrap().is_empty());
        assert!(workspace_symbols_from_value(json!("garbage")).is_none());
    }

    #[test]
    fn symbol_kind_names_cover_standard_set() {
        assert_eq!(symbol_kind_name(6), "Method");
        assert_eq!(symbol_kind_name(23), "Struct");
        assert_eq!(symbol_kind_name(99), "UnknownKind(99)");
    }

    #[test]
    fn uri_roundtrip() {
        let path = PathBuf::from("/home/dev/src/main.go");
        let uri = path_to_file_uri(&path).unwrap();
        assert_eq!(file_uri_to_path(uri.as_str()).unwrap(), path);
        assert!(file_uri_to_path("https://example.com/a.go").is_none());
        assert!(file_uri_to_path("not a uri").is_none());
    }

    #[test]
    fn watcher_registration_options_decode() {
        let options: DidChangeWatchedFilesRegistrationOptions = serde_json::from_value(json!({
            "watchers": [
                {"globPattern": "**/*.go"},
                {"globPattern": {"baseUri": "file:///w", "pattern": "**/*.mod"}, "kind": 7}
            ]
        }))
        .unwrap();
        assert_eq!(options.watchers.len(), 2);
        assert_eq!(options.watchers[1].kind, Some(7));
    }
}
