//! Handlers for requests and notifications the language server sends to
//! the broker.
//!
//! Installed into the session's handler tables right after the
//! `initialized` notification; servers do not issue these calls before
//! then.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{Value, json};

use crate::apply;
use crate::client::SessionCore;
use crate::protocol::{
    ApplyWorkspaceEditParams, ApplyWorkspaceEditResult, DidChangeWatchedFilesRegistrationOptions,
    PublishDiagnosticsParams, RegistrationParams, ResponseError, ShowMessageParams,
};

const INVALID_PARAMS: i64 = -32602;

/// Install the broker's standard server→client handlers.
pub(crate) fn register_defaults(core: &Arc<SessionCore>) {
    if let Ok(mut table) = core.server_request_handlers.write() {
        table.insert("workspace/applyEdit".to_string(), Arc::new(handle_apply_edit));
        table.insert(
            "workspace/configuration".to_string(),
            Arc::new(handle_configuration),
        );
        table.insert(
            "client/registerCapability".to_string(),
            Arc::new(handle_register_capability),
        );
    }
    if let Ok(mut table) = core.notification_handlers.write() {
        table.insert(
            "window/showMessage".to_string(),
            Arc::new(handle_show_message),
        );
        table.insert(
            "textDocument/publishDiagnostics".to_string(),
            Arc::new(handle_publish_diagnostics),
        );
    }
}

fn invalid_params(message: String) -> ResponseError {
    ResponseError {
        code: INVALID_PARAMS,
        message,
    }
}

/// `workspace/applyEdit`: apply the edit to disk and report the outcome.
/// Application failures are a result (`applied: false`), not a protocol
/// error.
fn handle_apply_edit(core: &SessionCore, params: Option<Value>) -> Result<Value, ResponseError> {
    let params: ApplyWorkspaceEditParams =
        serde_json::from_value(params.unwrap_or(Value::Null))
            .map_err(|e| invalid_params(format!("bad applyEdit params: {e}")))?;

    let result = match apply::apply_workspace_edit(&params.edit) {
        Ok(()) => ApplyWorkspaceEditResult {
            applied: true,
            failure_reason: None,
        },
        Err(e) => {
            tracing::warn!(server = %core.language, "workspace edit failed: {e}");
            ApplyWorkspaceEditResult {
                applied: false,
                failure_reason: Some(e.to_string()),
            }
        }
    };
    serde_json::to_value(result).map_err(|e| invalid_params(e.to_string()))
}

/// `workspace/configuration`: the broker synthesizes no configuration, so
/// every requested item gets an empty object.
fn handle_configuration(_core: &SessionCore, params: Option<Value>) -> Result<Value, ResponseError> {
    let count = params
        .as_ref()
        .and_then(|p| p.get("items"))
        .and_then(Value::as_array)
        .map_or(1, Vec::len);
    Ok(Value::Array(vec![json!({}); count]))
}

/// `client/registerCapability`: decode file-watcher registrations and hand
/// them to the installed watch callback; everything else is accepted
/// silently.
fn handle_register_capability(
    core: &SessionCore,
    params: Option<Value>,
) -> Result<Value, ResponseError> {
    let params: RegistrationParams = serde_json::from_value(params.unwrap_or(Value::Null))
        .map_err(|e| invalid_params(format!("bad registration params: {e}")))?;

    for registration in params.registrations {
        tracing::debug!(
            server = %core.language,
            method = %registration.method,
            id = %registration.id,
            "capability registration"
        );
        if registration.method != "workspace/didChangeWatchedFiles" {
            continue;
        }

        let Some(raw) = registration.register_options else {
            continue;
        };
        match serde_json::from_value::<DidChangeWatchedFilesRegistrationOptions>(raw) {
            Ok(options) => {
                let callback = core
                    .watch_callback
                    .read()
                    .ok()
                    .and_then(|slot| slot.clone());
                if let Some(callback) = callback {
                    callback(&registration.id, &options.watchers);
                } else {
                    tracing::debug!(
                        server = %core.language,
                        "no file-watch callback installed, dropping {} watcher(s)",
                        options.watchers.len()
                    );
                }
            }
            Err(e) => {
                tracing::warn!(server = %core.language, "bad watcher options: {e}");
            }
        }
    }

    Ok(Value::Null)
}

/// `window/showMessage`: log at the severity the server asked for.
fn handle_show_message(core: &SessionCore, params: Option<Value>) {
    let Ok(msg) = serde_json::from_value::<ShowMessageParams>(params.unwrap_or(Value::Null)) else {
        return;
    };
    match msg.kind {
        1 => tracing::error!(server = %core.language, "{}", msg.message),
        2 => tracing::warn!(server = %core.language, "{}", msg.message),
        3 => tracing::info!(server = %core.language, "{}", msg.message),
        _ => tracing::debug!(server = %core.language, "{}", msg.message),
    }
}

/// `textDocument/publishDiagnostics`: the pushed list replaces the cached
/// one wholesale, and the per-URI receive stamp advances.
fn handle_publish_diagnostics(core: &SessionCore, params: Option<Value>) {
    let parsed = serde_json::from_value::<PublishDiagnosticsParams>(params.unwrap_or(Value::Null));
    let params = match parsed {
        Ok(p) => p,
        Err(e) => {
            tracing::debug!(server = %core.language, "bad publishDiagnostics params: {e}");
            return;
        }
    };

    tracing::debug!(
        server = %core.language,
        uri = %params.uri,
        count = params.diagnostics.len(),
        "diagnostics received"
    );

    if let Ok(mut map) = core.diagnostics.write() {
        map.insert(params.uri.clone(), params.diagnostics);
    }
    if let Ok(mut stamps) = core.last_diag.write() {
        stamps.insert(params.uri, Instant::now());
    }
}
