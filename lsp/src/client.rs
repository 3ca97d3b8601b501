//! Session — one language-server subprocess plus the broker-side state
//! bound to it.
//!
//! Each session runs a dedicated reader task that owns the inbound half of
//! the codec and a writer task that owns the outbound half, so wire reads
//! and writes are strictly serialized. Any number of concurrent callers may
//! issue requests; responses are correlated back to them by id through
//! one-shot delivery slots.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tokio::io::AsyncBufReadExt;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc, oneshot};

use crate::codec::{CodecError, FrameReader, FrameWriter};
use crate::handlers;
use crate::protocol::{self, FileSystemWatcher, Incoming, Notification, Request, ResponseError};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const READY_PROBE_INTERVAL: Duration = Duration::from_millis(500);
const READY_PROBE_DEADLINE: Duration = Duration::from_secs(10);

const DIAGNOSTICS_POLL_INTERVAL: Duration = Duration::from_millis(200);
const DIAGNOSTICS_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

const FILE_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);
const SHUTDOWN_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
const EXIT_NOTIFY_TIMEOUT: Duration = Duration::from_secs(1);
const PROCESS_EXIT_TIMEOUT: Duration = Duration::from_secs(2);

const WRITER_QUEUE_CAPACITY: usize = 64;

/// Errors surfaced by session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to start '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("'{0}' not found in PATH")]
    CommandNotFound(String),
    #[error("language server returned error {code}: {message}")]
    Lsp { code: i64, message: String },
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("language server is not running")]
    SubprocessUnavailable,
    #[error("reading {}: {source}", path.display())]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    InvalidPath(#[from] protocol::PathToUriError),
    #[error("encoding message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Starting = 0,
    Ready = 1,
    Closed = 2,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Ready,
            2 => Self::Closed,
            _ => Self::Starting,
        }
    }
}

/// Tracking entry for a document the session has opened.
#[derive(Debug, Clone)]
pub struct OpenFileInfo {
    pub version: i32,
    pub uri: String,
}

pub(crate) enum WriterCommand {
    Send(Value),
    Shutdown,
}

pub(crate) type NotificationHandler = Arc<dyn Fn(&SessionCore, Option<Value>) + Send + Sync>;
pub(crate) type ServerRequestHandler =
    Arc<dyn Fn(&SessionCore, Option<Value>) -> Result<Value, ResponseError> + Send + Sync>;

type WatchCallback = Arc<dyn Fn(&str, &[FileSystemWatcher]) + Send + Sync>;

/// State shared between the session handle and its reader task.
pub(crate) struct SessionCore {
    pub(crate) language: String,
    pub(crate) writer_tx: mpsc::Sender<WriterCommand>,
    pub(crate) pending: Mutex<HashMap<i32, oneshot::Sender<Value>>>,
    pub(crate) notification_handlers: RwLock<HashMap<String, NotificationHandler>>,
    pub(crate) server_request_handlers: RwLock<HashMap<String, ServerRequestHandler>>,
    pub(crate) diagnostics: RwLock<HashMap<String, Vec<protocol::Diagnostic>>>,
    pub(crate) last_diag: RwLock<HashMap<String, Instant>>,
    pub(crate) watch_callback: RwLock<Option<WatchCallback>>,
    state: AtomicU8,
}

impl SessionCore {
    fn new(language: String, writer_tx: mpsc::Sender<WriterCommand>) -> Self {
        Self {
            language,
            writer_tx,
            pending: Mutex::new(HashMap::new()),
            notification_handlers: RwLock::new(HashMap::new()),
            server_request_handlers: RwLock::new(HashMap::new()),
            diagnostics: RwLock::new(HashMap::new()),
            last_diag: RwLock::new(HashMap::new()),
            watch_callback: RwLock::new(None),
            state: AtomicU8::new(SessionState::Starting as u8),
        }
    }

    fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Record the subprocess as gone and wake every waiter with a dropped
    /// slot (they observe `SubprocessUnavailable`).
    async fn mark_closed(&self) {
        self.set_state(SessionState::Closed);
        self.pending.lock().await.clear();
    }

    /// Route one inbound frame: responses to their pending slot, server
    /// requests through the handler table (replying method-not-found when
    /// unregistered), notifications to theirs, anything else to the log.
    pub(crate) async fn dispatch(&self, frame: &Value) {
        let Some(incoming) = protocol::classify(frame) else {
            tracing::debug!(server = %self.language, "discarding malformed JSON-RPC message");
            return;
        };

        match incoming {
            Incoming::Response { id, body } => {
                let slot = self.pending.lock().await.remove(&id);
                match slot {
                    Some(tx) => {
                        let _ = tx.send(body);
                    }
                    None => {
                        tracing::debug!(server = %self.language, id, "response for unknown request id");
                    }
                }
            }
            Incoming::Request { id, method, params } => {
                let handler = self
                    .server_request_handlers
                    .read()
                    .ok()
                    .and_then(|table| table.get(&method).cloned());
                let reply = match handler {
                    Some(handler) => match handler(self, params) {
                        Ok(result) => protocol::response_frame(&id, result),
                        Err(err) => protocol::error_frame(&id, err.code, &err.message),
                    },
                    None => {
                        tracing::debug!(server = %self.language, %method, "server request has no handler");
                        protocol::error_frame(
                            &id,
                            protocol::METHOD_NOT_FOUND,
                            &format!("Method not found: {method}"),
                        )
                    }
                };
                let _ = self.writer_tx.send(WriterCommand::Send(reply)).await;
            }
            Incoming::Notification { method, params } => {
                let handler = self
                    .notification_handlers
                    .read()
                    .ok()
                    .and_then(|table| table.get(&method).cloned());
                match handler {
                    Some(handler) => handler(self, params),
                    None => {
                        tracing::trace!(server = %self.language, %method, "ignoring notification");
                    }
                }
            }
        }
    }
}

/// One long-lived language server and the state bound to it.
///
/// Sessions are shared behind `Arc` by the router; all operations take
/// `&self`.
pub struct Session {
    core: Arc<SessionCore>,
    language: String,
    workspace_root: PathBuf,
    next_id: AtomicI32,
    /// Async mutex held across each didOpen/didChange/didClose enqueue so
    /// the subprocess observes version-generating events in caller order.
    open_files: Mutex<HashMap<String, OpenFileInfo>>,
    child: Mutex<Option<Child>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("language", &self.language)
            .field("workspace_root", &self.workspace_root)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Spawn the language server subprocess and start its reader, writer,
    /// and stderr drain tasks. The session is `Starting` until the
    /// readiness probe succeeds.
    pub async fn spawn(
        language: &str,
        command: &str,
        args: &[String],
        workspace_root: &Path,
    ) -> Result<Self, SessionError> {
        let resolved = which::which(command)
            .map_err(|_| SessionError::CommandNotFound(command.to_string()))?;

        let mut child = Command::new(&resolved)
            .args(args)
            .current_dir(workspace_root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SessionError::Spawn {
                command: command.to_string(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or(SessionError::SubprocessUnavailable)?;
        let stdout = child.stdout.take().ok_or(SessionError::SubprocessUnavailable)?;
        let stderr = child.stderr.take();

        let (writer_tx, mut writer_rx) = mpsc::channel::<WriterCommand>(WRITER_QUEUE_CAPACITY);
        let writer_language = language.to_string();
        tokio::spawn(async move {
            let mut writer = FrameWriter::new(stdin);
            while let Some(cmd) = writer_rx.recv().await {
                match cmd {
                    WriterCommand::Send(frame) => {
                        if let Err(e) = writer.write_frame(&frame).await {
                            tracing::warn!(server = %writer_language, "write error: {e}");
                            break;
                        }
                    }
                    // Dropping the writer closes the child's stdin.
                    WriterCommand::Shutdown => break,
                }
            }
        });

        if let Some(stderr) = stderr {
            let stderr_language = language.to_string();
            tokio::spawn(async move {
                let mut lines = tokio::io::BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(server = %stderr_language, "stderr: {line}");
                }
            });
        }

        let core = Arc::new(SessionCore::new(language.to_string(), writer_tx));

        let reader_core = Arc::clone(&core);
        tokio::spawn(async move {
            let mut reader = FrameReader::new(stdout);
            loop {
                match reader.read_frame().await {
                    Ok(Some(frame)) => reader_core.dispatch(&frame).await,
                    Ok(None) => {
                        tracing::info!(server = %reader_core.language, "language server closed stdout");
                        reader_core.mark_closed().await;
                        break;
                    }
                    Err(CodecError::MalformedFrame(reason)) => {
                        // A bad frame is logged and skipped; the stream may
                        // still carry well-formed frames after it.
                        tracing::warn!(server = %reader_core.language, "skipping malformed frame: {reason}");
                    }
                    Err(CodecError::Io(e)) => {
                        tracing::warn!(server = %reader_core.language, "read error: {e}");
                        reader_core.mark_closed().await;
                        break;
                    }
                }
            }
        });

        Ok(Self {
            core,
            language: language.to_string(),
            workspace_root: workspace_root.to_path_buf(),
            next_id: AtomicI32::new(1),
            open_files: Mutex::new(HashMap::new()),
            child: Mutex::new(Some(child)),
        })
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    pub fn state(&self) -> SessionState {
        self.core.state()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    // ── Wire operations ────────────────────────────────────────────────

    /// Issue a request and wait for its response with the default timeout.
    pub async fn request(
        &self,
        method: &'static str,
        params: Option<Value>,
    ) -> Result<Value, SessionError> {
        self.request_with_timeout(method, params, DEFAULT_REQUEST_TIMEOUT)
            .await
    }

    /// Issue a request and wait for its response. The pending slot is
    /// removed when the caller's deadline expires, so abandoned ids never
    /// accumulate. Exactly one waiter observes any given response.
    pub async fn request_with_timeout(
        &self,
        method: &'static str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, SessionError> {
        if self.core.state() == SessionState::Closed {
            return Err(SessionError::SubprocessUnavailable);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.core.pending.lock().await.insert(id, tx);

        let frame = serde_json::to_value(Request::new(id, method, params))?;
        if self
            .core
            .writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .is_err()
        {
            self.core.pending.lock().await.remove(&id);
            return Err(SessionError::SubprocessUnavailable);
        }

        let body = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(body)) => body,
            Ok(Err(_)) => {
                // Slot dropped: the reader hit EOF and drained the table.
                return Err(SessionError::SubprocessUnavailable);
            }
            Err(_) => {
                self.core.pending.lock().await.remove(&id);
                return Err(SessionError::Timeout(timeout));
            }
        };

        if let Some(err) = body.get("error") {
            let parsed: ResponseError = serde_json::from_value(err.clone()).unwrap_or(
                ResponseError {
                    code: protocol::INTERNAL_ERROR,
                    message: err.to_string(),
                },
            );
            return Err(SessionError::Lsp {
                code: parsed.code,
                message: parsed.message,
            });
        }
        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Send a notification; returns as soon as the frame is queued.
    pub async fn notify(
        &self,
        method: &'static str,
        params: Option<Value>,
    ) -> Result<(), SessionError> {
        let frame = serde_json::to_value(Notification::new(method, params))?;
        self.core
            .writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .map_err(|_| SessionError::SubprocessUnavailable)
    }

    // ── Initialization ─────────────────────────────────────────────────

    /// Run the `initialize`/`initialized` handshake and install the
    /// server→client handlers.
    pub async fn initialize(&self) -> Result<Value, SessionError> {
        let root_uri = protocol::path_to_file_uri(&self.workspace_root)?;
        let workspace_name = self
            .workspace_root
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("workspace");

        let params = protocol::initialize_params(root_uri.as_str(), workspace_name, &self.language);
        let result = self.request("initialize", Some(params)).await?;
        self.notify("initialized", Some(json!({}))).await?;

        handlers::register_defaults(&self.core);

        Ok(result)
    }

    /// Probe with empty `workspace/symbol` queries until one succeeds.
    /// First success flips the session to `Ready`.
    pub async fn wait_ready(&self) -> Result<(), SessionError> {
        let probe = async {
            let mut ticker = tokio::time::interval(READY_PROBE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match self
                    .request_with_timeout(
                        "workspace/symbol",
                        Some(json!({ "query": "" })),
                        READY_PROBE_DEADLINE,
                    )
                    .await
                {
                    Ok(_) => return,
                    Err(e) => {
                        tracing::debug!(server = %self.language, "readiness probe failed (will retry): {e}");
                    }
                }
            }
        };

        match tokio::time::timeout(READY_PROBE_DEADLINE, probe).await {
            Ok(()) => {
                self.core.set_state(SessionState::Ready);
                tracing::info!(server = %self.language, "language server ready");
                Ok(())
            }
            Err(_) => Err(SessionError::Timeout(READY_PROBE_DEADLINE)),
        }
    }

    /// Install the callback invoked when the server registers file
    /// watchers through `client/registerCapability`.
    pub fn set_file_watch_callback<F>(&self, callback: F)
    where
        F: Fn(&str, &[FileSystemWatcher]) + Send + Sync + 'static,
    {
        if let Ok(mut slot) = self.core.watch_callback.write() {
            *slot = Some(Arc::new(callback));
        }
    }

    // ── Open-file tracking ─────────────────────────────────────────────

    /// Open a document in the server. Idempotent: a second open of the
    /// same URI is a no-op.
    pub async fn open_file(&self, path: &Path) -> Result<(), SessionError> {
        let uri = protocol::path_to_file_uri(path)?.to_string();
        let mut open = self.open_files.lock().await;
        self.open_locked(&mut open, &uri, path).await
    }

    async fn open_locked(
        &self,
        open: &mut HashMap<String, OpenFileInfo>,
        uri: &str,
        path: &Path,
    ) -> Result<(), SessionError> {
        if open.contains_key(uri) {
            return Ok(());
        }

        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| SessionError::FileRead {
                path: path.to_path_buf(),
                source,
            })?;

        self.notify(
            "textDocument/didOpen",
            Some(protocol::did_open_params(uri, &self.language, 1, &text)),
        )
        .await?;

        open.insert(
            uri.to_string(),
            OpenFileInfo {
                version: 1,
                uri: uri.to_string(),
            },
        );
        Ok(())
    }

    /// Tell the server the document changed on disk: bump the version and
    /// send the full new content. Untracked URIs are opened implicitly
    /// first.
    pub async fn notify_change(&self, path: &Path) -> Result<(), SessionError> {
        let uri = protocol::path_to_file_uri(path)?.to_string();
        let mut open = self.open_files.lock().await;

        if !open.contains_key(&uri) {
            self.open_locked(&mut open, &uri, path).await?;
        }

        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| SessionError::FileRead {
                path: path.to_path_buf(),
                source,
            })?;

        let version = match open.get_mut(&uri) {
            Some(info) => {
                info.version += 1;
                info.version
            }
            None => return Err(SessionError::SubprocessUnavailable),
        };

        self.notify(
            "textDocument/didChange",
            Some(protocol::did_change_params(&uri, version, &text)),
        )
        .await
    }

    /// Close a document: didClose, drop the tracking entry, and clear its
    /// cached diagnostics. Closing an untracked URI is a no-op.
    pub async fn close_file(&self, path: &Path) -> Result<(), SessionError> {
        let uri = protocol::path_to_file_uri(path)?.to_string();
        let mut open = self.open_files.lock().await;

        if open.remove(&uri).is_none() {
            return Ok(());
        }

        if let Err(e) = self
            .notify("textDocument/didClose", Some(protocol::did_close_params(&uri)))
            .await
        {
            tracing::warn!(server = %self.language, uri = %uri, "didClose failed: {e}");
        }

        if let Ok(mut diags) = self.core.diagnostics.write() {
            diags.remove(&uri);
        }
        if let Ok(mut stamps) = self.core.last_diag.write() {
            stamps.remove(&uri);
        }
        Ok(())
    }

    /// Best-effort close of every tracked document, bounded per file.
    pub async fn close_all_files(&self) {
        let uris: Vec<String> = self.open_files.lock().await.keys().cloned().collect();
        for uri in uris {
            let Some(path) = protocol::file_uri_to_path(&uri) else {
                continue;
            };
            match tokio::time::timeout(FILE_CLOSE_TIMEOUT, self.close_file(&path)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(uri = %uri, "close failed: {e}"),
                Err(_) => tracing::warn!(uri = %uri, "close timed out"),
            }
        }
    }

    pub async fn is_file_open(&self, path: &Path) -> bool {
        match protocol::path_to_file_uri(path) {
            Ok(uri) => self.open_files.lock().await.contains_key(uri.as_str()),
            Err(_) => false,
        }
    }

    pub async fn open_file_version(&self, path: &Path) -> Option<i32> {
        let uri = protocol::path_to_file_uri(path).ok()?;
        self.open_files
            .lock()
            .await
            .get(uri.as_str())
            .map(|info| info.version)
    }

    // ── Diagnostics ────────────────────────────────────────────────────

    /// Cached diagnostics for a URI, as a defensive copy.
    pub fn diagnostics_for(&self, uri: &str) -> Vec<protocol::Diagnostic> {
        self.core
            .diagnostics
            .read()
            .ok()
            .and_then(|map| map.get(uri).cloned())
            .unwrap_or_default()
    }

    /// Wait for a diagnostics push for `uri`.
    ///
    /// Returns immediately when the cache already holds entries for the
    /// URI. Otherwise polls every 200 ms until the last-received stamp
    /// advances past its value at entry, bounded by a 30 s deadline; the
    /// result is whatever the cache holds at that point (possibly empty).
    pub async fn wait_for_diagnostics(&self, uri: &str) -> Vec<protocol::Diagnostic> {
        let cached = self.diagnostics_for(uri);
        if !cached.is_empty() {
            return cached;
        }

        let entry_stamp = self
            .core
            .last_diag
            .read()
            .ok()
            .and_then(|stamps| stamps.get(uri).copied());

        let poll = async {
            let mut ticker = tokio::time::interval(DIAGNOSTICS_POLL_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let current = self
                    .core
                    .last_diag
                    .read()
                    .ok()
                    .and_then(|stamps| stamps.get(uri).copied());
                match (entry_stamp, current) {
                    (None, Some(_)) => return,
                    (Some(before), Some(now)) if now > before => return,
                    _ => {}
                }
            }
        };

        if tokio::time::timeout(DIAGNOSTICS_WAIT_TIMEOUT, poll).await.is_err() {
            tracing::debug!(server = %self.language, uri = %uri, "timed out waiting for diagnostics");
        }

        self.diagnostics_for(uri)
    }

    // ── Shutdown ───────────────────────────────────────────────────────

    /// Ordered shutdown: close tracked files, `shutdown` request, `exit`
    /// notification, close stdin, then wait for (or kill) the process.
    /// Step failures are logged and never prevent later steps.
    pub async fn shutdown(&self) {
        self.close_all_files().await;

        if let Err(e) = self
            .request_with_timeout("shutdown", None, SHUTDOWN_REQUEST_TIMEOUT)
            .await
        {
            tracing::debug!(server = %self.language, "shutdown request failed (continuing): {e}");
        }

        match tokio::time::timeout(EXIT_NOTIFY_TIMEOUT, self.notify("exit", None)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(server = %self.language, "exit notification failed: {e}"),
            Err(_) => tracing::debug!(server = %self.language, "exit notification timed out"),
        }

        // Stop the writer task; dropping its FrameWriter closes stdin.
        let _ = self.core.writer_tx.send(WriterCommand::Shutdown).await;
        self.core.mark_closed().await;

        let mut slot = self.child.lock().await;
        if let Some(child) = slot.as_mut() {
            match tokio::time::timeout(PROCESS_EXIT_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::info!(server = %self.language, %status, "language server exited");
                }
                Ok(Err(e)) => {
                    tracing::warn!(server = %self.language, "waiting for exit failed: {e}");
                }
                Err(_) => {
                    tracing::warn!(server = %self.language, "language server did not exit, killing");
                    if let Err(e) = child.kill().await {
                        tracing::warn!(server = %self.language, "kill failed: {e}");
                    }
                }
            }
            *slot = None;
        }
    }

    /// Build a session around explicit channels with no subprocess, for
    /// exercising dispatch and state tracking in tests.
    #[cfg(test)]
    pub(crate) fn new_detached(
        language: &str,
    ) -> (Self, mpsc::Receiver<WriterCommand>) {
        let (writer_tx, writer_rx) = mpsc::channel(WRITER_QUEUE_CAPACITY);
        let core = Arc::new(SessionCore::new(language.to_string(), writer_tx));
        let session = Self {
            core,
            language: language.to_string(),
            workspace_root: std::env::temp_dir(),
            next_id: AtomicI32::new(1),
            open_files: Mutex::new(HashMap::new()),
            child: Mutex::new(None),
        };
        (session, writer_rx)
    }

    #[cfg(test)]
    pub(crate) fn core(&self) -> &Arc<SessionCore> {
        &self.core
    }
}
