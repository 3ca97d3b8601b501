//! Router — the session pool and the rules that pick exactly one session
//! for an incoming tool invocation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use crate::client::Session;

/// Launch description for one language server, as configuration provides
/// it.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Language name; doubles as the LSP language identifier.
    pub language: String,
    /// Executable, resolvable on PATH or an absolute path.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// File extensions routed to this server (dotted form, e.g. `.go`).
    #[serde(default)]
    pub extensions: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// The extension or language resolves to no configured server. Raised
    /// before any session is contacted.
    #[error("language not supported: {0}")]
    NotSupported(String),
    /// The session exists but cannot take traffic.
    #[error("language server '{0}' is not ready")]
    Unavailable(String),
    /// Every configured server failed to start.
    #[error("no language servers could be started")]
    NoSessions,
}

/// Holds the sessions keyed by language plus the extension map. Both maps
/// are built once at startup and never mutated afterwards.
pub struct Router {
    sessions: HashMap<String, Arc<Session>>,
    extension_map: HashMap<String, String>,
    configured: Vec<String>,
    workspace_dir: PathBuf,
}

impl Router {
    /// Spawn and initialize a session per configured server. Individual
    /// failures are logged and skipped; only a complete failure is fatal.
    pub async fn start(workspace_dir: &Path, servers: &[ServerConfig]) -> Result<Self, RouterError> {
        let extension_map = build_extension_map(servers);
        let configured = servers.iter().map(|s| s.language.clone()).collect();
        let mut sessions = HashMap::new();

        for config in servers {
            tracing::info!(
                language = %config.language,
                command = %config.command,
                "starting language server"
            );
            let session =
                match Session::spawn(&config.language, &config.command, &config.args, workspace_dir)
                    .await
                {
                    Ok(session) => Arc::new(session),
                    Err(e) => {
                        tracing::warn!(language = %config.language, "failed to start: {e}");
                        continue;
                    }
                };

            if let Err(e) = session.initialize().await {
                tracing::warn!(language = %config.language, "initialize failed: {e}");
                session.shutdown().await;
                continue;
            }

            // A slow indexer is not fatal; the session stays Starting and
            // the router reports it Unavailable until it answers a probe.
            if let Err(e) = session.wait_ready().await {
                tracing::warn!(language = %config.language, "not ready yet: {e}");
            }

            sessions.insert(config.language.clone(), session);
        }

        if sessions.is_empty() && !servers.is_empty() {
            return Err(RouterError::NoSessions);
        }

        Ok(Self {
            sessions,
            extension_map,
            configured,
            workspace_dir: workspace_dir.to_path_buf(),
        })
    }

    pub fn workspace_dir(&self) -> &Path {
        &self.workspace_dir
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Arc<Session>> {
        self.sessions.values()
    }

    /// Resolve by explicit language tag.
    pub fn session_for_language(&self, language: &str) -> Result<&Arc<Session>, RouterError> {
        if !self.configured.iter().any(|l| l == language) {
            return Err(RouterError::NotSupported(language.to_string()));
        }
        let session = self
            .sessions
            .get(language)
            .ok_or_else(|| RouterError::Unavailable(language.to_string()))?;
        if !session.is_ready() {
            return Err(RouterError::Unavailable(language.to_string()));
        }
        Ok(session)
    }

    /// Resolve by the file's extension.
    pub fn session_for_path(&self, path: &Path) -> Result<&Arc<Session>, RouterError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .ok_or_else(|| RouterError::NotSupported(path.display().to_string()))?;
        let language = self
            .extension_map
            .get(ext)
            .ok_or_else(|| RouterError::NotSupported(format!(".{ext}")))?;
        self.session_for_language(language)
    }

    /// The session used for workspace-scoped queries: the first Ready one
    /// in language-name order, so the pick is deterministic. Cross-language
    /// aggregation stays out of scope.
    pub fn workspace_session(&self) -> Result<&Arc<Session>, RouterError> {
        let mut languages: Vec<&String> = self.sessions.keys().collect();
        languages.sort();
        for language in languages {
            if let Some(session) = self.sessions.get(language) {
                if session.is_ready() {
                    tracing::debug!(language = %language, "workspace-scope query routed");
                    return Ok(session);
                }
            }
        }
        Err(RouterError::Unavailable("any".to_string()))
    }

    /// Shut every session down, in language-name order.
    pub async fn shutdown(&self) {
        let mut languages: Vec<&String> = self.sessions.keys().collect();
        languages.sort();
        for language in languages {
            if let Some(session) = self.sessions.get(language) {
                tracing::info!(language = %language, "shutting down language server");
                session.shutdown().await;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(
        servers: &[ServerConfig],
        sessions: HashMap<String, Arc<Session>>,
    ) -> Self {
        Self {
            sessions,
            extension_map: build_extension_map(servers),
            configured: servers.iter().map(|s| s.language.clone()).collect(),
            workspace_dir: std::env::temp_dir(),
        }
    }
}

/// Extensions are mapped in configuration order; on conflict the last
/// configured language wins and a warning names both.
fn build_extension_map(servers: &[ServerConfig]) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for config in servers {
        for ext in &config.extensions {
            let key = ext.trim_start_matches('.').to_string();
            if key.is_empty() {
                continue;
            }
            if let Some(previous) = map.insert(key.clone(), config.language.clone()) {
                if previous != config.language {
                    tracing::warn!(
                        "extension '.{key}' is configured for both '{previous}' and '{}'; using '{}'",
                        config.language,
                        config.language
                    );
                }
            }
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(language: &str, extensions: &[&str]) -> ServerConfig {
        ServerConfig {
            language: language.to_string(),
            command: format!("{language}-ls"),
            args: Vec::new(),
            extensions: extensions.iter().map(|e| e.to_string()).collect(),
        }
    }

    #[test]
    fn extension_map_strips_leading_dots() {
        let servers = vec![server("go", &[".go"]), server("python", &[".py", ".pyi"])];
        let map = build_extension_map(&servers);
        assert_eq!(map.get("go"), Some(&"go".to_string()));
        assert_eq!(map.get("py"), Some(&"python".to_string()));
        assert_eq!(map.get("pyi"), Some(&"python".to_string()));
        assert!(!map.contains_key("rs"));
    }

    #[test]
    fn extension_conflict_last_configured_wins() {
        let servers = vec![server("deno", &[".ts"]), server("typescript", &[".ts"])];
        let map = build_extension_map(&servers);
        assert_eq!(map.get("ts"), Some(&"typescript".to_string()));
    }

    #[test]
    fn unknown_extension_is_not_supported() {
        let servers = vec![server("go", &[".go"])];
        let router = Router::new_for_test(&servers, HashMap::new());

        let err = router.session_for_path(Path::new("/w/main.zig")).unwrap_err();
        assert!(matches!(err, RouterError::NotSupported(_)));

        let err = router.session_for_path(Path::new("/w/Makefile")).unwrap_err();
        assert!(matches!(err, RouterError::NotSupported(_)));
    }

    #[test]
    fn unknown_language_is_not_supported() {
        let servers = vec![server("go", &[".go"])];
        let router = Router::new_for_test(&servers, HashMap::new());
        let err = router.session_for_language("fortran").unwrap_err();
        assert!(matches!(err, RouterError::NotSupported(_)));
    }

    #[test]
    fn configured_language_without_session_is_unavailable() {
        // The language exists in configuration but its server never came
        // up, so the resolution error is Unavailable, not NotSupported.
        let servers = vec![server("go", &[".go"])];
        let router = Router::new_for_test(&servers, HashMap::new());

        let err = router.session_for_language("go").unwrap_err();
        assert!(matches!(err, RouterError::Unavailable(_)));

        let err = router.session_for_path(Path::new("/w/main.go")).unwrap_err();
        assert!(matches!(err, RouterError::Unavailable(_)));
    }

    #[test]
    fn workspace_session_requires_a_ready_session() {
        let router = Router::new_for_test(&[server("go", &[".go"])], HashMap::new());
        assert!(matches!(
            router.workspace_session().unwrap_err(),
            RouterError::Unavailable(_)
        ));
    }
}
