//! Broker configuration: one JSON document naming the workspace and the
//! language servers to run.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use polyglot_lsp::ServerConfig;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Root of the workspace every session is initialized against.
    pub workspace_dir: PathBuf,
    #[serde(default)]
    pub language_servers: Vec<ServerConfig>,
}

/// Read, validate, and normalize the configuration at `path`.
pub fn load(path: &Path) -> Result<Config> {
    tracing::info!(path = %path.display(), "loading configuration");
    let data = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file '{}'", path.display()))?;
    let config: Config = serde_json::from_str(&data)
        .with_context(|| format!("failed to parse config file '{}'", path.display()))?;
    validate(config)
}

fn validate(mut config: Config) -> Result<Config> {
    if config.workspace_dir.as_os_str().is_empty() {
        bail!("workspaceDir is required");
    }
    config.workspace_dir = std::path::absolute(&config.workspace_dir).with_context(|| {
        format!(
            "failed to resolve workspaceDir '{}'",
            config.workspace_dir.display()
        )
    })?;
    if !config.workspace_dir.is_dir() {
        bail!(
            "workspaceDir '{}' does not exist",
            config.workspace_dir.display()
        );
    }

    if config.language_servers.is_empty() {
        tracing::warn!("no language servers configured");
    }

    let mut seen = HashSet::new();
    for server in &mut config.language_servers {
        if server.language.is_empty() {
            bail!("language name is required for every server entry");
        }
        if !seen.insert(server.language.clone()) {
            bail!("language '{}' is configured more than once", server.language);
        }
        if server.command.is_empty() {
            bail!("command is required for language '{}'", server.language);
        }
        ensure_command_resolvable(&server.command, &server.language)?;

        if server.extensions.is_empty() {
            tracing::warn!(language = %server.language, "no file extensions configured");
        }
        for ext in &mut server.extensions {
            if !ext.starts_with('.') {
                tracing::warn!(
                    language = %server.language,
                    "extension '{ext}' is missing its leading dot, adding it"
                );
                *ext = format!(".{ext}");
            }
        }
    }

    Ok(config)
}

/// The command must resolve on PATH or be an existing absolute path.
fn ensure_command_resolvable(command: &str, language: &str) -> Result<()> {
    if which::which(command).is_ok() {
        return Ok(());
    }
    let as_path = Path::new(command);
    if as_path.is_absolute() && as_path.exists() {
        return Ok(());
    }
    bail!(
        "command '{command}' for language '{language}' was not found in PATH \
         and is not an existing absolute path"
    );
}
