//! Tool adapters over the LSP session core.
//!
//! Each module implements one operation of the broker's upstream tool
//! surface, taking the session the router resolved and returning either a
//! textual result or a [`ToolError`] with a textual reason.

use std::path::{Path, PathBuf};

use polyglot_lsp::{Session, SessionError, apply::ApplyError};

pub mod bracket;
pub mod codelens;
pub mod definition;
pub mod diagnostics;
pub mod edit;
pub mod references;
pub mod rename;
pub mod symbols;

pub use bracket::{BracketGuardError, BracketViolation};
pub use edit::{EditKind, TextEditOp, apply_text_edits};

/// Errors surfaced by tool operations.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// The caller's input is self-inconsistent; surfaced verbatim.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// An edit would break a bracket pair; the batch was not applied.
    #[error(transparent)]
    BracketGuard(#[from] BracketGuardError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Apply(#[from] ApplyError),
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The server answered with a shape the broker does not know.
    #[error("unexpected response shape from language server: {0}")]
    UnexpectedResponse(String),
}

/// Opens documents in a language server ahead of edit work. Implemented by
/// [`Session`]; tests substitute a mock.
pub trait FileOpener {
    fn open_file(
        &self,
        path: &Path,
    ) -> impl std::future::Future<Output = Result<(), SessionError>> + Send;
}

impl FileOpener for Session {
    async fn open_file(&self, path: &Path) -> Result<(), SessionError> {
        Session::open_file(self, path).await
    }
}

/// Resolve a user-supplied path to an absolute one without touching
/// symlinks.
pub(crate) fn absolutize(path: &Path) -> Result<PathBuf, ToolError> {
    std::path::absolute(path).map_err(|source| ToolError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Prefix each line of `content` with its 1-based line number, starting at
/// `start`.
pub(crate) fn add_line_numbers(content: &str, start: u32) -> String {
    content
        .lines()
        .enumerate()
        .map(|(i, line)| format!("{}: {line}", start + i as u32))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_numbers_start_where_asked() {
        assert_eq!(add_line_numbers("a\nb", 10), "10: a\n11: b");
        assert_eq!(add_line_numbers("only", 1), "1: only");
    }
}
