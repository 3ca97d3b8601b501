//! LSP transport and session core for the polyglot broker.
//!
//! One [`Session`] per language-server subprocess: framed JSON-RPC
//! correlation, open-file version tracking, the diagnostic cache, and the
//! server→client dispatch. The [`Router`] owns the pool and resolves each
//! tool invocation to exactly one session.

pub mod apply;
pub mod codec;
pub mod protocol;

mod client;
mod handlers;
mod router;

pub use client::{
    DEFAULT_REQUEST_TIMEOUT, OpenFileInfo, Session, SessionError, SessionState,
};
pub use router::{Router, RouterError, ServerConfig};
