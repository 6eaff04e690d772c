//! Error taxonomy for the session daemon. Kinds match spec.md §7, not Rust type names 1:1 —
//! each subsystem gets its own enum so callers can match on the handful of variants they
//! actually need to recover from.

use std::path::PathBuf;

/// Cannot allocate a PTY, bind the listener socket, or spawn the child. Fatal; surfaced to the
/// invoker as a non-zero exit code.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("failed to open pty: {0}")]
    PtyOpen(#[source] std::io::Error),

    #[error("failed to spawn child process: {0}")]
    SpawnChild(#[source] std::io::Error),

    #[error("failed to bind socket at {path}: {source}")]
    SocketBind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create symlink for overlong socket path: {0}")]
    SymlinkCreate(#[source] std::io::Error),
}

/// Errors raised while the session is running. Most are recovered locally (see spec.md §7); only
/// `VtDead` and `ListenerDead` are fatal and trigger orderly shutdown.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("pty write timed out after {0:?}")]
    PtyWriteTimeout(std::time::Duration),

    #[error("child process exited")]
    ChildExited,

    #[error("pty master write failed: {0}")]
    VtDead(#[source] std::io::Error),

    #[error("listener socket failed: {0}")]
    ListenerDead(#[source] std::io::Error),

    #[error("failed to persist message body to {path}: {source}")]
    MessagePersist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Per-connection protocol errors. Never fatal to the session: malformed frames get an `ok:false`
/// response; only a desynchronized frame boundary forces a connection close.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("unknown frame kind byte: {0}")]
    UnknownFrameKind(u8),

    #[error("malformed json request: {0}")]
    MalformedJson(#[source] serde_json::Error),

    #[error("unknown request type: {0}")]
    UnknownRequestType(String),

    #[error("connection closed mid-frame")]
    Desynchronized,

    #[error("io error: {0}")]
    Io(#[source] std::io::Error),
}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> Self {
        ProtocolError::Io(e)
    }
}
