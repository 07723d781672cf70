use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failures while setting up the query socket.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("failed to create socket directory {path:?}: {source}")]
    SocketDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("another instance is already listening on {0:?}")]
    AlreadyRunning(PathBuf),

    #[error("failed to remove stale socket {path:?}: {source}")]
    StaleSocket {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind {path:?}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to register listener with the runtime: {0}")]
    Register(#[source] io::Error),
}
