use miette::Diagnostic;
use thiserror::Error;

use echofs_core::EchoFsError;

/// Operational errors of the daemon binary itself — config/CLI/socket
/// failures. Distinct from [`EchoFsError`] (the closed engine taxonomy,
/// which governs engine-level results): a [`DaemonError::Core`] wraps an
/// [`EchoFsError`] that escaped the engine at the RPC or load/unload
/// boundary.
#[derive(Debug, Error, Diagnostic)]
pub enum DaemonError {
    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{message}")]
    #[diagnostic(help("check --root-dir, --mount-dir and the daxfs path for each backend"))]
    Init { message: String },

    #[error(transparent)]
    Core(#[from] EchoFsError),
}
