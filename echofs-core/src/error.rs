//! The closed error taxonomy shared across every core component.
//!
//! Each variant owns its own single user-facing message string.
//! `ErrorKind` is the stable, match-friendly projection that callers outside
//! this crate (the daemon's RPC layer, a future FUSE binding) use to map
//! onto their own wire/errno codes without depending on `EchoFsError`'s
//! exact shape.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EchoFsError {
    #[error("internal error: {message}")]
    Internal { message: String },

    #[error("invalid arguments: {message}")]
    InvalidArguments { message: String },

    #[error("bad request: {message}")]
    BadRequest { message: String },

    #[error("no such task: {task_id}")]
    NoSuchTask { task_id: u32 },

    #[error("task {task_id} is still pending")]
    TaskPending { task_id: u32 },

    #[error("task {task_id} is still in progress")]
    TaskInProgress { task_id: u32 },

    #[error("no such path: {path}")]
    NoSuchPath { path: String },

    #[error("path already imported: {path}")]
    PathAlreadyImported { path: String },

    #[error("pool is full")]
    PoolFull,
}

/// Stable classification of an [`EchoFsError`], independent of its message.
///
/// This is the thing that actually crosses component boundaries — a FUSE
/// binding maps it to an errno, the RPC layer maps it to a `status` code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Success,
    InternalError,
    InvalidArguments,
    BadRequest,
    NoSuchTask,
    TaskPending,
    TaskInProgress,
    NoSuchPath,
    PathAlreadyImported,
    PoolFull,
}

impl EchoFsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EchoFsError::Internal {.. } => ErrorKind::InternalError,
            EchoFsError::InvalidArguments {.. } => ErrorKind::InvalidArguments,
            EchoFsError::BadRequest {.. } => ErrorKind::BadRequest,
            EchoFsError::NoSuchTask {.. } => ErrorKind::NoSuchTask,
            EchoFsError::TaskPending {.. } => ErrorKind::TaskPending,
            EchoFsError::TaskInProgress {.. } => ErrorKind::TaskInProgress,
            EchoFsError::NoSuchPath {.. } => ErrorKind::NoSuchPath,
            EchoFsError::PathAlreadyImported {.. } => ErrorKind::PathAlreadyImported,
            EchoFsError::PoolFull => ErrorKind::PoolFull,
        }
    }

    pub fn pool_full() -> Self {
        EchoFsError::PoolFull
    }

    pub fn no_such_path(path: impl Into<String>) -> Self {
        EchoFsError::NoSuchPath { path: path.into() }
    }

    pub fn path_already_imported(path: impl Into<String>) -> Self {
        EchoFsError::PathAlreadyImported { path: path.into() }
    }

    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        EchoFsError::InvalidArguments {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EchoFsError>;
