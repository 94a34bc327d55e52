//! Client<->daemon RPC surface.
//!
//! `roam`/`roam-stream` frame and dispatch requests over a Unix-domain
//! stream socket. Three request kinds: `load_path`, `unload_path`,
//! `status` — matching `LOAD_PATH`, `UNLOAD_PATH`, `STATUS`.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use facet::Facet;
use roam_stream::{Client, Connector, HandshakeConfig, NoDispatcher, accept};
use tokio::net::UnixStream;

use crate::worker::{JobKind, TaskState, WorkerPool};

#[derive(Debug, Clone, Facet)]
pub struct TaskStatusReply {
    /// One of `success`, `task_pending`, `task_in_progress`, or a
    /// terminal error code string.
    pub status: String,
}

#[roam::service]
pub trait EchoFsApi {
    async fn load_path(&self, backend_id: String, path: String, offset: i64, size: u64) -> Result<u32, String>;
    async fn unload_path(&self, backend_id: String, path: String, offset: i64, size: u64) -> Result<u32, String>;
    async fn status(&self, task_id: u32) -> Result<TaskStatusReply, String>;
}

pub struct DaemonConnector {
    pub path: PathBuf,
}

impl Connector for DaemonConnector {
    type Transport = UnixStream;

    async fn connect(&self) -> io::Result<UnixStream> {
        UnixStream::connect(&self.path).await
    }
}

pub type EchoFsClient = EchoFsApiClient<Client<DaemonConnector, NoDispatcher>>;

/// One backend, as seen by the RPC layer: its worker pool and the
/// directory used as the backing-store root for load/unload.
pub struct BackendHandle {
    pub root_dir: PathBuf,
    pub pool: Arc<WorkerPool>,
}

#[derive(Clone)]
pub struct EchoFsApiImpl {
    backends: Arc<std::collections::HashMap<String, BackendHandle>>,
}

impl EchoFsApiImpl {
    pub fn new(backends: std::collections::HashMap<String, BackendHandle>) -> Self {
        Self { backends: Arc::new(backends) }
    }

    fn backend(&self, backend_id: &str) -> Result<&BackendHandle, String> {
        self.backends.get(backend_id).ok_or_else(|| "bad_request: unknown backend id".into())
    }
}

impl EchoFsApi for EchoFsApiImpl {
    async fn load_path(&self, _cx: &roam::Context, backend_id: String, path: String, _offset: i64, _size: u64) -> Result<u32, String> {
        if path.is_empty() {
            return Err("bad_request: empty path".into());
        }
        let backend = self.backend(&backend_id)?;
        let task_id = backend.pool.submit(JobKind::Load, path, backend.root_dir.clone());
        Ok(task_id)
    }

    async fn unload_path(&self, _cx: &roam::Context, backend_id: String, path: String, _offset: i64, _size: u64) -> Result<u32, String> {
        if path.is_empty() {
            return Err("bad_request: empty path".into());
        }
        let backend = self.backend(&backend_id)?;
        let task_id = backend.pool.submit(JobKind::Unload, path, backend.root_dir.clone());
        Ok(task_id)
    }

    async fn status(&self, _cx: &roam::Context, task_id: u32) -> Result<TaskStatusReply, String> {
        for backend in self.backends.values() {
            if let Some(state) = backend.pool.status(task_id) {
                let status = match state {
                    TaskState::Pending => "task_pending".to_string(),
                    TaskState::InProgress => "task_in_progress".to_string(),
                    TaskState::Success => "success".to_string(),
                    TaskState::Error(msg) => msg,
                };
                return Ok(TaskStatusReply { status });
            }
        }
        Err("no_such_task".into())
    }
}

/// Binds a `UnixListener` at `sock_path` and serves `handler` until the
/// listener errs or the process is signalled to stop (the accept loop
/// itself lives in [`crate::daemon::run_serve`], which also handles
/// `SIGTERM`; this helper only dispatches one accepted connection).
pub async fn dispatch_connection(stream: UnixStream, handler: EchoFsApiImpl) {
    let dispatcher = EchoFsApiDispatcher::new(handler);
    match accept(stream, HandshakeConfig::default(), dispatcher).await {
        Ok((_handle, _incoming, driver)) => {
            if let Err(e) = driver.run().await {
                tracing::error!(error = %e, "RPC driver error");
            }
        }
        Err(e) => tracing::error!(error = %e, "RPC handshake failed"),
    }
}
