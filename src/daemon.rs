//! Daemon process lifecycle: config -> logging -> engine
//! construction -> resource preloads -> RPC listener -> accept loop.

use std::collections::HashMap;
use std::sync::Arc;

use echofs_core::{BackendRegistry, FileKind, PmemPool};

use crate::config::DaemonConfig;
use crate::error::DaemonError;
use crate::rpc::{BackendHandle, EchoFsApiImpl};
use crate::worker::{TaskTracker, WorkerPool};

/// One configured NVRAM-NVML backend: its pool, namespace, and worker
/// pool, wired together by [`build_backends`].
pub struct Backend {
    pub registry: Arc<BackendRegistry>,
    pub workers: Arc<WorkerPool>,
}

/// Constructs one [`PmemPool`] + [`BackendRegistry`] + [`WorkerPool`] per
/// configured backend, all sharing one daemon-wide [`TaskTracker`] so that
/// task ids stay unique and monotonic across backends, per "Task
/// identifiers... monotonic 32-bit counters allocated by the daemon".
pub fn build_backends(config: &DaemonConfig) -> Result<HashMap<String, Backend>, DaemonError> {
    let tracker = Arc::new(TaskTracker::new());
    let mut out = HashMap::new();
    for backend_cfg in &config.backends {
        let capacity = backend_cfg.capacity_bytes()?;
        let slot_size = backend_cfg.segment_size_bytes()?;
        let daxfs_path = std::path::Path::new(&backend_cfg.daxfs);

        let pool = PmemPool::open(Some(daxfs_path), capacity, slot_size).map_err(DaemonError::Core)?;
        let registry = Arc::new(BackendRegistry::new(Arc::new(pool)));
        let workers = Arc::new(WorkerPool::new(config.global_settings.workers, registry.clone(), tracker.clone()));

        out.insert(backend_cfg.id.clone(), Backend { registry, workers });
    }
    Ok(out)
}

/// Runs the `resources` preloads configured at startup. I/O errors on the
/// backing store during a preload are logged and the resource is skipped
/// rather than aborting daemon startup.
pub fn run_preloads(config: &DaemonConfig, backends: &HashMap<String, Backend>) {
    for resource in &config.resources {
        let Some(backend) = backends.get(&resource.backend) else {
            tracing::warn!(path = %resource.path, backend = %resource.backend, "preload references unknown backend, skipping");
            continue;
        };
        let kind = if resource.flags.contains("temporary") {
            FileKind::Temporary
        } else {
            FileKind::Persistent
        };
        let src = std::path::Path::new(&config.global_settings.root_dir).join(resource.path.trim_start_matches('/'));
        let result = if src.is_dir() {
            backend.registry.load_dir(&src, &resource.path, kind).map(|_| ())
        } else {
            backend.registry.load_file(&src, &resource.path, kind)
        };
        match result {
            Ok(()) => tracing::info!(path = %resource.path, backend = %resource.backend, "preloaded resource"),
            Err(e) => tracing::error!(path = %resource.path, backend = %resource.backend, error = %e, "preload failed, skipping"),
        }
    }
}

/// Runs the daemon's accept loop on the calling task until `SIGTERM`.
pub async fn run_serve(config: &DaemonConfig, backends: HashMap<String, Backend>) -> Result<(), DaemonError> {
    let sock_path = config.socket_path();
    if std::path::Path::new(sock_path).exists() {
        let _ = std::fs::remove_file(sock_path);
    }
    let listener = tokio::net::UnixListener::bind(sock_path).map_err(|e| DaemonError::Io {
        context: format!("binding Unix socket {sock_path}"),
        source: e,
    })?;

    let rpc_backends: HashMap<String, BackendHandle> = backends
        .iter()
        .map(|(id, b)| {
            (
                id.clone(),
                BackendHandle {
                    root_dir: std::path::PathBuf::from(&config.global_settings.root_dir),
                    pool: b.workers.clone(),
                },
            )
        })
        .collect();
    let handler = EchoFsApiImpl::new(rpc_backends);

    tracing::info!(sock = %sock_path, backends = backends.len(), "daemon listening");

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).map_err(|e| DaemonError::Io {
        context: "registering SIGTERM handler".into(),
        source: e,
    })?;

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let handler = handler.clone();
                        tokio::spawn(crate::rpc::dispatch_connection(stream, handler));
                    }
                    Err(e) => tracing::error!(error = %e, "RPC accept error"),
                }
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
                break;
            }
        }
    }

    let _ = std::fs::remove_file(sock_path);
    tracing::info!("daemon exited");
    Ok(())
}

/// Re-execs the current binary with `--foreground`, detached from the
/// controlling terminal and placed in its own process group so a
/// terminal hangup doesn't take the daemon down with it.
pub fn spawn_background(config_file: &std::path::Path) -> Result<(), DaemonError> {
    use std::os::unix::process::CommandExt;
    use std::process::{Command, Stdio};

    let exe = std::env::current_exe().map_err(|e| DaemonError::Io {
        context: "getting current executable path".into(),
        source: e,
    })?;

    Command::new(exe)
        .args(["--config-file", &config_file.to_string_lossy(), "--foreground"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn()
        .map_err(|e| DaemonError::Io {
            context: "spawning daemon process".into(),
            source: e,
        })?;

    Ok(())
}
