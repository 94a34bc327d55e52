//! Worker pool for bulk load/unload jobs.
//!
//! Jobs are blocking POSIX I/O against the backing store, so the pool uses
//! plain `std::thread`s rather than tokio tasks — individual filesystem ops
//! still run on the caller's (tokio) thread, matching "individual
//! filesystem ops run on the caller's thread".

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use echofs_core::{BackendRegistry, FileKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Load,
    Unload,
}

pub struct Job {
    pub task_id: u32,
    pub kind: JobKind,
    pub path: String,
    /// For `Load`: the directory in the backing store to stage from.
    /// For `Unload`: the directory to write back into.
    pub dir: PathBuf,
}

/// Terminal/in-flight state of one task, observed by `status` RPCs.
#[derive(Debug, Clone)]
pub enum TaskState {
    Pending,
    InProgress,
    Success,
    Error(String),
}

/// `Mutex<HashMap<u32, TaskState>>`: concurrent `status` RPCs
/// observe `pending` -> `in_progress` -> terminal, never skipping backward.
#[derive(Default)]
pub struct TaskTracker {
    tasks: Mutex<HashMap<u32, TaskState>>,
    next_id: AtomicU32,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    pub fn alloc_id(&self) -> u32 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.tasks.lock().unwrap().insert(id, TaskState::Pending);
        id
    }

    fn set(&self, id: u32, state: TaskState) {
        self.tasks.lock().unwrap().insert(id, state);
    }

    pub fn get(&self, id: u32) -> Option<TaskState> {
        self.tasks.lock().unwrap().get(&id).cloned()
    }
}

impl Clone for TaskState {
    fn clone(&self) -> Self {
        match self {
            TaskState::Pending => TaskState::Pending,
            TaskState::InProgress => TaskState::InProgress,
            TaskState::Success => TaskState::Success,
            TaskState::Error(m) => TaskState::Error(m.clone()),
        }
    }
}

/// Owns `workers` OS threads pulling [`Job`]s off a shared channel.
pub struct WorkerPool {
    tx: Sender<Job>,
    tracker: Arc<TaskTracker>,
    handles: Vec<std::thread::JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(workers: u32, registry: Arc<BackendRegistry>, tracker: Arc<TaskTracker>) -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));

        let handles = (0..workers.max(1))
            .map(|_| {
                let rx = rx.clone();
                let registry = registry.clone();
                let tracker = tracker.clone();
                std::thread::spawn(move || worker_loop(rx, registry, tracker))
        })
            .collect();

        Self { tx, tracker, handles }
    }

    /// Enqueues a job and returns its freshly allocated task id
    /// immediately, "enqueue a Job onto the worker pool and
    /// return its freshly allocated task id immediately".
    pub fn submit(&self, kind: JobKind, path: String, dir: PathBuf) -> u32 {
        let task_id = self.tracker.alloc_id();
        let job = Job { task_id, kind, path, dir };
        // A closed receiver (all workers panicked) would mean the daemon is
        // already in an unrecoverable state; sending into it is a
        // programmer error worth surfacing loudly.
        self.tx.send(job).expect("worker pool receiver closed");
        task_id
    }

    pub fn status(&self, task_id: u32) -> Option<TaskState> {
        self.tracker.get(task_id)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for h in self.handles.drain(..) {
            let _ = h.join();
        }
    }
}

fn worker_loop(rx: Arc<Mutex<Receiver<Job>>>, registry: Arc<BackendRegistry>, tracker: Arc<TaskTracker>) {
    loop {
        let job = {
            let rx = rx.lock().unwrap();
            match rx.recv() {
                Ok(job) => job,
                Err(_) => return, // all senders dropped; pool is shutting down
            }
        };

        tracker.set(job.task_id, TaskState::InProgress);

        let result = match job.kind {
            JobKind::Load => registry
                .load_file(&job.dir.join(job.path.trim_start_matches('/')), &job.path, FileKind::Persistent)
                .map(|_| ()),
            JobKind::Unload => registry.unload(&job.path, &job.dir),
        };

        match result {
            Ok(()) => {
                tracing::info!(task_id = job.task_id, path = %job.path, "job completed");
                tracker.set(job.task_id, TaskState::Success);
            }
            Err(e) => {
                tracing::error!(task_id = job.task_id, path = %job.path, error = %e, "job failed");
                tracker.set(job.task_id, TaskState::Error(e.to_string()));
            }
        }
    }
}
