//! `tracing-subscriber` setup for the daemon binary.
//!
//! The subscriber is installed once at process start, before the config
//! file (and therefore the log-file path) has been read. A
//! [`DeferredFileWriter`] lets startup logging go somewhere sane (discarded,
//! or stderr when `--foreground`) and be redirected to the configured log
//! file once [`DeferredFileHandle::activate`] is called.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;

/// A `MakeWriter` that discards writes until activated with a file path.
#[derive(Clone)]
pub struct DeferredFileWriter {
    inner: Arc<Mutex<Option<File>>>,
}

/// Handle returned by [`DeferredFileWriter::new`] — call [`Self::activate`]
/// once the log-file path is known.
#[derive(Clone)]
pub struct DeferredFileHandle {
    inner: Arc<Mutex<Option<File>>>,
}

impl DeferredFileWriter {
    pub fn new() -> (Self, DeferredFileHandle) {
        let inner = Arc::new(Mutex::new(None));
        (
            Self { inner: inner.clone() },
            DeferredFileHandle { inner },
        )
    }
}

impl DeferredFileHandle {
    /// Opens `path` in append mode and redirects all future log writes to
    /// it.
    pub fn activate(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        *self.inner.lock().unwrap() = Some(file);
        Ok(())
    }
}

pub struct DeferredWriter {
    inner: Arc<Mutex<Option<File>>>,
}

impl std::io::Write for DeferredWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut guard = self.inner.lock().unwrap();
        if let Some(ref mut f) = *guard {
            f.write(buf)
        } else {
            Ok(buf.len()) // discard until activated
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut guard = self.inner.lock().unwrap();
        if let Some(ref mut f) = *guard { f.flush() } else { Ok(()) }
    }
}

impl<'a> MakeWriter<'a> for DeferredFileWriter {
    type Writer = DeferredWriter;

    fn make_writer(&'a self) -> Self::Writer {
        DeferredWriter { inner: self.inner.clone() }
    }
}

/// Installs the global subscriber. `debug` forces the `debug` filter;
/// otherwise `RUST_LOG` is honored with a `echofs_ng=info` default
/// directive. Returns the handle used to activate file logging
/// once `--log-file`/the config's `log-file` is resolved.
pub fn init(debug: bool, foreground: bool) -> DeferredFileHandle {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive("echofs_ng=info".parse().expect("valid log directive"))
    };

    let (writer, handle) = DeferredFileWriter::new();

    if foreground {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).with_writer(writer).init();
    }

    handle
}
