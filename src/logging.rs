use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::paths;
use crate::progress::OutputMode;

pub const LOG_FILE: &str = "cannery.log";

// ── DeferredFileWriter ───────────────────────────────────

/// A `MakeWriter` that initially discards writes, then logs to a file
/// once activated via `handle.set_file(path)`.
///
/// The subscriber is installed before we know which instance the command
/// targets; the instance's log file is attached afterwards.
#[derive(Clone)]
pub struct DeferredFileWriter {
    inner: Arc<Mutex<Option<File>>>,
}

/// Handle returned by `DeferredFileWriter::new()`. Call `set_file` to activate.
#[derive(Clone)]
pub struct DeferredFileHandle {
    inner: Arc<Mutex<Option<File>>>,
}

fn lock(inner: &Mutex<Option<File>>) -> MutexGuard<'_, Option<File>> {
    inner.lock().unwrap_or_else(|e| e.into_inner())
}

impl DeferredFileWriter {
    pub fn new() -> (Self, DeferredFileHandle) {
        let inner = Arc::new(Mutex::new(None));
        (
            Self {
                inner: inner.clone(),
            },
            DeferredFileHandle { inner },
        )
    }
}

impl DeferredFileHandle {
    /// Open `path` in append mode and start writing to it.
    pub fn set_file(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        *lock(&self.inner) = Some(file);
        Ok(())
    }

    /// Log into `<instance>/logs/cannery.log`.
    pub fn activate_for_instance(&self, instance_dir: &Path) -> std::io::Result<()> {
        self.set_file(&paths::logs_dir(instance_dir).join(LOG_FILE))
    }
}

/// Writer returned by `MakeWriter::make_writer`: either writes to the
/// file or discards (when not yet activated).
pub struct DeferredWriter {
    inner: Arc<Mutex<Option<File>>>,
}

impl std::io::Write for DeferredWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match lock(&self.inner).as_mut() {
            Some(f) => f.write(buf),
            None => Ok(buf.len()), // discard
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match lock(&self.inner).as_mut() {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for DeferredFileWriter {
    type Writer = DeferredWriter;

    fn make_writer(&'a self) -> Self::Writer {
        DeferredWriter {
            inner: self.inner.clone(),
        }
    }
}

// ── Subscriber ───────────────────────────────────────────

/// Terminal filter for an output mode. Progress bars own the terminal in
/// Normal and Quiet mode; stray log lines there break indicatif's redraws.
fn terminal_filter(mode: OutputMode) -> EnvFilter {
    match mode {
        OutputMode::Verbose => EnvFilter::new("cannery=debug"),
        OutputMode::Normal | OutputMode::Quiet => EnvFilter::new("off"),
        OutputMode::Plain => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("cannery=info")),
    }
}

/// Install the global subscriber: a stderr layer filtered by `mode` and a
/// deferred file layer that always captures `cannery=debug`.
pub fn init(mode: OutputMode) -> DeferredFileHandle {
    let terminal_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(terminal_filter(mode));

    let (file_writer, file_handle) = DeferredFileWriter::new();
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer)
        .with_filter(EnvFilter::new("cannery=debug"));

    tracing_subscriber::registry()
        .with(terminal_layer)
        .with(file_layer)
        .init();

    file_handle
}
