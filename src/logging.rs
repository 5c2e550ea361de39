//! Tracing setup shared by the `navlink` and `navsim-server` binaries.
//!
//! Logs always go to stderr: stdout belongs to the JSON-RPC stream in the
//! server and to command output in the CLI.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

/// Rotated log files kept next to the active one.
const KEEP_LOG_FILES: u32 = 3;

/// Platform data directory for navlink.
///
/// - macOS: `~/Library/Application Support/navlink/`
/// - Linux: `$XDG_DATA_HOME/navlink/` (fallback `~/.local/share/navlink/`)
///
/// Falls back to `~/.navlink/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("navlink");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".navlink")
}

/// Install the global subscriber.
///
/// `RUST_LOG` overrides `config.level`. With `config.file`, logs are also
/// written to `<data dir>/<app>.log` after rotating older files. Returns an
/// error if a subscriber is already installed or the log file cannot be
/// opened.
pub fn init_tracing(app: &str, config: &LogConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("navlink=info,warn"));

    let log_path = if config.file {
        let dir = data_dir();
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{app}.log"));
        rotate_log_file(&path, KEEP_LOG_FILES);
        Some(path)
    } else {
        None
    };

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false);

    let result = match (&log_path, config.json) {
        (Some(path), true) => builder
            .json()
            .with_writer(std::io::stderr.and(FlushingWriter::open(path)?))
            .try_init(),
        (Some(path), false) => builder
            .with_writer(std::io::stderr.and(FlushingWriter::open(path)?))
            .try_init(),
        (None, true) => builder.json().with_writer(std::io::stderr).try_init(),
        (None, false) => builder.with_writer(std::io::stderr).try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    tracing::info!(
        app,
        version = env!("CARGO_PKG_VERSION"),
        log_file = ?log_path.as_ref().map(|p| p.display().to_string()),
        pid = std::process::id(),
        "=== {app} starting ==="
    );
    Ok(())
}

/// Rotate log files: `app.log` → `app.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A file writer that flushes after every write, so a crash loses nothing.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn open(path: &Path) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
        })
    }
}

impl Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = f.write(buf)?;
        f.flush()?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        f.flush()
    }
}

impl<'a> fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
