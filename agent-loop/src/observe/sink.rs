//! Log sinks. Each sink owns one destination and reports failure through its
//! return value instead of an error, so one broken destination cannot stop
//! the others.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::observe::entry::LogEntry;

/// A destination for structured entries.
pub trait Sink: Send {
    fn name(&self) -> &str;

    /// Deliver one entry. Returns `false` when the entry was dropped.
    fn write(&mut self, entry: &LogEntry) -> bool;

    /// Release resources. Called once, when the multiplexer shuts down.
    fn close(&mut self) {}
}

/// Human-readable lines on stderr.
#[derive(Debug, Default)]
pub struct ConsoleSink;

impl Sink for ConsoleSink {
    fn name(&self) -> &str {
        "console"
    }

    fn write(&mut self, entry: &LogEntry) -> bool {
        let mut stderr = io::stderr().lock();
        writeln!(stderr, "{}", entry.to_console_line()).is_ok()
    }
}

/// Append-only JSONL file, one entry per line.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    file: File,
}

impl FileSink {
    /// Open (creating if needed) the log file in append mode.
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create log dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open log file {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Sink for FileSink {
    fn name(&self) -> &str {
        "file"
    }

    fn write(&mut self, entry: &LogEntry) -> bool {
        let mut line = entry.to_json_line();
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .and_then(|()| self.file.flush())
            .is_ok()
    }
}

/// Named pipe carrying the same JSONL lines as the file sink.
///
/// Writes never block: the pipe is opened non-blocking per entry, and an
/// absent reader or a full pipe drops the entry.
#[derive(Debug)]
pub struct PipeSink {
    path: PathBuf,
}

impl PipeSink {
    /// Create a fresh pipe at `path`.
    ///
    /// A stale pipe is replaced. A regular file at the path is moved aside
    /// to `<path>.bak` first.
    pub fn create(path: &Path) -> Result<Self> {
        if let Ok(meta) = fs::symlink_metadata(path) {
            if is_fifo(&meta) {
                fs::remove_file(path)
                    .with_context(|| format!("remove stale pipe {}", path.display()))?;
            } else {
                let mut backup = path.as_os_str().to_owned();
                backup.push(".bak");
                let backup = PathBuf::from(backup);
                fs::rename(path, &backup).with_context(|| {
                    format!("move {} aside to {}", path.display(), backup.display())
                })?;
                warn!(path = %path.display(), backup = %backup.display(), "moved regular file off pipe path");
            }
        }
        make_fifo(path).with_context(|| format!("create pipe {}", path.display()))?;
        debug!(path = %path.display(), "created log pipe");
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Sink for PipeSink {
    fn name(&self) -> &str {
        "pipe"
    }

    fn write(&mut self, entry: &LogEntry) -> bool {
        let mut line = entry.to_json_line();
        line.push('\n');
        match open_nonblocking(&self.path) {
            Ok(mut pipe) => pipe.write_all(line.as_bytes()).is_ok(),
            // No reader attached (ENXIO) or the pipe vanished.
            Err(_) => false,
        }
    }

    fn close(&mut self) {
        if let Err(err) = fs::remove_file(&self.path)
            && err.kind() != io::ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), err = %err, "failed to remove log pipe");
        }
    }
}

#[cfg(unix)]
fn is_fifo(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::FileTypeExt;
    meta.file_type().is_fifo()
}

#[cfg(not(unix))]
fn is_fifo(_meta: &fs::Metadata) -> bool {
    false
}

#[cfg(unix)]
fn make_fifo(path: &Path) -> io::Result<()> {
    use nix::sys::stat::Mode;
    nix::unistd::mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(io::Error::from)
}

#[cfg(not(unix))]
fn make_fifo(_path: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "named pipes are only supported on unix",
    ))
}

#[cfg(unix)]
fn open_nonblocking(path: &Path) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;

    use nix::fcntl::OFlag;
    OpenOptions::new()
        .write(true)
        .custom_flags(OFlag::O_NONBLOCK.bits())
        .open(path)
}

#[cfg(not(unix))]
fn open_nonblocking(_path: &Path) -> io::Result<File> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "named pipes are only supported on unix",
    ))
}

/// Boxed callback invoked with every entry.
pub type LogCallback = Box<dyn FnMut(&LogEntry) + Send>;

/// User callback. A panicking callback drops that entry only.
pub struct CallbackSink {
    id: u64,
    callback: LogCallback,
}

impl CallbackSink {
    pub fn new(id: u64, callback: LogCallback) -> Self {
        Self { id, callback }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Sink for CallbackSink {
    fn name(&self) -> &str {
        "callback"
    }

    fn write(&mut self, entry: &LogEntry) -> bool {
        let callback = &mut self.callback;
        panic::catch_unwind(AssertUnwindSafe(|| callback(entry))).is_ok()
    }
}
