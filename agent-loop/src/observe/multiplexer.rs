//! Fan-out of structured log entries to every configured sink.

use std::cell::Cell;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use chrono::Local;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::core::types::LogLevel;
use crate::observe::entry::LogEntry;
use crate::observe::sink::{
    CallbackSink, ConsoleSink, FileSink, LogCallback, PipeSink, Sink,
};

pub const PIPE_FILE_NAME: &str = "ralph-stream.fifo";
const COMPONENT: &str = "multiplexer";

thread_local! {
    /// Set while this thread runs callbacks.
    static IN_CALLBACK: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as dispatching callbacks until dropped.
struct CallbackScope;

impl CallbackScope {
    fn enter() -> Self {
        IN_CALLBACK.set(true);
        CallbackScope
    }
}

impl Drop for CallbackScope {
    fn drop(&mut self) {
        IN_CALLBACK.set(false);
    }
}

/// JSONL file name for a session.
pub fn log_file_name(session_id: &str) -> String {
    format!("ralph-{session_id}.jsonl")
}

/// Default session id, local time `YYYYmmdd-HHMMSS`.
pub fn default_session_id() -> String {
    Local::now().format("%Y%m%d-%H%M%S").to_string()
}

type SharedCallback = Arc<Mutex<CallbackSink>>;

struct MuxState {
    sinks: Vec<Box<dyn Sink>>,
    callbacks: Vec<SharedCallback>,
    next_callback_id: u64,
    closed: bool,
}

impl MuxState {
    fn new(sinks: Vec<Box<dyn Sink>>) -> Self {
        Self {
            sinks,
            callbacks: Vec::new(),
            next_callback_id: 1,
            closed: false,
        }
    }
}

/// Shared logging front door.
///
/// Sink writes are serialized by one mutex, so per-sink ordering matches call
/// order. A sink that fails drops that entry and the loop moves on to the
/// next sink. Callbacks run after that mutex is released, so a callback may
/// log through the same multiplexer; entries it logs reach the sinks but not
/// the callbacks again. Logging after [`shutdown`](Self::shutdown) is a no-op.
pub struct ObservabilityMultiplexer {
    min_level: LogLevel,
    session_id: String,
    log_file: Option<PathBuf>,
    pipe_path: Option<PathBuf>,
    dropped: AtomicU64,
    state: Mutex<MuxState>,
}

impl ObservabilityMultiplexer {
    pub fn builder(log_dir: impl Into<PathBuf>) -> MultiplexerBuilder {
        MultiplexerBuilder::new(log_dir)
    }

    /// A multiplexer with no sinks. Callbacks and extra sinks can still be
    /// attached.
    pub fn silent() -> Self {
        Self {
            min_level: LogLevel::Debug,
            session_id: default_session_id(),
            log_file: None,
            pipe_path: None,
            dropped: AtomicU64::new(0),
            state: Mutex::new(MuxState::new(Vec::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MuxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn min_level(&self) -> LogLevel {
        self.min_level
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Deliver a prepared entry to every sink, then to every callback.
    pub fn emit(&self, entry: LogEntry) {
        if entry.level < self.min_level {
            return;
        }
        let callbacks = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            let mut failed = 0u64;
            for sink in &mut state.sinks {
                if !sink.write(&entry) {
                    failed += 1;
                }
            }
            self.dropped.fetch_add(failed, Ordering::Relaxed);
            if IN_CALLBACK.get() || state.callbacks.is_empty() {
                return;
            }
            state.callbacks.clone()
        };

        let _scope = CallbackScope::enter();
        for callback in &callbacks {
            let mut callback = callback.lock().unwrap_or_else(PoisonError::into_inner);
            if !callback.write(&entry) {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Build and deliver an entry with optional metadata.
    pub fn log(
        &self,
        level: LogLevel,
        component: &str,
        message: impl Into<String>,
        metadata: Option<Map<String, Value>>,
    ) {
        let mut entry = LogEntry::new(level, component, message);
        if let Some(metadata) = metadata {
            entry = entry.with_metadata(metadata);
        }
        self.emit(entry);
    }

    pub fn debug(&self, component: &str, message: impl Into<String>) {
        self.log(LogLevel::Debug, component, message, None);
    }

    pub fn info(&self, component: &str, message: impl Into<String>) {
        self.log(LogLevel::Info, component, message, None);
    }

    pub fn warn(&self, component: &str, message: impl Into<String>) {
        self.log(LogLevel::Warn, component, message, None);
    }

    pub fn error(&self, component: &str, message: impl Into<String>) {
        self.log(LogLevel::Error, component, message, None);
    }

    pub fn critical(&self, component: &str, message: impl Into<String>) {
        self.log(LogLevel::Critical, component, message, None);
    }

    /// Attach an extra sink after construction.
    pub fn add_sink(&self, sink: Box<dyn Sink>) {
        let mut state = self.lock();
        if !state.closed {
            state.sinks.push(sink);
        }
    }

    /// Register a callback. Returns the id to pass to [`remove_callback`](Self::remove_callback).
    pub fn add_callback(&self, callback: LogCallback) -> u64 {
        let mut state = self.lock();
        let id = state.next_callback_id;
        state.next_callback_id += 1;
        state
            .callbacks
            .push(Arc::new(Mutex::new(CallbackSink::new(id, callback))));
        id
    }

    pub fn remove_callback(&self, id: u64) -> bool {
        let mut state = self.lock();
        let before = state.callbacks.len();
        state.callbacks.retain(|callback| {
            callback.lock().unwrap_or_else(PoisonError::into_inner).id() != id
        });
        state.callbacks.len() != before
    }

    /// Writes any sink rejected since construction.
    pub fn dropped_writes(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn log_file_path(&self) -> Option<&Path> {
        self.log_file.as_deref()
    }

    /// Pipe path, `None` when the pipe is disabled or could not be created.
    pub fn pipe_path(&self) -> Option<&Path> {
        self.pipe_path.as_deref()
    }

    /// Close every sink (removing the pipe). Idempotent.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        for sink in &mut state.sinks {
            sink.close();
        }
        state.sinks.clear();
        state.callbacks.clear();
        debug!(session = %self.session_id, "multiplexer shut down");
    }
}

impl Drop for ObservabilityMultiplexer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Configures which sinks a multiplexer starts with.
pub struct MultiplexerBuilder {
    log_dir: PathBuf,
    min_level: LogLevel,
    console: bool,
    file: bool,
    pipe: bool,
    session_id: Option<String>,
    extra: Vec<Box<dyn Sink>>,
}

impl MultiplexerBuilder {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            min_level: LogLevel::Info,
            console: true,
            file: true,
            pipe: false,
            session_id: None,
            extra: Vec::new(),
        }
    }

    pub fn min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    pub fn console(mut self, enabled: bool) -> Self {
        self.console = enabled;
        self
    }

    pub fn file(mut self, enabled: bool) -> Self {
        self.file = enabled;
        self
    }

    pub fn pipe(mut self, enabled: bool) -> Self {
        self.pipe = enabled;
        self
    }

    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn sink(mut self, sink: Box<dyn Sink>) -> Self {
        self.extra.push(sink);
        self
    }

    /// Open the configured sinks.
    ///
    /// The JSONL file is required when enabled. A pipe that cannot be created
    /// is disabled and the failure is recorded as a warning entry.
    pub fn build(self) -> Result<ObservabilityMultiplexer> {
        let session_id = self.session_id.unwrap_or_else(default_session_id);
        let mut sinks: Vec<Box<dyn Sink>> = Vec::new();
        if self.console {
            sinks.push(Box::new(ConsoleSink));
        }

        let mut log_file = None;
        if self.file {
            let path = self.log_dir.join(log_file_name(&session_id));
            sinks.push(Box::new(FileSink::create(&path)?));
            log_file = Some(path);
        }

        let mut pipe_path = None;
        let mut pipe_failure = None;
        if self.pipe {
            let path = self.log_dir.join(PIPE_FILE_NAME);
            match std::fs::create_dir_all(&self.log_dir)
                .map_err(anyhow::Error::from)
                .and_then(|()| PipeSink::create(&path))
            {
                Ok(pipe) => {
                    sinks.push(Box::new(pipe));
                    pipe_path = Some(path);
                }
                Err(err) => {
                    warn!(path = %path.display(), err = %format!("{err:#}"), "log pipe disabled");
                    pipe_failure = Some(format!("{err:#}"));
                }
            }
        }

        sinks.extend(self.extra);

        let mux = ObservabilityMultiplexer {
            min_level: self.min_level,
            session_id,
            log_file,
            pipe_path,
            dropped: AtomicU64::new(0),
            state: Mutex::new(MuxState::new(sinks)),
        };
        if let Some(reason) = pipe_failure {
            mux.warn(
                COMPONENT,
                format!("could not create log pipe: {reason}; pipe disabled"),
            );
        }
        Ok(mux)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::{Arc, Mutex, mpsc};
    use std::thread;
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;
    use crate::test_support::{FailingSink, RecordingSink};

    fn quiet_builder(dir: &Path) -> MultiplexerBuilder {
        ObservabilityMultiplexer::builder(dir)
            .console(false)
            .session_id("test")
    }

    #[test]
    fn entries_below_min_level_are_filtered() {
        let temp = TempDir::new().expect("tempdir");
        let recorder = RecordingSink::new();
        let mux = quiet_builder(temp.path())
            .min_level(LogLevel::Warn)
            .sink(Box::new(recorder.clone()))
            .build()
            .expect("build");

        mux.info("loop", "ignored");
        mux.warn("loop", "kept");
        mux.critical("loop", "kept too");

        let messages: Vec<String> = recorder.entries().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["kept", "kept too"]);
    }

    #[test]
    fn broken_sink_does_not_block_siblings() {
        let temp = TempDir::new().expect("tempdir");
        let recorder = RecordingSink::new();
        let mux = quiet_builder(temp.path())
            .sink(Box::new(FailingSink))
            .sink(Box::new(recorder.clone()))
            .build()
            .expect("build");

        mux.info("loop", "first");
        mux.error("loop", "second");

        assert_eq!(recorder.entries().len(), 2);
        assert_eq!(mux.dropped_writes(), 2);
        let path = mux.log_file_path().expect("file path").to_path_buf();
        let contents = fs::read_to_string(path).expect("read log");
        assert_eq!(contents.lines().count(), 2);
    }

    #[test]
    fn file_is_named_after_session() {
        let temp = TempDir::new().expect("tempdir");
        let mux = quiet_builder(temp.path()).build().expect("build");
        assert_eq!(
            mux.log_file_path().expect("file"),
            temp.path().join("ralph-test.jsonl")
        );
        assert!(temp.path().join("ralph-test.jsonl").exists());
    }

    #[test]
    fn logging_after_shutdown_is_noop() {
        let temp = TempDir::new().expect("tempdir");
        let recorder = RecordingSink::new();
        let mux = quiet_builder(temp.path())
            .sink(Box::new(recorder.clone()))
            .build()
            .expect("build");
        mux.info("loop", "before");
        mux.shutdown();
        mux.info("loop", "after");
        mux.shutdown();

        assert!(mux.is_closed());
        assert_eq!(recorder.entries().len(), 1);
    }

    #[test]
    fn callbacks_can_be_removed() {
        let mux = ObservabilityMultiplexer::silent();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = mux.add_callback(Box::new(move |entry: &LogEntry| {
            sink.lock().expect("lock").push(entry.message.clone());
        }));

        mux.info("loop", "one");
        assert!(mux.remove_callback(id));
        assert!(!mux.remove_callback(id));
        mux.info("loop", "two");

        assert_eq!(*seen.lock().expect("lock"), vec!["one".to_string()]);
    }

    #[test]
    fn callbacks_can_log_through_the_same_multiplexer() {
        let recorder = RecordingSink::new();
        let mux = Arc::new(ObservabilityMultiplexer::silent());
        mux.add_sink(Box::new(recorder.clone()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_by_callback = Arc::clone(&seen);
        let weak = Arc::downgrade(&mux);
        mux.add_callback(Box::new(move |entry: &LogEntry| {
            seen_by_callback
                .lock()
                .expect("lock")
                .push(entry.message.clone());
            if let Some(mux) = weak.upgrade() {
                mux.info("audit", format!("saw {}", entry.message));
            }
        }));

        let (done_tx, done_rx) = mpsc::channel();
        let worker_mux = Arc::clone(&mux);
        thread::spawn(move || {
            worker_mux.info("loop", "hello");
            let _ = done_tx.send(());
        });
        done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("logging from a callback must not block");

        assert_eq!(recorder.messages(), vec!["hello", "saw hello"]);
        assert_eq!(*seen.lock().expect("lock"), vec!["hello".to_string()]);
        mux.info("loop", "again");
        assert_eq!(seen.lock().expect("lock").len(), 2);
    }

    #[test]
    fn metadata_reaches_sinks() {
        let recorder = RecordingSink::new();
        let mux = ObservabilityMultiplexer::silent();
        mux.add_sink(Box::new(recorder.clone()));
        let mut meta = Map::new();
        meta.insert("attempt".into(), Value::from(2));
        mux.log(LogLevel::Info, "orchestrator", "spawned", Some(meta));

        let entries = recorder.entries();
        assert_eq!(entries[0].metadata.as_ref().expect("meta")["attempt"], 2);
    }

    #[cfg(unix)]
    #[test]
    fn pipe_is_removed_on_shutdown() {
        let temp = TempDir::new().expect("tempdir");
        let mux = quiet_builder(temp.path()).pipe(true).build().expect("build");
        let pipe = mux.pipe_path().expect("pipe").to_path_buf();
        assert!(pipe.exists());

        mux.info("loop", "no reader, dropped silently");
        assert_eq!(mux.dropped_writes(), 1);
        let log = fs::read_to_string(mux.log_file_path().expect("file")).expect("read");
        assert!(log.contains("no reader, dropped silently"));

        mux.shutdown();
        assert!(!pipe.exists());
    }

    #[cfg(unix)]
    #[test]
    fn pipe_failure_is_logged_to_file() {
        let temp = TempDir::new().expect("tempdir");
        // A directory squatting on the pipe path cannot be moved aside into
        // an existing backup directory, so pipe creation fails.
        fs::create_dir_all(temp.path().join(PIPE_FILE_NAME)).expect("squatter");
        fs::create_dir_all(temp.path().join(format!("{PIPE_FILE_NAME}.bak/inner")))
            .expect("backup squatter");

        let mux = quiet_builder(temp.path()).pipe(true).build().expect("build");
        assert!(mux.pipe_path().is_none());

        let log = fs::read_to_string(mux.log_file_path().expect("file")).expect("read");
        assert!(log.contains("pipe disabled"));
        assert!(log.contains("\"level\":\"WARNING\""));
    }
}
