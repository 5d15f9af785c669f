//! Line sources: follow a file by name.
//!
//! A `LineSource` tails one path and yields every complete line appended to
//! it, in order. It starts at the current end of the file (no backfill) and
//! keeps following the *name*: if the file is missing it waits for it, if it
//! is truncated it rewinds, and if it is replaced (rotation) it drains the old
//! handle and then reads the new file from the start. None of these surface
//! as errors.
//!
//! The follower wakes on filesystem events for the file's directory through
//! `notify` and falls back to a fixed poll, which also covers platforms or
//! mounts where no watch can be placed.
//!
//! Lines go through a bounded queue. When the consumer falls behind the
//! follower blocks instead of dropping lines. A line longer than
//! `max_line_bytes` is split at that length.

use std::ffi::OsString;
use std::fs::{File, Metadata};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, never, select, Receiver, RecvTimeoutError, Sender};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};

use crate::error::{LogmonResult, ValidationError};
use crate::shutdown::Shutdown;
use crate::worker::{join_worker, spawn_worker};

/// Line source configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LineSourceConfig {
    /// Lines buffered between the follower and its consumer.
    pub capacity: usize,
    /// How often the follower checks the file without a change event.
    pub poll_interval_ms: u64,
    /// Wake on filesystem events instead of waiting for the next poll.
    pub watch: bool,
    /// Longest line delivered in one piece.
    pub max_line_bytes: usize,
}

impl Default for LineSourceConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            poll_interval_ms: 250,
            watch: true,
            max_line_bytes: 1024 * 1024,
        }
    }
}

impl LineSourceConfig {
    /// Poll interval as a `Duration`.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub(crate) fn validate(&self) -> Result<(), ValidationError> {
        if self.capacity == 0 {
            return Err(ValidationError::ZeroCapacity {
                field: "line_source.capacity".to_string(),
            });
        }
        if self.poll_interval_ms == 0 {
            return Err(ValidationError::ZeroDuration {
                field: "line_source.poll_interval_ms".to_string(),
            });
        }
        if self.max_line_bytes == 0 {
            return Err(ValidationError::ZeroCapacity {
                field: "line_source.max_line_bytes".to_string(),
            });
        }
        Ok(())
    }
}

/// An ordered, effectively infinite stream of lines appended to one file.
#[derive(Debug)]
pub struct LineSource {
    path: PathBuf,
    lines: Receiver<String>,
    shutdown: Shutdown,
    join: Mutex<Option<JoinHandle<()>>>,
    watch: ChangeWatch,
}

impl LineSource {
    /// Starts following `path` from its current end.
    ///
    /// The end-of-file position is taken before this returns, so anything
    /// appended afterwards is delivered. A missing file is not an error.
    ///
    /// # Errors
    ///
    /// Only fails if the follower thread cannot be spawned.
    pub fn open(path: impl Into<PathBuf>, config: &LineSourceConfig) -> LogmonResult<Self> {
        let path = path.into();
        let (tx, lines) = bounded::<String>(config.capacity.max(1));
        let shutdown = Shutdown::new();

        let (watch, wake) = if config.watch {
            ChangeWatch::start(&path)
        } else {
            (ChangeWatch(None), never())
        };

        let mut follower = Follower::new(path.clone(), config, tx, wake, shutdown.clone());
        follower.attach_at_end();

        let handle = spawn_worker(format!("logmon-tail-{}", file_label(&path)), move || {
            follower.run();
        })?;

        Ok(Self {
            path,
            lines,
            shutdown,
            join: Mutex::new(Some(handle)),
            watch,
        })
    }

    /// Whether a filesystem watch backs this source.
    #[must_use]
    pub const fn is_watched(&self) -> bool {
        self.watch.0.is_some()
    }

    /// The followed path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Receiving end of the line queue, for use in `select!`.
    ///
    /// Callers selecting on this must also watch their own stop signal.
    #[must_use]
    pub fn lines(&self) -> &Receiver<String> {
        &self.lines
    }

    /// Blocks for the next line. `None` once stopped.
    #[must_use]
    pub fn recv(&self) -> Option<String> {
        if self.shutdown.is_triggered() {
            return None;
        }
        let line = select! {
            recv(self.lines) -> line => line.ok(),
            recv(self.shutdown.signal()) -> _ => None,
        };
        line.filter(|_| !self.shutdown.is_triggered())
    }

    /// Waits up to `timeout` for the next line. `None` on timeout or once stopped.
    #[must_use]
    pub fn recv_timeout(&self, timeout: Duration) -> Option<String> {
        if self.shutdown.is_triggered() {
            return None;
        }
        match self.lines.recv_timeout(timeout) {
            Ok(line) if !self.shutdown.is_triggered() => Some(line),
            Ok(_) | Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Whether `stop` has been called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_triggered()
    }

    /// Stops following, closes the file and ends the stream. Idempotent.
    pub fn stop(&self) {
        if self.shutdown.trigger() {
            join_worker(&self.join);
            tracing::debug!(path = %self.path.display(), "line source stopped");
        }
    }
}

impl Drop for LineSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Keeps the directory watch alive for the life of the source.
struct ChangeWatch(Option<Mutex<RecommendedWatcher>>);

impl std::fmt::Debug for ChangeWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ChangeWatch").field(&self.0.is_some()).finish()
    }
}

impl ChangeWatch {
    /// Watches the parent directory so creation and rotation are seen too.
    /// Events touching the file's name are coalesced into one pending wake.
    fn start(path: &Path) -> (Self, Receiver<()>) {
        let (wake_tx, wake_rx) = bounded::<()>(1);
        let name: Option<OsString> = path.file_name().map(ToOwned::to_owned);
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };

        let handler = move |event: notify::Result<notify::Event>| {
            let relevant = match (&event, &name) {
                (Ok(event), Some(name)) => {
                    event.paths.is_empty() || event.paths.iter().any(|p| p.file_name() == Some(name.as_os_str()))
                }
                _ => true,
            };
            if relevant {
                let _ = wake_tx.try_send(());
            }
        };
        let watcher = notify::recommended_watcher(handler).and_then(|mut watcher| {
            watcher.watch(dir, RecursiveMode::NonRecursive)?;
            Ok(watcher)
        });
        match watcher {
            Ok(watcher) => (Self(Some(Mutex::new(watcher))), wake_rx),
            Err(e) => {
                tracing::debug!(
                    path = %path.display(),
                    error = %e,
                    "no filesystem watch; polling only"
                );
                (Self(None), never())
            }
        }
    }
}

/// What identifies "the same file" across polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileId {
    dev: u64,
    ino: u64,
}

#[cfg(unix)]
fn file_id(meta: &Metadata) -> Option<FileId> {
    use std::os::unix::fs::MetadataExt;
    Some(FileId {
        dev: meta.dev(),
        ino: meta.ino(),
    })
}

#[cfg(not(unix))]
fn file_id(_meta: &Metadata) -> Option<FileId> {
    None
}

struct OpenFile {
    reader: BufReader<File>,
    id: Option<FileId>,
    offset: u64,
}

struct Follower {
    path: PathBuf,
    poll_interval: Duration,
    max_line_bytes: usize,
    tx: Sender<String>,
    wake: Receiver<()>,
    shutdown: Shutdown,
    file: Option<OpenFile>,
    partial: Vec<u8>,
    missing_logged: bool,
}

impl Follower {
    fn new(
        path: PathBuf,
        config: &LineSourceConfig,
        tx: Sender<String>,
        wake: Receiver<()>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            path,
            poll_interval: config.poll_interval(),
            max_line_bytes: config.max_line_bytes.max(1),
            tx,
            wake,
            shutdown,
            file: None,
            partial: Vec::new(),
            missing_logged: false,
        }
    }

    /// Opens the file positioned at its end, if it exists.
    fn attach_at_end(&mut self) {
        match self.open(true) {
            Ok(file) => self.file = Some(file),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "file absent; waiting for it");
                self.missing_logged = true;
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to open file");
            }
        }
    }

    fn open(&self, at_end: bool) -> io::Result<OpenFile> {
        let file = File::open(&self.path)?;
        let meta = file.metadata()?;
        let mut reader = BufReader::new(file);
        let offset = if at_end {
            reader.seek(SeekFrom::End(0))?
        } else {
            0
        };
        Ok(OpenFile {
            reader,
            id: file_id(&meta),
            offset,
        })
    }

    fn run(mut self) {
        loop {
            if self.shutdown.is_triggered() {
                return;
            }
            let progressed = match self.poll() {
                Ok(progressed) => progressed,
                Err(Stopped) => return,
            };
            if !progressed {
                select! {
                    recv(self.shutdown.signal()) -> _ => return,
                    recv(self.wake) -> woken => {
                        if woken.is_err() {
                            // Watcher gone; keep polling.
                            self.wake = never();
                        }
                    }
                    default(self.poll_interval) => {}
                }
            }
        }
    }

    /// One pass: handle rotation/truncation, then forward available lines.
    fn poll(&mut self) -> Result<bool, Stopped> {
        let meta = match std::fs::metadata(&self.path) {
            Ok(meta) => meta,
            Err(e) => {
                if e.kind() == io::ErrorKind::NotFound {
                    // Finish what the old handle still holds, then wait for the name.
                    let progressed = self.drain_current()?;
                    if self.file.take().is_some() || !self.missing_logged {
                        tracing::debug!(path = %self.path.display(), "file missing; waiting for it");
                        self.missing_logged = true;
                    }
                    self.partial.clear();
                    return Ok(progressed);
                }
                tracing::warn!(path = %self.path.display(), error = %e, "stat failed");
                return Ok(false);
            }
        };

        let current_id = file_id(&meta);
        let replaced = self
            .file
            .as_ref()
            .is_some_and(|f| f.id.is_some() && current_id.is_some() && f.id != current_id);

        let mut progressed = false;
        if replaced {
            progressed |= self.drain_current()?;
            self.file = None;
            self.partial.clear();
            tracing::debug!(path = %self.path.display(), "file replaced; reopening");
        }

        if self.file.is_none() {
            match self.open(false) {
                Ok(file) => {
                    self.file = Some(file);
                    self.missing_logged = false;
                }
                Err(e) => {
                    if e.kind() != io::ErrorKind::NotFound {
                        tracing::warn!(path = %self.path.display(), error = %e, "failed to open file");
                    }
                    return Ok(progressed);
                }
            }
        }

        if let Some(file) = self.file.as_mut() {
            if meta.len() < file.offset {
                tracing::debug!(
                    path = %self.path.display(),
                    offset = file.offset,
                    len = meta.len(),
                    "file truncated; rewinding"
                );
                if let Err(e) = file.reader.seek(SeekFrom::Start(0)) {
                    tracing::warn!(path = %self.path.display(), error = %e, "rewind failed");
                    self.file = None;
                    return Ok(progressed);
                }
                file.offset = 0;
                self.partial.clear();
            }
        }

        progressed |= self.drain_current()?;
        Ok(progressed)
    }

    /// Reads the current handle to EOF, forwarding complete lines.
    fn drain_current(&mut self) -> Result<bool, Stopped> {
        let Some(file) = self.file.as_mut() else {
            return Ok(false);
        };
        let mut progressed = false;
        loop {
            let budget = u64::try_from(self.max_line_bytes.saturating_sub(self.partial.len()).max(1)).unwrap_or(u64::MAX);
            let read = match (&mut file.reader).take(budget).read_until(b'\n', &mut self.partial) {
                Ok(read) => read,
                Err(e) => {
                    tracing::warn!(path = %self.path.display(), error = %e, "read failed");
                    return Ok(progressed);
                }
            };
            if read == 0 {
                return Ok(progressed);
            }
            file.offset += read as u64;
            progressed = true;
            if self.partial.last() != Some(&b'\n') {
                if self.partial.len() < self.max_line_bytes {
                    // Incomplete line; wait for the rest.
                    continue;
                }
                tracing::warn!(
                    path = %self.path.display(),
                    max_line_bytes = self.max_line_bytes,
                    "line exceeds the limit; splitting it"
                );
            }
            let line = take_line(&mut self.partial);
            select! {
                send(self.tx, line) -> res => {
                    if res.is_err() {
                        return Err(Stopped);
                    }
                }
                recv(self.shutdown.signal()) -> _ => return Err(Stopped),
            }
        }
    }
}

struct Stopped;

fn take_line(buf: &mut Vec<u8>) -> String {
    let mut end = buf.len();
    if end > 0 && buf[end - 1] == b'\n' {
        end -= 1;
    }
    if end > 0 && buf[end - 1] == b'\r' {
        end -= 1;
    }
    let line = String::from_utf8_lossy(&buf[..end]).into_owned();
    buf.clear();
    line
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().chars().take(16).collect())
        .unwrap_or_else(|| "file".to_string())
}

#[cfg(test)]
mod tests {
    use std::fs::OpenOptions;
    use std::io::Write;

    use tempfile::tempdir;

    use super::*;

    fn config() -> LineSourceConfig {
        LineSourceConfig {
            capacity: 64,
            poll_interval_ms: 10,
            ..LineSourceConfig::default()
        }
    }

    fn append(path: &Path, text: &str) {
        let mut f = OpenOptions::new().create(true).append(true).open(path).unwrap();
        f.write_all(text.as_bytes()).unwrap();
        f.flush().unwrap();
    }

    fn next(source: &LineSource) -> Option<String> {
        source.recv_timeout(Duration::from_secs(3))
    }

    #[test]
    fn test_follows_from_end_of_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "old line\n");

        let source = LineSource::open(&path, &config()).unwrap();
        append(&path, "first\nsecond\n");

        assert_eq!(next(&source).as_deref(), Some("first"));
        assert_eq!(next(&source).as_deref(), Some("second"));
    }

    #[test]
    fn test_partial_line_waits_for_newline() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "");
        let source = LineSource::open(&path, &config()).unwrap();

        append(&path, "hel");
        assert_eq!(source.recv_timeout(Duration::from_millis(100)), None);
        append(&path, "lo\r\n");
        assert_eq!(next(&source).as_deref(), Some("hello"));
    }

    #[test]
    fn test_waits_for_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("later.log");
        let source = LineSource::open(&path, &config()).unwrap();

        assert_eq!(source.recv_timeout(Duration::from_millis(50)), None);
        append(&path, "created\n");
        assert_eq!(next(&source).as_deref(), Some("created"));
    }

    #[test]
    fn test_truncation_rewinds() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "aaaaaaaaaaaaaaaaaaaa\n");
        let source = LineSource::open(&path, &config()).unwrap();
        append(&path, "before\n");
        assert_eq!(next(&source).as_deref(), Some("before"));

        OpenOptions::new().write(true).truncate(true).open(&path).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        append(&path, "after\n");
        assert_eq!(next(&source).as_deref(), Some("after"));
    }

    #[cfg(unix)]
    #[test]
    fn test_rotation_reopens_by_name() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "");
        let source = LineSource::open(&path, &config()).unwrap();

        append(&path, "one\n");
        assert_eq!(next(&source).as_deref(), Some("one"));

        std::fs::rename(&path, dir.path().join("app.log.1")).unwrap();
        append(&path, "two\n");
        assert_eq!(next(&source).as_deref(), Some("two"));
    }

    #[test]
    fn test_backpressure_loses_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("burst.log");
        append(&path, "");
        let source = LineSource::open(
            &path,
            &LineSourceConfig {
                capacity: 4,
                poll_interval_ms: 5,
                ..LineSourceConfig::default()
            },
        )
        .unwrap();

        let body: String = (0..200).map(|i| format!("line {i}\n")).collect();
        append(&path, &body);
        // Let the follower fill the queue and block.
        std::thread::sleep(Duration::from_millis(100));

        for i in 0..200 {
            assert_eq!(next(&source), Some(format!("line {i}")));
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_change_event_wakes_follower_before_poll() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "");
        let source = LineSource::open(
            &path,
            &LineSourceConfig {
                poll_interval_ms: 60_000,
                ..LineSourceConfig::default()
            },
        )
        .unwrap();
        assert!(source.is_watched());

        append(&path, "woken\n");
        assert_eq!(next(&source).as_deref(), Some("woken"));
    }

    #[test]
    fn test_polling_alone_still_follows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "");
        let source = LineSource::open(
            &path,
            &LineSourceConfig {
                watch: false,
                ..config()
            },
        )
        .unwrap();
        assert!(!source.is_watched());

        append(&path, "polled\n");
        assert_eq!(next(&source).as_deref(), Some("polled"));
    }

    #[test]
    fn test_overlong_line_is_split() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blob.log");
        append(&path, "");
        let source = LineSource::open(
            &path,
            &LineSourceConfig {
                max_line_bytes: 8,
                ..config()
            },
        )
        .unwrap();

        append(&path, "abcdefghijkl\nok\n");
        assert_eq!(next(&source).as_deref(), Some("abcdefgh"));
        assert_eq!(next(&source).as_deref(), Some("ijkl"));
        assert_eq!(next(&source).as_deref(), Some("ok"));
    }

    #[test]
    fn test_zero_line_limit_is_rejected() {
        let config = LineSourceConfig {
            max_line_bytes: 0,
            ..LineSourceConfig::default()
        };
        assert!(matches!(config.validate(), Err(ValidationError::ZeroCapacity { .. })));
    }

    #[test]
    fn test_stop_ends_stream() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "");
        let source = LineSource::open(&path, &config()).unwrap();
        append(&path, "queued\n");
        std::thread::sleep(Duration::from_millis(100));

        source.stop();
        source.stop();
        assert!(source.is_stopped());
        assert_eq!(source.recv(), None);
        assert_eq!(source.recv_timeout(Duration::from_millis(10)), None);
    }

    #[test]
    fn test_take_line_strips_terminators() {
        let mut buf = b"abc\r\n".to_vec();
        assert_eq!(take_line(&mut buf), "abc");
        assert!(buf.is_empty());
        let mut buf = b"\n".to_vec();
        assert_eq!(take_line(&mut buf), "");
    }
}
