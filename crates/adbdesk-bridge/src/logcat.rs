use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{BridgeError, Result};
use crate::exec::{ExecutionResult, StreamHandle, ToolRunner};

/// Most recent lines retained for a consumer that falls behind; beyond this
/// the oldest buffered lines are dropped, never the read loop blocked.
pub const DEFAULT_RETAIN_LINES: usize = 10_000;

const STOP_GRACE: Duration = Duration::from_secs(2);
const CLEAR_TIMEOUT: Duration = Duration::from_secs(10);

/// Severity levels in logcat order. `Unknown` is the sentinel for lines the
/// parser could not make sense of; they still display.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Verbose,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
    Unknown,
}

impl Level {
    pub const ALL: [Level; 7] = [
        Level::Verbose,
        Level::Debug,
        Level::Info,
        Level::Warn,
        Level::Error,
        Level::Fatal,
        Level::Unknown,
    ];

    pub fn from_code(code: char) -> Self {
        match code {
            'V' => Level::Verbose,
            'D' => Level::Debug,
            'I' => Level::Info,
            'W' => Level::Warn,
            'E' => Level::Error,
            'F' => Level::Fatal,
            _ => Level::Unknown,
        }
    }

    pub fn code(&self) -> char {
        match self {
            Level::Verbose => 'V',
            Level::Debug => 'D',
            Level::Info => 'I',
            Level::Warn => 'W',
            Level::Error => 'E',
            Level::Fatal => 'F',
            Level::Unknown => '?',
        }
    }

    fn bit(&self) -> u8 {
        1 << (*self as u8)
    }
}

/// Set of enabled severity levels as a bitmask; cheap to copy into every
/// filter snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct LevelSet(u8);

impl LevelSet {
    pub fn all() -> Self {
        let mut set = LevelSet(0);
        for level in Level::ALL {
            set.insert(level);
        }
        set
    }

    pub fn empty() -> Self {
        LevelSet(0)
    }

    pub fn only(levels: &[Level]) -> Self {
        let mut set = LevelSet::empty();
        for level in levels {
            set.insert(*level);
        }
        set
    }

    pub fn insert(&mut self, level: Level) {
        self.0 |= level.bit();
    }

    pub fn remove(&mut self, level: Level) {
        self.0 &= !level.bit();
    }

    pub fn contains(&self, level: Level) -> bool {
        self.0 & level.bit() != 0
    }
}

impl Default for LevelSet {
    fn default() -> Self {
        LevelSet::all()
    }
}

/// Logcat output formats accepted by the tool's `-v` flag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Brief,
    Process,
    Tag,
    Raw,
    Time,
    Threadtime,
    Long,
}

impl LogFormat {
    pub fn as_arg(&self) -> &'static str {
        match self {
            LogFormat::Brief => "brief",
            LogFormat::Process => "process",
            LogFormat::Tag => "tag",
            LogFormat::Raw => "raw",
            LogFormat::Time => "time",
            LogFormat::Threadtime => "threadtime",
            LogFormat::Long => "long",
        }
    }
}

/// Log buffers selectable with `-b`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogBuffer {
    Main,
    System,
    Radio,
    Events,
    Crash,
    All,
}

impl LogBuffer {
    pub fn as_arg(&self) -> &'static str {
        match self {
            LogBuffer::Main => "main",
            LogBuffer::System => "system",
            LogBuffer::Radio => "radio",
            LogBuffer::Events => "events",
            LogBuffer::Crash => "crash",
            LogBuffer::All => "all",
        }
    }
}

#[derive(Clone, Debug)]
pub struct StartOptions {
    pub format: LogFormat,
    /// Empty means the device default buffer selection.
    pub buffers: Vec<LogBuffer>,
    pub retain_lines: usize,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            format: LogFormat::Threadtime,
            buffers: Vec::new(),
            retain_lines: DEFAULT_RETAIN_LINES,
        }
    }
}

/// Threadtime line: `MM-DD HH:MM:SS.mmm  PID  TID LEVEL TAG: message`.
static THREADTIME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<date>\d{2}-\d{2})\s+(?P<time>\d{2}:\d{2}:\d{2}\.\d{3})\s+(?P<pid>\d+)\s+(?P<tid>\d+)\s+(?P<level>[VDIWEF])\s+(?P<tag>[^:]*?)\s*:\s(?P<msg>.*)$",
    )
    .unwrap()
});

/// One parsed log line. Never mutated after creation; `raw` keeps the
/// original text for display when parsing failed.
#[derive(Clone, Debug, Serialize)]
pub struct LogLine {
    pub timestamp: String,
    pub pid: Option<u32>,
    pub tid: Option<u32>,
    pub level: Level,
    pub tag: String,
    pub message: String,
    pub raw: String,
    /// Which highlight keywords this line contains, in configured order.
    pub highlights: Vec<String>,
}

/// Best-effort parse; an unrecognized shape keeps the raw text under the
/// `Unknown` sentinel level so it still displays.
pub fn parse_log_line(raw: &str) -> LogLine {
    if let Some(caps) = THREADTIME_RE.captures(raw) {
        return LogLine {
            timestamp: format!("{} {}", &caps["date"], &caps["time"]),
            pid: caps["pid"].parse().ok(),
            tid: caps["tid"].parse().ok(),
            level: Level::from_code(caps["level"].chars().next().unwrap_or('?')),
            tag: caps["tag"].to_string(),
            message: caps["msg"].to_string(),
            raw: raw.to_string(),
            highlights: Vec::new(),
        };
    }
    LogLine {
        timestamp: String::new(),
        pid: None,
        tid: None,
        level: Level::Unknown,
        tag: String::new(),
        message: raw.to_string(),
        raw: raw.to_string(),
        highlights: Vec::new(),
    }
}

/// Live filter and highlight settings. The read loop takes a fresh snapshot
/// for every line, so an update applies to the very next line processed.
#[derive(Clone, Debug, Serialize)]
pub struct FilterConfig {
    pub enabled_levels: LevelSet,
    pub tag_filter: Option<String>,
    /// Case-insensitive substring match against tag + message.
    pub search_text: Option<String>,
    /// Insertion order is display priority.
    pub highlight_keywords: Vec<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            enabled_levels: LevelSet::all(),
            tag_filter: None,
            search_text: None,
            highlight_keywords: Vec::new(),
        }
    }
}

impl FilterConfig {
    pub fn matches(&self, line: &LogLine) -> bool {
        if !self.enabled_levels.contains(line.level) {
            return false;
        }
        if let Some(tag) = &self.tag_filter {
            if !line.tag.to_lowercase().contains(&tag.to_lowercase()) {
                return false;
            }
        }
        if let Some(search) = &self.search_text {
            let haystack = format!("{} {}", line.tag, line.message).to_lowercase();
            if !haystack.contains(&search.to_lowercase()) {
                return false;
            }
        }
        true
    }

    /// Annotate which keywords the line contains. Independent of filtering:
    /// keywords never hide a line.
    pub fn annotate(&self, mut line: LogLine) -> LogLine {
        if self.highlight_keywords.is_empty() {
            return line;
        }
        let haystack = format!("{} {}", line.tag, line.message).to_lowercase();
        line.highlights = self
            .highlight_keywords
            .iter()
            .filter(|keyword| haystack.contains(&keyword.to_lowercase()))
            .cloned()
            .collect();
        line
    }
}

/// Why a stream finished. A distinct condition, not an error: the caller
/// decides whether to retry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEnd {
    /// End of stream: the device detached or the tool exited.
    Detached,
    /// `stop()` was called.
    Stopped,
}

#[derive(Clone, Debug)]
pub enum StreamUpdate {
    Batch { lines: Vec<LogLine>, dropped: u64 },
    Ended(StreamEnd),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamPhase {
    Idle,
    Streaming,
    Stopping,
}

struct QueueInner {
    lines: VecDeque<LogLine>,
    dropped: u64,
    ended: Option<StreamEnd>,
}

/// Bounded hand-off between the read loop and one consumer. The producer
/// never waits; overflow drops the oldest buffered line and counts it.
struct LineQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
}

impl LineQueue {
    fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                lines: VecDeque::new(),
                dropped: 0,
                ended: None,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    fn push(&self, line: LogLine) {
        let mut inner = self.inner.lock().unwrap();
        if inner.lines.len() >= self.capacity {
            inner.lines.pop_front();
            inner.dropped += 1;
        }
        inner.lines.push_back(line);
        drop(inner);
        self.notify.notify_one();
    }

    fn finish(&self, end: StreamEnd) {
        let mut inner = self.inner.lock().unwrap();
        if inner.ended.is_none() {
            inner.ended = Some(end);
        }
        drop(inner);
        self.notify.notify_one();
    }

    async fn next_batch(&self) -> StreamUpdate {
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if !inner.lines.is_empty() {
                    let lines: Vec<LogLine> = inner.lines.drain(..).collect();
                    let dropped = std::mem::take(&mut inner.dropped);
                    return StreamUpdate::Batch { lines, dropped };
                }
                if let Some(end) = inner.ended {
                    return StreamUpdate::Ended(end);
                }
            }
            self.notify.notified().await;
        }
    }
}

/// Consumer side of an active capture. Single subscriber; batches arrive as
/// soon as lines pass the filter, already annotated.
#[derive(Clone)]
pub struct LogLines {
    queue: Arc<LineQueue>,
}

impl LogLines {
    pub async fn next_batch(&self) -> StreamUpdate {
        self.queue.next_batch().await
    }
}

struct ActiveStream {
    cancel_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    queue: Arc<LineQueue>,
}

/// Long-running capture of one device's log stream: idle → streaming →
/// stopping → idle. Filtering happens on the read loop but against a
/// configuration snapshot swapped in O(1) from the outside, so typing in a
/// search box never waits on the backlog.
pub struct LogStreamWorker {
    runner: Arc<ToolRunner>,
    device_id: String,
    filter_tx: watch::Sender<Arc<FilterConfig>>,
    active: Mutex<Option<ActiveStream>>,
    stopping: Mutex<bool>,
}

impl LogStreamWorker {
    pub fn new(runner: Arc<ToolRunner>, device_id: impl Into<String>) -> Self {
        let (filter_tx, _) = watch::channel(Arc::new(FilterConfig::default()));
        Self {
            runner,
            device_id: device_id.into(),
            filter_tx,
            active: Mutex::new(None),
            stopping: Mutex::new(false),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn phase(&self) -> StreamPhase {
        if *self.stopping.lock().unwrap() {
            return StreamPhase::Stopping;
        }
        match &*self.active.lock().unwrap() {
            Some(active) if !active.task.is_finished() => StreamPhase::Streaming,
            _ => StreamPhase::Idle,
        }
    }

    /// Replace the filter/highlight configuration. Constant-time, never
    /// waits on the read loop; the next line processed sees the new value.
    pub fn set_filter(&self, config: FilterConfig) {
        self.filter_tx.send_replace(Arc::new(config));
    }

    pub fn filter(&self) -> Arc<FilterConfig> {
        self.filter_tx.borrow().clone()
    }

    /// Open the stream and begin reading. Fails with `StreamActive` if a
    /// capture is already running for this worker.
    pub fn start(&self, options: StartOptions) -> Result<LogLines> {
        let mut active = self.active.lock().unwrap();
        if let Some(existing) = &*active {
            if !existing.task.is_finished() {
                return Err(BridgeError::StreamActive);
            }
        }

        let mut args: Vec<String> = vec![
            "-s".into(),
            self.device_id.clone(),
            "logcat".into(),
            "-v".into(),
            options.format.as_arg().into(),
        ];
        for buffer in &options.buffers {
            args.push("-b".into());
            args.push(buffer.as_arg().into());
        }

        let handle = self.runner.start_stream(&args)?;
        let queue = Arc::new(LineQueue::new(options.retain_lines));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(read_loop(
            handle,
            Arc::clone(&queue),
            self.filter_tx.subscribe(),
            cancel_rx,
        ));

        info!(device = %self.device_id, format = options.format.as_arg(), "log capture started");
        *active = Some(ActiveStream {
            cancel_tx,
            task,
            queue: Arc::clone(&queue),
        });
        Ok(LogLines { queue })
    }

    /// Cancel the stream and return only once the read loop has exited and
    /// the child process is terminated. Bounded by a grace period, after
    /// which the task is aborted and the child reaped on drop. Idempotent.
    pub async fn stop(&self) {
        let Some(active) = self.active.lock().unwrap().take() else {
            return;
        };
        *self.stopping.lock().unwrap() = true;

        let _ = active.cancel_tx.send(true);
        let mut task = active.task;
        if tokio::time::timeout(STOP_GRACE, &mut task).await.is_err() {
            warn!(device = %self.device_id, "log read loop did not exit within {STOP_GRACE:?}; aborting");
            task.abort();
            let _ = task.await;
            active.queue.finish(StreamEnd::Stopped);
        }

        *self.stopping.lock().unwrap() = false;
        info!(device = %self.device_id, "log capture stopped");
    }

    /// One-shot `logcat -c`: clear the device-side buffers.
    pub async fn clear(&self) -> Result<ExecutionResult> {
        self.runner
            .run(["-s", self.device_id.as_str(), "logcat", "-c"], CLEAR_TIMEOUT)
            .await
    }
}

async fn read_loop(
    mut handle: StreamHandle,
    queue: Arc<LineQueue>,
    filter_rx: watch::Receiver<Arc<FilterConfig>>,
    mut cancel_rx: watch::Receiver<bool>,
) {
    let end = loop {
        tokio::select! {
            changed = cancel_rx.changed() => {
                // A closed channel means the worker was dropped without a
                // stop call; shut down instead of spinning between lines.
                if changed.is_err() || *cancel_rx.borrow() {
                    break StreamEnd::Stopped;
                }
            }
            line = handle.next_line() => match line {
                Ok(Some(raw)) => {
                    let line = parse_log_line(&raw);
                    if line.level == Level::Unknown && !raw.is_empty() {
                        debug!("unparsed log line kept raw");
                    }
                    // Fresh snapshot per line: a filter update applies to
                    // the next line, regardless of backlog depth.
                    let config = filter_rx.borrow().clone();
                    if config.matches(&line) {
                        queue.push(config.annotate(line));
                    }
                }
                Ok(None) => break StreamEnd::Detached,
                Err(err) => {
                    debug!("log stream read failed: {err}");
                    break StreamEnd::Detached;
                }
            }
        }
    };
    handle.cancel().await;
    queue.finish(end);
}
