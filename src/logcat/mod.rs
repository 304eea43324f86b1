//! Background logcat watcher.
//!
//! A dedicated thread reads the device log line by line, parses each record,
//! and hands the message to every listener whose pattern matches from the
//! start of the message. Listeners are kept in a copy-on-write snapshot: the
//! registry lock is held only while the list is swapped, never while
//! handlers run, so a handler may register or remove listeners itself.

pub mod stream;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Condvar, LazyLock, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use regex::{Captures, Regex};
use tracing::{debug, error, info, warn};

use crate::errors::WatchError;
pub use stream::{AdbLogStream, LogStream};

const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(3);

static LOGLINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[ ]+(?P<timestamp>[0-9]+\.[0-9]+)[ ]+(?P<pid>[0-9]+)[ ]+(?P<tid>[0-9]+)[ ]+(?P<priority>.)[ ]+(?P<tag>[^:]*):[ ](?P<message>.*)$",
    )
    .expect("valid logcat record regex")
});

/// One parsed `logcat -v epoch` record.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord<'a> {
    pub timestamp: f64,
    pub pid: u32,
    pub tid: u32,
    pub priority: char,
    pub tag: &'a str,
    pub message: &'a str,
}

/// Parse `<epoch> <pid> <tid> <priority> <tag>: <message>`.
///
/// Returns `None` for anything else (headers, `--------- beginning of`).
pub fn parse_line(line: &str) -> Option<LogRecord<'_>> {
    let caps = LOGLINE_RE.captures(line)?;
    Some(LogRecord {
        timestamp: caps.name("timestamp")?.as_str().parse().ok()?,
        pid: caps.name("pid")?.as_str().parse().ok()?,
        tid: caps.name("tid")?.as_str().parse().ok()?,
        priority: caps.name("priority")?.as_str().chars().next()?,
        tag: caps.name("tag")?.as_str(),
        message: caps.name("message")?.as_str(),
    })
}

/// Called with the captures of a matching message.
pub type Handler = Arc<dyn Fn(&Captures<'_>) + Send + Sync>;

/// Identifies one registered handler for removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerHandle {
    pub pattern: String,
    pub id: u64,
}

#[derive(Clone)]
struct PatternListeners {
    regex: Regex,
    handlers: Vec<(u64, Handler)>,
}

/// Set once every handler for the current line has run.
struct LineReady {
    ready: Mutex<bool>,
    cond: Condvar,
}

impl LineReady {
    fn new() -> Self {
        Self {
            ready: Mutex::new(true),
            cond: Condvar::new(),
        }
    }

    fn set(&self, value: bool) {
        *self.ready.lock().unwrap_or_else(PoisonError::into_inner) = value;
        if value {
            self.cond.notify_all();
        }
    }

    fn wait(&self, timeout: Duration) -> bool {
        let guard = self.ready.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |ready| !*ready)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

struct Shared {
    listeners: Mutex<Arc<Vec<PatternListeners>>>,
    next_id: AtomicU64,
    line_ready: LineReady,
    /// Bumped on every stop; a reader exits once its generation is stale.
    generation: AtomicU64,
    lines_dispatched: AtomicU64,
}

impl Shared {
    fn snapshot(&self) -> Arc<Vec<PatternListeners>> {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn dispatch(&self, message: &str) {
        self.line_ready.set(false);
        for entry in self.snapshot().iter() {
            let Some(caps) = entry.regex.captures(message) else {
                continue;
            };
            // Leftmost match: a match at 0 exists iff the first one starts there.
            if caps.get(0).is_none_or(|m| m.start() != 0) {
                continue;
            }
            for (_, handler) in &entry.handlers {
                handler(&caps);
            }
        }
        self.lines_dispatched.fetch_add(1, Ordering::Relaxed);
        self.line_ready.set(true);
    }
}

struct Reader {
    stream: Arc<dyn LogStream>,
    handle: JoinHandle<()>,
    done: Receiver<()>,
}

/// Tails a [`LogStream`] on its own thread and dispatches matching messages.
///
/// The listener registry outlives any one stream: [`attach`](Self::attach)
/// swaps in a new stream after a device restart and keeps every listener.
pub struct LogWatcher {
    shared: Arc<Shared>,
    reader: Mutex<Option<Reader>>,
}

impl LogWatcher {
    /// A watcher with no stream attached yet.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                listeners: Mutex::new(Arc::new(Vec::new())),
                next_id: AtomicU64::new(1),
                line_ready: LineReady::new(),
                generation: AtomicU64::new(0),
                lines_dispatched: AtomicU64::new(0),
            }),
            reader: Mutex::new(None),
        }
    }

    /// Create a watcher and start reading `stream` immediately.
    pub fn start(stream: Arc<dyn LogStream>) -> Result<Self, WatchError> {
        let watcher = Self::new();
        watcher.attach(stream)?;
        Ok(watcher)
    }

    /// Stop the current reader, if any, and start reading `stream`.
    pub fn attach(&self, stream: Arc<dyn LogStream>) -> Result<(), WatchError> {
        self.stop();
        let generation = self.shared.generation.load(Ordering::SeqCst);
        let (done_tx, done_rx) = mpsc::channel();

        let thread_shared = Arc::clone(&self.shared);
        let thread_stream = Arc::clone(&stream);
        let handle = thread::Builder::new()
            .name("logcat-watcher".to_string())
            .spawn(move || {
                process_logs(&thread_shared, thread_stream.as_ref(), generation);
                let _ = done_tx.send(());
            })
            .map_err(WatchError::Spawn)?;

        *self.reader.lock().unwrap_or_else(PoisonError::into_inner) = Some(Reader {
            stream,
            handle,
            done: done_rx,
        });
        info!(generation, "log watcher started");
        Ok(())
    }

    /// Register `handler` for messages matching `pattern` from their start.
    ///
    /// Handlers for one pattern run in registration order; patterns are
    /// visited in the order they were first registered.
    pub fn add_listener<F>(&self, pattern: Regex, handler: F) -> ListenerHandle
    where
        F: Fn(&Captures<'_>) + Send + Sync + 'static,
    {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let key = pattern.as_str().to_string();
        let mut slot = self
            .shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut next: Vec<PatternListeners> = slot.as_ref().clone();
        match next.iter_mut().find(|e| e.regex.as_str() == key) {
            Some(entry) => entry.handlers.push((id, Arc::new(handler))),
            None => next.push(PatternListeners {
                regex: pattern,
                handlers: vec![(id, Arc::new(handler))],
            }),
        }
        *slot = Arc::new(next);
        debug!(pattern = %key, id, "listener added");
        ListenerHandle { pattern: key, id }
    }

    /// Remove a handler. Removing one that is not registered is reported but harmless.
    pub fn remove_listener(&self, handle: &ListenerHandle) -> Result<(), WatchError> {
        let mut slot = self
            .shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut next: Vec<PatternListeners> = slot.as_ref().clone();
        let removed = next
            .iter_mut()
            .find(|e| e.regex.as_str() == handle.pattern)
            .and_then(|entry| {
                let pos = entry.handlers.iter().position(|(id, _)| *id == handle.id)?;
                entry.handlers.remove(pos);
                Some(())
            });
        if removed.is_none() {
            error!(pattern = %handle.pattern, id = handle.id, "listener is not registered");
            return Err(WatchError::NotRegistered {
                pattern: handle.pattern.clone(),
                id: handle.id,
            });
        }
        next.retain(|e| !e.handlers.is_empty());
        *slot = Arc::new(next);
        debug!(pattern = %handle.pattern, id = handle.id, "listener removed");
        Ok(())
    }

    pub fn listener_count(&self) -> usize {
        self.shared.snapshot().iter().map(|e| e.handlers.len()).sum()
    }

    /// Wait until no line is mid-dispatch. Returns false on timeout.
    pub fn wait_line_ready(&self, timeout: Duration) -> bool {
        self.shared.line_ready.wait(timeout)
    }

    /// Number of records dispatched so far, across every attached stream.
    pub fn lines_dispatched(&self) -> u64 {
        self.shared.lines_dispatched.load(Ordering::Relaxed)
    }

    pub fn pause(&self) {
        if let Some(reader) = self.reader.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            reader.stream.pause();
        }
    }

    pub fn resume(&self) {
        if let Some(reader) = self.reader.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            reader.stream.resume();
        }
    }

    pub fn is_running(&self) -> bool {
        self.reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Stop reading and join the thread for at most three seconds.
    ///
    /// A thread stuck in an upstream read past that is abandoned. Listeners
    /// stay registered.
    pub fn stop(&self) {
        let Some(reader) = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        reader.stream.stop();

        let start = Instant::now();
        match reader.done.recv_timeout(STOP_JOIN_TIMEOUT) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                let _ = reader.handle.join();
                info!(elapsed_ms = start.elapsed().as_millis() as u64, "log watcher stopped");
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("log watcher did not stop in time; abandoning thread");
            }
        }
    }
}

impl Default for LogWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LogWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn process_logs(shared: &Shared, stream: &dyn LogStream, generation: u64) {
    let lines = match stream.lines() {
        Ok(lines) => lines,
        Err(e) => {
            error!(error = %e, "failed to open log stream");
            return;
        }
    };
    for line in lines {
        if shared.generation.load(Ordering::SeqCst) != generation {
            break;
        }
        if line.is_empty() {
            continue;
        }
        let Some(record) = parse_line(&line) else {
            continue;
        };
        shared.dispatch(record.message);
    }
    debug!(generation, "log stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ChannelLogStream;
    use std::sync::atomic::AtomicUsize;

    const SAMPLE: &str =
        "         1553110400.424  5583  5658 D NostalgicRacer: com.example.Renderer@912fb8.onSurfaceChanged 480x320";

    fn record(message: &str) -> String {
        format!("  1553110400.424  5583  5658 I AndroidRLTask: {message}")
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&Captures<'_>) + Send + Sync + 'static) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        (hits, move |_: &Captures<'_>| {
            h.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn wait_dispatched(watcher: &LogWatcher, n: u64) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while watcher.lines_dispatched() < n && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(watcher.wait_line_ready(Duration::from_secs(1)));
    }

    // ── Record parsing ──

    #[test]
    fn parses_epoch_record() {
        let r = parse_line(SAMPLE).unwrap();
        assert_eq!(r.timestamp, 1553110400.424);
        assert_eq!(r.pid, 5583);
        assert_eq!(r.tid, 5658);
        assert_eq!(r.priority, 'D');
        assert_eq!(r.tag, "NostalgicRacer");
        assert_eq!(r.message, "com.example.Renderer@912fb8.onSurfaceChanged 480x320");
    }

    #[test]
    fn rejects_non_records() {
        assert!(parse_line("--------- beginning of main").is_none());
        assert!(parse_line("").is_none());
        // no leading space
        assert!(parse_line("1553110400.424 5583 5658 D Tag: msg").is_none());
        assert!(parse_line("  1553110400 5583 5658 D Tag: msg").is_none());
    }

    // ── Dispatch ──

    #[test]
    fn handler_runs_once_per_matching_line() {
        let (tx, stream) = ChannelLogStream::new();
        let watcher = LogWatcher::start(Arc::new(stream)).unwrap();
        let (hits, handler) = counter();
        watcher.add_listener(Regex::new("^reward: ").unwrap(), handler);

        tx.send(record("reward: 1.0")).unwrap();
        tx.send(record("unrelated")).unwrap();
        tx.send(record("reward: 2.0")).unwrap();
        wait_dispatched(&watcher, 3);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        watcher.stop();
    }

    #[test]
    fn malformed_lines_are_dropped() {
        let (tx, stream) = ChannelLogStream::new();
        let watcher = LogWatcher::start(Arc::new(stream)).unwrap();
        let (hits, handler) = counter();
        watcher.add_listener(Regex::new(".*").unwrap(), handler);

        tx.send("garbage".to_string()).unwrap();
        tx.send(String::new()).unwrap();
        tx.send("--------- beginning of main".to_string()).unwrap();
        tx.send(record("real")).unwrap();
        wait_dispatched(&watcher, 1);
        assert_eq!(watcher.lines_dispatched(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        watcher.stop();
    }

    #[test]
    fn pattern_must_match_from_message_start() {
        let (tx, stream) = ChannelLogStream::new();
        let watcher = LogWatcher::start(Arc::new(stream)).unwrap();
        let (hits, handler) = counter();
        watcher.add_listener(Regex::new("episode end").unwrap(), handler);

        tx.send(record("the episode end")).unwrap();
        tx.send(record("episode end")).unwrap();
        wait_dispatched(&watcher, 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        watcher.stop();
    }

    #[test]
    fn removed_handler_is_not_invoked() {
        let (tx, stream) = ChannelLogStream::new();
        let watcher = LogWatcher::start(Arc::new(stream)).unwrap();
        let (hits, handler) = counter();
        let handle = watcher.add_listener(Regex::new("^ping$").unwrap(), handler);

        tx.send(record("ping")).unwrap();
        wait_dispatched(&watcher, 1);
        watcher.remove_listener(&handle).unwrap();
        assert_eq!(watcher.listener_count(), 0);

        tx.send(record("ping")).unwrap();
        wait_dispatched(&watcher, 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        watcher.stop();
    }

    #[test]
    fn removing_unknown_listener_is_reported() {
        let (_tx, stream) = ChannelLogStream::new();
        let watcher = LogWatcher::start(Arc::new(stream)).unwrap();
        let err = watcher
            .remove_listener(&ListenerHandle {
                pattern: "^nope$".into(),
                id: 42,
            })
            .unwrap_err();
        assert!(matches!(err, WatchError::NotRegistered { id: 42, .. }));

        let (_, handler) = counter();
        let handle = watcher.add_listener(Regex::new("^x$").unwrap(), handler);
        watcher.remove_listener(&handle).unwrap();
        assert!(watcher.remove_listener(&handle).is_err());
        watcher.stop();
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let (tx, stream) = ChannelLogStream::new();
        let watcher = LogWatcher::start(Arc::new(stream)).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (pattern, tag) in [("^a", "a1"), ("^ab", "ab"), ("^a", "a2")] {
            let order = Arc::clone(&order);
            watcher.add_listener(Regex::new(pattern).unwrap(), move |_| {
                order.lock().unwrap().push(tag);
            });
        }
        tx.send(record("abc")).unwrap();
        wait_dispatched(&watcher, 1);
        assert_eq!(*order.lock().unwrap(), vec!["a1", "a2", "ab"]);
        watcher.stop();
    }

    #[test]
    fn handler_may_register_listeners_mid_dispatch() {
        let (tx, stream) = ChannelLogStream::new();
        let watcher = Arc::new(LogWatcher::start(Arc::new(stream)).unwrap());
        let (hits, counting) = counter();
        let counting = Arc::new(counting);
        let w = Arc::downgrade(&watcher);
        watcher.add_listener(Regex::new("^arm$").unwrap(), move |_| {
            if let Some(w) = w.upgrade() {
                let c = Arc::clone(&counting);
                w.add_listener(Regex::new("^fire$").unwrap(), move |caps| c(caps));
            }
        });

        tx.send(record("fire")).unwrap();
        tx.send(record("arm")).unwrap();
        tx.send(record("fire")).unwrap();
        wait_dispatched(&watcher, 3);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        watcher.stop();
    }

    #[test]
    fn paused_stream_drops_lines() {
        let (tx, stream) = ChannelLogStream::new();
        let watcher = LogWatcher::start(Arc::new(stream)).unwrap();
        let (hits, handler) = counter();
        watcher.add_listener(Regex::new("^tick$").unwrap(), handler);

        watcher.pause();
        tx.send(record("tick")).unwrap();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        watcher.resume();
        tx.send(record("tick")).unwrap();
        wait_dispatched(&watcher, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        watcher.stop();
    }

    #[test]
    fn attach_keeps_listeners_across_streams() {
        let (old_tx, old_stream) = ChannelLogStream::new();
        let watcher = LogWatcher::start(Arc::new(old_stream)).unwrap();
        let (hits, handler) = counter();
        watcher.add_listener(Regex::new("^hello$").unwrap(), handler);
        old_tx.send(record("hello")).unwrap();
        wait_dispatched(&watcher, 1);

        let (new_tx, new_stream) = ChannelLogStream::new();
        watcher.attach(Arc::new(new_stream)).unwrap();
        // the old stream is detached
        let _ = old_tx.send(record("hello"));
        new_tx.send(record("hello")).unwrap();
        wait_dispatched(&watcher, 2);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(watcher.listener_count(), 1);
        watcher.stop();
    }

    #[test]
    fn unattached_watcher_is_idle() {
        let watcher = LogWatcher::new();
        assert!(!watcher.is_running());
        watcher.pause();
        watcher.resume();
        watcher.stop();
    }

    #[test]
    fn stop_joins_thread() {
        let (_tx, stream) = ChannelLogStream::new();
        let watcher = LogWatcher::start(Arc::new(stream)).unwrap();
        assert!(watcher.is_running());
        let start = Instant::now();
        watcher.stop();
        assert!(!watcher.is_running());
        assert!(start.elapsed() < STOP_JOIN_TIMEOUT);
        // second stop is a no-op
        watcher.stop();
    }
}
