//! Host logger bridge.
//!
//! Engine log lines are delivered to one process-wide [`LogSink`], normally a
//! C callback installed by the host. Delivery is asynchronous: events are
//! queued on a bounded channel and a dedicated thread calls the sink, so a
//! slow or blocking host never stalls the engine. When the queue is full the
//! line is dropped and counted.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, OnceLock, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

/// Default number of lines buffered for the sink.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Severity passed to the host. Hosts only distinguish two levels.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Verbose = 0,
    Error = 1,
}

impl From<&Level> for LogLevel {
    fn from(level: &Level) -> Self {
        if *level <= Level::WARN {
            // tracing orders ERROR < WARN < INFO
            LogLevel::Error
        } else {
            LogLevel::Verbose
        }
    }
}

/// Receiver of formatted log lines.
pub trait LogSink: Send + Sync + 'static {
    fn log(&self, level: LogLevel, message: &str);
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl LogSink for NullSink {
    fn log(&self, _level: LogLevel, _message: &str) {}
}

enum Item {
    Line {
        sink: Arc<dyn LogSink>,
        level: LogLevel,
        message: String,
    },
    Flush(std_mpsc::Sender<()>),
}

/// Bounded asynchronous fan-in to the current [`LogSink`].
pub struct LogBridge {
    sink: RwLock<Option<Arc<dyn LogSink>>>,
    queue: mpsc::Sender<Item>,
    dropped: AtomicU64,
}

static GLOBAL: OnceLock<Arc<LogBridge>> = OnceLock::new();

impl LogBridge {
    /// Create a bridge with its own drain thread.
    pub fn new(capacity: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        // If the thread cannot be spawned the receiver is dropped and every
        // submit is counted as dropped.
        let _ = std::thread::Builder::new()
            .name("wgkit-log".to_string())
            .spawn(move || drain(rx));

        Arc::new(LogBridge {
            sink: RwLock::new(None),
            queue: tx,
            dropped: AtomicU64::new(0),
        })
    }

    /// The process-wide bridge, created with `capacity` on first use.
    pub fn install_global(capacity: usize) -> &'static Arc<LogBridge> {
        GLOBAL.get_or_init(|| LogBridge::new(capacity))
    }

    /// The process-wide bridge.
    pub fn global() -> &'static Arc<LogBridge> {
        Self::install_global(DEFAULT_QUEUE_CAPACITY)
    }

    /// Replace the sink. `None` disables delivery. Lines already queued keep
    /// the sink that was current when they were logged.
    pub fn set_sink(&self, sink: Option<Arc<dyn LogSink>>) {
        *self.sink.write().unwrap_or_else(PoisonError::into_inner) = sink;
    }

    pub fn has_sink(&self) -> bool {
        self.sink
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Queue one line. Never blocks.
    pub fn submit(&self, level: LogLevel, message: String) {
        let sink = match &*self.sink.read().unwrap_or_else(PoisonError::into_inner) {
            Some(sink) => Arc::clone(sink),
            None => return,
        };
        if self
            .queue
            .try_send(Item::Line {
                sink,
                level,
                message,
            })
            .is_err()
        {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Wait until every line queued before this call has been delivered.
    /// Returns false on timeout.
    pub fn flush(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let (ack_tx, ack_rx) = std_mpsc::channel();
        let mut item = Item::Flush(ack_tx);
        loop {
            match self.queue.try_send(item) {
                Ok(()) => break,
                Err(mpsc::error::TrySendError::Full(back)) => {
                    if Instant::now() >= deadline {
                        return false;
                    }
                    item = back;
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return false,
            }
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        ack_rx.recv_timeout(remaining).is_ok()
    }

    /// Lines dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// A `tracing` layer feeding this bridge.
    pub fn layer(self: &Arc<Self>) -> BridgeLayer {
        BridgeLayer {
            bridge: Arc::clone(self),
        }
    }
}

fn drain(mut rx: mpsc::Receiver<Item>) {
    while let Some(item) = rx.blocking_recv() {
        match item {
            Item::Line {
                sink,
                level,
                message,
            } => {
                // A panicking host sink must not take the drain thread with it.
                let _ = catch_unwind(AssertUnwindSafe(|| sink.log(level, &message)));
            }
            Item::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

/// Forwards `tracing` events to a [`LogBridge`].
pub struct BridgeLayer {
    bridge: Arc<LogBridge>,
}

impl<S: Subscriber> Layer<S> for BridgeLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if !self.bridge.has_sink() {
            return;
        }
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let level = LogLevel::from(event.metadata().level());
        self.bridge.submit(level, visitor.finish());
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn push_field(&mut self, name: &str, value: &dyn std::fmt::Display) {
        use std::fmt::Write as _;
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        let _ = write!(self.fields, "{name}={value}");
    }

    fn finish(self) -> String {
        match (self.message.is_empty(), self.fields.is_empty()) {
            (_, true) => self.message,
            (true, false) => self.fields,
            (false, false) => format!("{} {}", self.message, self.fields),
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            self.push_field(field.name(), &value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            use std::fmt::Write as _;
            let _ = write!(self.message, "{value:?}");
        } else {
            self.push_field(field.name(), &format_args!("{value:?}"));
        }
    }
}
