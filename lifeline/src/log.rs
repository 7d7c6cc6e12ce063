//! Lifecycle event logging.
//!
//! Proxy installation, final release, resurrection, destruction,
//! disconnection, deferred release and fail-fast are reported as structured
//! records built with [`LogBuilder`]. Every call site checks [`would_log`]
//! first, a single relaxed load, so disabled levels cost nothing on the
//! count paths.
//!
//! ```rust,ignore
//! use lifeline::log::{LogBuilder, LogLevel};
//!
//! LogBuilder::new(LogLevel::Debug)
//!     .target("lifeline::proxy")
//!     .message("weak reference proxy installed")
//!     .field_hex("object", 0x7f00_1000)
//!     .field_uint("seeded_count", 3)
//!     .emit();
//! ```

use std::fmt::{self, Write as _};
use std::io::Write;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LogLevel {
    /// Per-operation detail (aggregation, proxy reuse).
    Trace = 0,
    /// Lifecycle transitions.
    Debug = 1,
    /// Informational.
    Info = 2,
    /// Recoverable anomalies, such as releases after queue shutdown.
    Warn = 3,
    /// Fail-fast reports.
    Error = 4,
    /// Nothing is logged.
    Off = 5,
}

impl LogLevel {
    /// Upper-case level name.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Off => "OFF",
        }
    }

    /// Parse a level name, case-insensitively.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "TRACE" => Some(LogLevel::Trace),
            "DEBUG" => Some(LogLevel::Debug),
            "INFO" => Some(LogLevel::Info),
            "WARN" | "WARNING" => Some(LogLevel::Warn),
            "ERROR" => Some(LogLevel::Error),
            "OFF" | "NONE" => Some(LogLevel::Off),
            _ => None,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Trace,
            1 => LogLevel::Debug,
            2 => LogLevel::Info,
            3 => LogLevel::Warn,
            4 => LogLevel::Error,
            _ => LogLevel::Off,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One human-readable line per record.
    Plain,
    /// One JSON object per line.
    Json,
}

impl LogFormat {
    /// Parse a format name (`plain`, `text` or `json`).
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "plain" | "text" => Some(LogFormat::Plain),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Int(i64),
    Bool(bool),
    Hex(usize),
}

impl Value {
    fn write_plain(&self, out: &mut String) {
        let _ = match self {
            Value::Str(s) => write!(out, "{}", s),
            Value::Int(i) => write!(out, "{}", i),
            Value::Bool(b) => write!(out, "{}", b),
            Value::Hex(a) => write!(out, "{:#x}", a),
        };
    }

    fn write_json(&self, out: &mut String) {
        match self {
            Value::Str(s) => write_json_str(out, s),
            Value::Hex(a) => {
                let _ = write!(out, "\"{:#x}\"", a);
            }
            other => other.write_plain(out),
        }
    }
}

/// One lifecycle event.
#[derive(Debug)]
struct Record {
    level: LogLevel,
    target: Option<&'static str>,
    message: String,
    fields: Vec<(&'static str, Value)>,
    millis: u64,
    thread: Option<String>,
}

impl Record {
    fn render(&self, format: LogFormat) -> String {
        let mut out = String::with_capacity(96);
        match format {
            LogFormat::Plain => self.render_plain(&mut out),
            LogFormat::Json => self.render_json(&mut out),
        }
        out
    }

    fn render_plain(&self, out: &mut String) {
        let _ = write!(out, "[{}.{:03}] {:<5} ", self.millis / 1000, self.millis % 1000, self.level);
        if let Some(target) = self.target {
            let _ = write!(out, "[{}] ", target);
        }
        if let Some(thread) = &self.thread {
            let _ = write!(out, "({}) ", thread);
        }
        out.push_str(&self.message);

        for (i, (key, value)) in self.fields.iter().enumerate() {
            out.push_str(if i == 0 { " {" } else { ", " });
            out.push_str(key);
            out.push('=');
            value.write_plain(out);
        }
        if !self.fields.is_empty() {
            out.push('}');
        }
    }

    fn render_json(&self, out: &mut String) {
        let _ = write!(out, "{{\"timestamp\":{},\"level\":\"{}\"", self.millis, self.level);
        if let Some(target) = self.target {
            out.push_str(",\"target\":");
            write_json_str(out, target);
        }
        if let Some(thread) = &self.thread {
            out.push_str(",\"thread\":");
            write_json_str(out, thread);
        }
        out.push_str(",\"message\":");
        write_json_str(out, &self.message);

        for (i, (key, value)) in self.fields.iter().enumerate() {
            out.push_str(if i == 0 { ",\"fields\":{" } else { "," });
            write_json_str(out, key);
            out.push(':');
            value.write_json(out);
        }
        if !self.fields.is_empty() {
            out.push('}');
        }
        out.push('}');
    }
}

fn write_json_str(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

struct Sink {
    format: LogFormat,
    use_stderr: bool,
}

static MIN_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Warn as u8);

// Held across the write so concurrent records do not interleave.
static SINK: Mutex<Sink> = parking_lot::const_mutex(Sink {
    format: LogFormat::Plain,
    use_stderr: true,
});

/// Set the minimum level. [`LogLevel::Off`] silences everything.
pub fn set_level(level: LogLevel) {
    MIN_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Current minimum level.
pub fn level() -> LogLevel {
    LogLevel::from_u8(MIN_LEVEL.load(Ordering::Relaxed))
}

/// Set the output format.
pub fn set_format(format: LogFormat) {
    SINK.lock().format = format;
}

/// Current output format.
pub fn format() -> LogFormat {
    SINK.lock().format
}

/// Write to stderr (the default) or stdout.
pub fn set_use_stderr(use_stderr: bool) {
    SINK.lock().use_stderr = use_stderr;
}

/// Whether a record at `level` would be written.
#[inline]
pub fn would_log(level: LogLevel) -> bool {
    level != LogLevel::Off && level as u8 >= MIN_LEVEL.load(Ordering::Relaxed)
}

fn emit(record: &Record) {
    if !would_log(record.level) {
        return;
    }

    let sink = SINK.lock();
    let line = record.render(sink.format);
    if sink.use_stderr {
        let _ = writeln!(std::io::stderr(), "{}", line);
    } else {
        let _ = writeln!(std::io::stdout(), "{}", line);
    }
}

/// Builder for a structured lifecycle record.
#[derive(Debug)]
pub struct LogBuilder {
    record: Record,
}

impl LogBuilder {
    /// Start a record at `level`, stamped with the time and thread name.
    pub fn new(level: LogLevel) -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        Self {
            record: Record {
                level,
                target: None,
                message: String::new(),
                fields: Vec::new(),
                millis,
                thread: std::thread::current().name().map(str::to_owned),
            },
        }
    }

    /// Set the message.
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.record.message = msg.into();
        self
    }

    /// Set the module target, e.g. `lifeline::proxy`.
    pub fn target(mut self, target: &'static str) -> Self {
        self.record.target = Some(target);
        self
    }

    /// Add a string field.
    pub fn field_str(self, key: &'static str, value: impl Into<String>) -> Self {
        self.field(key, Value::Str(value.into()))
    }

    /// Add a signed integer field.
    pub fn field_int(self, key: &'static str, value: i64) -> Self {
        self.field(key, Value::Int(value))
    }

    /// Add a count field. Counts past `i64::MAX` saturate.
    pub fn field_uint(self, key: &'static str, value: usize) -> Self {
        self.field(key, Value::Int(i64::try_from(value).unwrap_or(i64::MAX)))
    }

    /// Add an address field, rendered in hex.
    pub fn field_hex(self, key: &'static str, value: usize) -> Self {
        self.field(key, Value::Hex(value))
    }

    /// Add a boolean field.
    pub fn field_bool(self, key: &'static str, value: bool) -> Self {
        self.field(key, Value::Bool(value))
    }

    fn field(mut self, key: &'static str, value: Value) -> Self {
        self.record.fields.push((key, value));
        self
    }

    /// Write the record if its level is enabled.
    pub fn emit(self) {
        emit(&self.record);
    }
}
