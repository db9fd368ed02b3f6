use std::backtrace::Backtrace;
use std::fs;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Frames kept per stack trace.
const MAX_FRAMES: usize = 50;
/// Source lines included on each side of the failing line.
const CONTEXT_LINES: usize = 5;

/// Path fragments that mark a frame as runtime or third-party code.
const LIBRARY_PATH_MARKERS: &[&str] = &[
    "/rustc/",
    "/.cargo/",
    "/.rustup/",
    "/usr/lib/",
    "/vendor/",
    "/library/std/",
    "/library/core/",
    "/library/alloc/",
];

/// Caller-side input for
/// [`Client::capture_exception`](crate::Client::capture_exception):
/// either a real error with a captured backtrace, or a synthetic
/// message-only report.
#[derive(Debug, Clone)]
pub struct Exception {
    pub(crate) exception_type: String,
    pub(crate) message: String,
    pub(crate) backtrace: Option<String>,
    pub(crate) handled: bool,
}

impl Exception {
    /// Build from an error value, capturing the current backtrace at
    /// the call site.
    pub fn from_error<E: std::error::Error>(error: &E) -> Self {
        Self {
            exception_type: std::any::type_name::<E>().to_string(),
            message: error.to_string(),
            backtrace: Some(Backtrace::force_capture().to_string()),
            handled: true,
        }
    }

    /// Build a synthetic exception from a plain message; carries no
    /// stack trace.
    pub fn from_message<S: Into<String>>(message: S) -> Self {
        Self {
            exception_type: "Error".to_string(),
            message: message.into(),
            backtrace: None,
            handled: true,
        }
    }

    /// Override the error type shown in the exception record.
    pub fn with_type<S: Into<String>>(mut self, exception_type: S) -> Self {
        self.exception_type = exception_type.into();
        self
    }

    /// Mark the exception as unhandled (a crash rather than a caught
    /// error).
    pub fn unhandled(mut self) -> Self {
        self.handled = false;
        self
    }

    /// Attach a pre-rendered backtrace instead of capturing one.
    pub fn with_backtrace<S: Into<String>>(mut self, backtrace: S) -> Self {
        self.backtrace = Some(backtrace.into());
        self
    }
}

/// One parsed stack frame in the wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackFrame {
    pub filename: String,
    pub abs_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lineno: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub colno: Option<u32>,
    pub function: String,
    pub in_app: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_line: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_context: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_context: Option<Vec<String>>,
}

/// Turn an [`Exception`] into the `$exception_*` property bag.
pub(crate) fn serialize_exception(exception: &Exception) -> Map<String, Value> {
    let synthetic = exception.backtrace.is_none();

    let mut entry = Map::new();
    entry.insert("type".to_string(), json!(exception.exception_type));
    entry.insert("value".to_string(), json!(exception.message));
    entry.insert(
        "mechanism".to_string(),
        json!({
            "type": "generic",
            "handled": exception.handled,
            "synthetic": synthetic,
        }),
    );

    if let Some(backtrace) = &exception.backtrace {
        let frames = parse_frames(backtrace);
        entry.insert("stacktrace".to_string(), json!({ "frames": frames }));
    }

    let mut properties = Map::new();
    properties.insert("$exception_type".to_string(), json!(exception.exception_type));
    properties.insert("$exception_message".to_string(), json!(exception.message));
    properties.insert("$exception_list".to_string(), json!([Value::Object(entry)]));
    properties
}

/// Parse a rendered backtrace into structured frames.
///
/// Recognizes the standard two-line frame shape:
///
/// ```text
///    3: myapp::orders::submit
///              at /src/orders.rs:42:9
/// ```
///
/// Keeps at most [`MAX_FRAMES`] frames and reverses the list. Frames
/// with a resolvable line number get surrounding source context.
pub(crate) fn parse_frames(backtrace: &str) -> Vec<StackFrame> {
    let symbol_re = Regex::new(r"^\s*\d+:\s+(.+?)\s*$").expect("static pattern");
    let location_re = Regex::new(r"^\s*at\s+(.+?):(\d+)(?::(\d+))?\s*$").expect("static pattern");

    let mut frames: Vec<StackFrame> = Vec::new();
    for line in backtrace.lines() {
        if let Some(caps) = symbol_re.captures(line) {
            frames.push(StackFrame {
                filename: String::new(),
                abs_path: String::new(),
                lineno: None,
                colno: None,
                function: caps[1].to_string(),
                in_app: true,
                context_line: None,
                pre_context: None,
                post_context: None,
            });
        } else if let Some(caps) = location_re.captures(line) {
            let Some(frame) = frames.last_mut() else {
                continue;
            };
            let abs_path = caps[1].to_string();
            frame.filename = basename(&abs_path);
            frame.in_app = !LIBRARY_PATH_MARKERS
                .iter()
                .any(|marker| abs_path.contains(marker));
            frame.abs_path = abs_path;
            frame.lineno = caps[2].parse().ok();
            frame.colno = caps.get(3).and_then(|c| c.as_str().parse().ok());
        }
    }

    frames.truncate(MAX_FRAMES);
    frames.reverse();

    for frame in &mut frames {
        if let Some(lineno) = frame.lineno {
            attach_source_context(frame, lineno);
        }
    }

    frames
}

fn basename(path: &str) -> String {
    path.rsplit(['/', '\\'])
        .next()
        .unwrap_or(path)
        .to_string()
}

/// Read the failing line plus surrounding context; any read failure
/// leaves the context fields unset.
fn attach_source_context(frame: &mut StackFrame, lineno: u32) {
    let Ok(source) = fs::read_to_string(&frame.abs_path) else {
        return;
    };
    let lines: Vec<&str> = source.lines().collect();
    let index = lineno as usize;
    if index == 0 || index > lines.len() {
        return;
    }

    let start = index.saturating_sub(CONTEXT_LINES + 1);
    frame.context_line = Some(lines[index - 1].to_string());
    frame.pre_context = Some(lines[start..index - 1].iter().map(|l| l.to_string()).collect());
    frame.post_context = Some(
        lines[index..(index + CONTEXT_LINES).min(lines.len())]
            .iter()
            .map(|l| l.to_string())
            .collect(),
    );
}
