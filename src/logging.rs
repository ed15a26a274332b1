//! Event logging for the protocol layer.
//!
//! The crate is a library, so it never configures a logging framework on
//! behalf of its host. Protocol events that matter in the field (fan-out
//! failures, relabeling decisions, cursor restarts, backoff) go through
//! the [`glog!`] macro: one line per event, a unix timestamp and the
//! emitting module followed by the message, written to a swappable sink.
//!
//! ```text
//! 1754121300.482 graffiti::announce announce: shared inbox https://in.test refused
//! ```
//!
//! The default sink is stderr; [`set_writer`] swaps in any
//! [`std::io::Write`] implementor (a file, an in-memory buffer in tests).

use std::io::{self, Write};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

enum Sink {
    Stderr,
    Writer(Box<dyn Write + Send>),
}

static SINK: Mutex<Sink> = Mutex::new(Sink::Stderr);

/// Redirect all subsequent [`glog!`] output to `w`.
pub fn set_writer(w: Box<dyn Write + Send>) {
    *SINK.lock().unwrap() = Sink::Writer(w);
}

/// Unix timestamp with millisecond precision, e.g. `1754121300.482`.
fn timestamp() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}.{:03}", now.as_secs(), now.subsec_millis())
}

// Actor and message ids are long and mostly redundant in logs. The head
// carries the scheme or method, the tail is the distinguishing part, so
// keep both and drop the middle.
const ID_HEAD_CHARS: usize = 12;
const ID_TAIL_CHARS: usize = 4;

fn shorten(id: &str) -> String {
    let total = id.chars().count();
    if total <= ID_HEAD_CHARS + ID_TAIL_CHARS + 2 {
        return id.to_string();
    }
    let head_end = id
        .char_indices()
        .nth(ID_HEAD_CHARS)
        .map(|(i, _)| i)
        .unwrap_or(id.len());
    let tail_start = id
        .char_indices()
        .nth(total - ID_TAIL_CHARS)
        .map(|(i, _)| i)
        .unwrap_or(id.len());
    format!("{}..{}", &id[..head_end], &id[tail_start..])
}

/// Shorten an actor id for a log line: `did:web:some..mple`.
pub fn actor_id(id: &str) -> String {
    shorten(id)
}

/// Shorten a message id for a log line.
pub fn msg_id(id: &str) -> String {
    shorten(id)
}

/// Write one event line to the current sink.
///
/// Called by the [`glog!`] macro; not intended for direct use.
pub fn emit(module: &str, msg: &str) {
    let line = format!("{} {} {}", timestamp(), module, msg);
    match &mut *SINK.lock().unwrap() {
        Sink::Stderr => {
            let _ = writeln!(io::stderr().lock(), "{line}");
        }
        Sink::Writer(w) => {
            let _ = writeln!(w, "{line}");
        }
    }
}

/// Emit one event line with timestamp and module provenance.
///
/// ```ignore
/// glog!("announce: {} receipt(s) collected", receipts.len());
/// glog!("discover: relabeled {} invalid", logging::msg_id(&id));
/// ```
#[macro_export]
macro_rules! glog {
    ($($arg:tt)*) => {{
        $crate::logging::emit(module_path!(), &format!($($arg)*));
    }};
}
