// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Leveled log lines for the VM layer, delivered to a registered sink
//! OWNERS: @kernel-mm-team
//! TEST_COVERAGE: Unit tests (line format, truncation); tests/fault.rs captures lines
//! PUBLIC API: log_* macros, emit(level,target,args), set_sink, set_max_level
//! DEPENDS_ON: spin::Once
//! INVARIANTS: Debug/Trace only in debug builds; single-line emission; no sink => dropped

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicU8, Ordering};

/// Logging severity used by the VM layer.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl Level {
    const fn tag(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }

    const fn compiled_in(self) -> bool {
        match self {
            Level::Debug | Level::Trace => cfg!(debug_assertions),
            _ => true,
        }
    }
}

/// Destination for formatted log lines (UART on the target, a capture buffer in tests).
pub trait LogSink: Sync {
    /// Receives one complete line, without the trailing newline.
    fn write_line(&self, level: Level, line: &str);
}

static SINK: spin::Once<&'static dyn LogSink> = spin::Once::new();
static MAX_LEVEL: AtomicU8 = AtomicU8::new(Level::Trace as u8);

/// Installs the process-wide sink. Only the first call has an effect.
pub fn set_sink(sink: &'static dyn LogSink) {
    SINK.call_once(|| sink);
}

pub fn set_max_level(level: Level) {
    MAX_LEVEL.store(level as u8, Ordering::Relaxed);
}

fn enabled(level: Level) -> bool {
    level.compiled_in() && level as u8 <= MAX_LEVEL.load(Ordering::Relaxed)
}

const LINE_CAPACITY: usize = 256;

/// Fixed-capacity line buffer; output past the capacity is truncated.
struct LineBuf {
    bytes: [u8; LINE_CAPACITY],
    len: usize,
}

impl LineBuf {
    const fn new() -> Self {
        Self {
            bytes: [0; LINE_CAPACITY],
            len: 0,
        }
    }

    fn as_str(&self) -> &str {
        match core::str::from_utf8(&self.bytes[..self.len]) {
            Ok(s) => s,
            // Truncation can split a multi-byte character.
            Err(err) => core::str::from_utf8(&self.bytes[..err.valid_up_to()]).unwrap_or(""),
        }
    }
}

impl Write for LineBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = LINE_CAPACITY - self.len;
        let take = s.len().min(room);
        self.bytes[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

fn format_line(buf: &mut LineBuf, level: Level, target: &str, args: fmt::Arguments<'_>) {
    let _ = write!(buf, "[{} {}] ", level.tag(), target);
    let _ = buf.write_fmt(args);
}

/// Formats and delivers one line; dropped when the level is filtered or no sink is set.
pub fn emit(level: Level, target: &'static str, args: fmt::Arguments<'_>) {
    if !enabled(level) {
        return;
    }
    let Some(sink) = SINK.get() else {
        return;
    };
    let mut buf = LineBuf::new();
    format_line(&mut buf, level, target, args);
    sink.write_line(level, buf.as_str());
}

#[doc(hidden)]
#[macro_export]
macro_rules! __vm_log {
    ($level:ident, target: $target:expr, $($arg:tt)+) => {
        $crate::log::emit($crate::log::Level::$level, $target, format_args!($($arg)+))
    };
    ($level:ident, $($arg:tt)+) => {
        $crate::log::emit(
            $crate::log::Level::$level,
            module_path!(),
            format_args!($($arg)+),
        )
    };
}

/// `log_error!(target: "hpt", "...", args)`; the target defaults to the module path.
#[macro_export]
macro_rules! log_error {
    ($($t:tt)+) => {
        $crate::__vm_log!(Error, $($t)+)
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($t:tt)+) => {
        $crate::__vm_log!(Warn, $($t)+)
    };
}

#[macro_export]
macro_rules! log_info {
    ($($t:tt)+) => {
        $crate::__vm_log!(Info, $($t)+)
    };
}

#[macro_export]
macro_rules! log_debug {
    ($($t:tt)+) => {
        $crate::__vm_log!(Debug, $($t)+)
    };
}

#[macro_export]
macro_rules! log_trace {
    ($($t:tt)+) => {
        $crate::__vm_log!(Trace, $($t)+)
    };
}
