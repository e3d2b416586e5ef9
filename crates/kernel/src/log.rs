//! Structured kernel logging.
//!
//! The kernel produces records tagged with a severity and a subsystem name;
//! the backend that renders them is pluggable. A global atomic level filter
//! drops records before any formatting work happens, so disabled levels are
//! close to free.
//!
//! # Usage
//!
//! ```ignore
//! crate::info!("mem/phys", "metadata table at {:#x}", addr);
//! crate::success!("sched", "local scheduler online");
//! ```

use core::fmt;
use core::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

/// Record severity.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug = 0,
    Info = 1,
    Success = 2,
    Warn = 3,
    Err = 4,
    Panic = 5,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Success => "OK",
            Level::Warn => "WARN",
            Level::Err => "ERR",
            Level::Panic => "PANIC",
        }
    }
}

/// One log record, borrowed for the duration of the sink call.
pub struct Record<'a> {
    pub level: Level,
    pub subsystem: &'static str,
    pub args: fmt::Arguments<'a>,
}

/// Pluggable log backend.
pub trait LogSink: Sync {
    fn write(&self, record: &Record<'_>);
}

/// Minimum severity that reaches the sink.
static LOG_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);

/// Installed sink, or null before `set_sink`.
static SINK: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

// &'static dyn LogSink is a fat pointer, so it is smuggled through a thin
// pointer to a static holding it.
struct SinkSlot(&'static dyn LogSink);

pub fn set_level(level: Level) {
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn level() -> Level {
    match LOG_LEVEL.load(Ordering::Relaxed) {
        0 => Level::Debug,
        1 => Level::Info,
        2 => Level::Success,
        3 => Level::Warn,
        4 => Level::Err,
        _ => Level::Panic,
    }
}

/// Install the record backend. The slot is written once at boot; a second
/// call replaces the sink for all subsequent records.
pub fn set_sink(sink: &'static dyn LogSink) {
    let slot = alloc::boxed::Box::leak(alloc::boxed::Box::new(SinkSlot(sink)));
    SINK.store(slot as *mut SinkSlot as *mut (), Ordering::Release);
}

fn sink() -> Option<&'static dyn LogSink> {
    let ptr = SINK.load(Ordering::Acquire) as *const SinkSlot;
    if ptr.is_null() {
        return None;
    }
    // Slots are leaked, never freed.
    Some(unsafe { (*ptr).0 })
}

/// Filter and dispatch one record. Prefer the macros below.
pub fn dispatch(level: Level, subsystem: &'static str, args: fmt::Arguments<'_>) {
    if (level as u8) < LOG_LEVEL.load(Ordering::Relaxed) {
        return;
    }
    if let Some(sink) = sink() {
        sink.write(&Record {
            level,
            subsystem,
            args,
        });
    }
}

#[macro_export]
macro_rules! debug {
    ($sub:expr, $($arg:tt)*) => {
        $crate::log::dispatch($crate::log::Level::Debug, $sub, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! info {
    ($sub:expr, $($arg:tt)*) => {
        $crate::log::dispatch($crate::log::Level::Info, $sub, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! success {
    ($sub:expr, $($arg:tt)*) => {
        $crate::log::dispatch($crate::log::Level::Success, $sub, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! warn {
    ($sub:expr, $($arg:tt)*) => {
        $crate::log::dispatch($crate::log::Level::Warn, $sub, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! err {
    ($sub:expr, $($arg:tt)*) => {
        $crate::log::dispatch($crate::log::Level::Err, $sub, format_args!($($arg)*))
    };
}

/// Serial-port sink for bare-metal builds: COM1 plus the 0xe9 debug port.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod serial {
    use super::{LogSink, Record};
    use core::fmt::Write;

    pub struct SerialSink {
        port: spin::Mutex<uart_16550::SerialPort>,
    }

    impl SerialSink {
        /// # Safety
        ///
        /// `base` must be the I/O base of a real 16550-compatible UART.
        pub unsafe fn new(base: u16) -> Self {
            let mut port = uart_16550::SerialPort::new(base);
            port.init();
            SerialSink {
                port: spin::Mutex::new(port),
            }
        }
    }

    impl LogSink for SerialSink {
        fn write(&self, record: &Record<'_>) {
            let mut port = self.port.lock();
            let _ = write!(
                port,
                "[{}] {}: {}\r\n",
                record.level.as_str(),
                record.subsystem,
                record.args
            );
        }
    }
}
