// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025 minivisor authors

//! Line-buffered guest output.
//!
//! The Print hypercall carries a NUL-terminated string, so every flush
//! costs one VM-exit. Characters are batched into a fixed line buffer and
//! flushed on newline or when the payload is full; this defines exactly
//! how many Print hypercalls the host observes for a given output. One
//! buffer per guest process; the kernel's own console is one owner behind
//! a spinlock.

use crate::locking::SpinLock;

use vmdefs::PRINT_BUF_SIZE;

/// Receives one full, NUL-terminated line per flush. The production sink
/// issues the Print hypercall; tests count flushes instead.
pub trait FlushSink {
    /// `line` is the payload plus the trailing NUL.
    fn flush_line(&mut self, line: &[u8]);
}

/// The fixed-size output batcher. The backing array reserves one byte
/// past the payload capacity for the terminator the Print ABI requires.
#[derive(Debug)]
pub struct LineBuffer {
    buf: [u8; PRINT_BUF_SIZE + 1],
    used: usize,
}

impl LineBuffer {
    pub const fn new() -> Self {
        Self {
            buf: [0; PRINT_BUF_SIZE + 1],
            used: 0,
        }
    }

    /// Batches one byte; flushes on newline or once the payload holds
    /// `PRINT_BUF_SIZE` bytes.
    pub fn push(&mut self, c: u8, sink: &mut dyn FlushSink) {
        self.buf[self.used] = c;
        self.used += 1;
        if c == b'\n' || self.used == PRINT_BUF_SIZE {
            self.flush(sink);
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8], sink: &mut dyn FlushSink) {
        for &c in bytes {
            self.push(c, sink);
        }
    }

    /// Flushes whatever is buffered, if anything. Also used at teardown.
    pub fn flush(&mut self, sink: &mut dyn FlushSink) {
        if self.used == 0 {
            return;
        }
        self.buf[self.used] = 0;
        sink.flush_line(&self.buf[..=self.used]);
        self.used = 0;
    }

    pub fn buffered(&self) -> usize {
        self.used
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_arch = "x86_64")]
mod hypercall_console {
    use super::{FlushSink, LineBuffer};
    use crate::hypercalls;
    use crate::locking::SpinLock;
    use core::fmt;

    struct HypercallSink;

    impl FlushSink for HypercallSink {
        fn flush_line(&mut self, line: &[u8]) {
            // SAFETY: the buffer is NUL-terminated by the flusher and
            // lives for the duration of the hypercall.
            unsafe { hypercalls::hc_print(line.as_ptr()) };
        }
    }

    static CONSOLE: SpinLock<LineBuffer> = SpinLock::new(LineBuffer::new());

    /// Writes bytes through the kernel console buffer.
    pub fn console_write(bytes: &[u8]) {
        let mut sink = HypercallSink;
        CONSOLE.lock().write_bytes(bytes, &mut sink);
    }

    /// Drains anything still buffered, e.g. before ending the run.
    pub fn console_flush() {
        let mut sink = HypercallSink;
        CONSOLE.lock().flush(&mut sink);
    }

    struct ConsoleWriter;

    impl fmt::Write for ConsoleWriter {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            console_write(s.as_bytes());
            Ok(())
        }
    }

    #[doc(hidden)]
    pub fn _print(args: fmt::Arguments<'_>) {
        use fmt::Write;
        ConsoleWriter.write_fmt(args).expect("console write failed");
    }
}

#[cfg(target_arch = "x86_64")]
pub use hypercall_console::{_print, console_flush, console_write};

#[macro_export]
#[cfg(target_arch = "x86_64")]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::console::_print(core::format_args!($($arg)*))
    };
}

#[macro_export]
#[cfg(target_arch = "x86_64")]
macro_rules! println {
    () => { $crate::print!("\n") };
    ($($arg:tt)*) => {
        $crate::console::_print(core::format_args!("{}\n", core::format_args!($($arg)*)))
    };
}

static COMPONENT: SpinLock<&'static str> = SpinLock::new("kernel");

#[derive(Clone, Copy, Debug)]
struct ConsoleLogger;

impl log::Log for ConsoleLogger {
    fn enabled(&self, _metadata: &log::Metadata<'_>) -> bool {
        true
    }

    #[cfg(target_arch = "x86_64")]
    fn log(&self, record: &log::Record<'_>) {
        let name = *COMPONENT.lock();
        match record.metadata().level() {
            log::Level::Error | log::Level::Warn => _print(format_args!(
                "[{}] {}: {}\n",
                name,
                record.metadata().level().as_str(),
                record.args()
            )),
            _ => _print(format_args!("[{}] {}\n", name, record.args())),
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn log(&self, _record: &log::Record<'_>) {}

    fn flush(&self) {}
}

static CONSOLE_LOGGER: ConsoleLogger = ConsoleLogger;

/// Routes the `log` macros through the buffered console. A second
/// registration keeps the first logger and only updates the name.
pub fn install_console_logger(component: &'static str) {
    *COMPONENT.lock() = component;
    if log::set_logger(&CONSOLE_LOGGER).is_ok() {
        log::set_max_level(log::LevelFilter::Info);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    /// Records one entry per flush, payload without the terminator.
    #[derive(Default)]
    struct RecordingSink {
        flushes: Vec<Vec<u8>>,
    }

    impl FlushSink for RecordingSink {
        fn flush_line(&mut self, line: &[u8]) {
            assert_eq!(*line.last().unwrap(), 0);
            self.flushes.push(line[..line.len() - 1].to_vec());
        }
    }

    #[test]
    fn newline_flushes() {
        let mut buffer = LineBuffer::new();
        let mut sink = RecordingSink::default();

        buffer.write_bytes(b"hello\nworld", &mut sink);
        assert_eq!(sink.flushes.len(), 1);
        assert_eq!(sink.flushes[0], b"hello\n");
        assert_eq!(buffer.buffered(), 5);

        buffer.flush(&mut sink);
        assert_eq!(sink.flushes.len(), 2);
        assert_eq!(sink.flushes[1], b"world");
    }

    #[test]
    fn full_line_plus_newline_is_one_hypercall() {
        let mut buffer = LineBuffer::new();
        let mut sink = RecordingSink::default();

        // 1023 bytes without a newline stay buffered...
        buffer.write_bytes(&[b'x'; PRINT_BUF_SIZE - 1], &mut sink);
        assert_eq!(sink.flushes.len(), 0);

        // ...and the newline completes exactly one full payload.
        buffer.push(b'\n', &mut sink);
        assert_eq!(sink.flushes.len(), 1);
        assert_eq!(sink.flushes[0].len(), PRINT_BUF_SIZE);
        assert_eq!(*sink.flushes[0].last().unwrap(), b'\n');
    }

    #[test]
    fn long_output_with_one_newline_flushes_twice() {
        let mut buffer = LineBuffer::new();
        let mut sink = RecordingSink::default();

        // 2049 bytes with the only newline at index 100: one newline
        // flush, one full-buffer flush, the tail stays buffered.
        let mut payload = [b'a'; 2049];
        payload[100] = b'\n';
        buffer.write_bytes(&payload, &mut sink);

        assert_eq!(sink.flushes.len(), 2);
        assert_eq!(sink.flushes[0].len(), 101);
        assert_eq!(sink.flushes[1].len(), PRINT_BUF_SIZE);
        assert_eq!(buffer.buffered(), 2049 - 101 - PRINT_BUF_SIZE);

        // A teardown flush drains the rest and the concatenation equals
        // the original output.
        buffer.flush(&mut sink);
        let all: Vec<u8> = sink.flushes.concat();
        assert_eq!(all, payload);
    }

    #[test]
    fn empty_flush_is_silent() {
        let mut buffer = LineBuffer::new();
        let mut sink = RecordingSink::default();
        buffer.flush(&mut sink);
        assert!(sink.flushes.is_empty());
    }
}
