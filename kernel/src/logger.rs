//! Kernel logger.
//!
//! A `log::Log` implementation writing through the kernel console so
//! subsystems can use the standard `log` macros with subsystem prefixes
//! (`[ACPI]`, `[AHCI]`, ...).

use log::{Level, LevelFilter, Metadata, Record};

struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl log::Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Info
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let tag = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => " WARN",
            Level::Info => " INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };
        crate::println!("[{}] {}", tag, record.args());
    }

    fn flush(&self) {}
}

/// Install the kernel logger. Safe to call more than once; only the first
/// call wins.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Info);
    }
}
