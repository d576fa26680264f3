//! Per-cable log level ceiling over the `log` facade.

use std::fmt;

use log::{Level, LevelFilter};

pub(crate) const TARGET: &str = "cable_link";

/// Logs through the globally installed `log` implementation, dropping
/// records above the cable's configured level.
#[derive(Debug, Clone, Copy)]
pub struct Logger {
    level: LevelFilter,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new(LevelFilter::Warn)
    }
}

impl Logger {
    pub fn new(level: LevelFilter) -> Self {
        Self { level }
    }

    pub fn level(&self) -> LevelFilter {
        self.level
    }

    pub fn enabled(&self, level: Level) -> bool {
        level <= self.level
    }

    pub fn error(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Error, args)
    }

    pub fn warn(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Warn, args)
    }

    pub fn info(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Info, args)
    }

    pub fn debug(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Debug, args)
    }

    fn log(&self, level: Level, args: fmt::Arguments<'_>) {
        if self.enabled(level) {
            log::log!(target: TARGET, level, "[cable-link] {}", args);
        }
    }
}
