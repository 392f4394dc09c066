//! Logging configuration.
//!
//! Redis-style logging on top of the `log` facade:
//! - levels debug, verbose, notice, warning, nothing
//! - optional file-based logging
//! - `pid:level-char timestamp message` line format

use log::{LevelFilter, Log, Metadata, Record};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Mutex;

/// Redis-style log levels mapped to `log` levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Verbose,
    Notice,
    Warning,
    Nothing,
}

impl LogLevel {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "debug" => Self::Debug,
            "verbose" => Self::Verbose,
            "notice" => Self::Notice,
            "warning" => Self::Warning,
            "nothing" => Self::Nothing,
            _ => Self::Notice,
        }
    }

    pub fn to_level_filter(self) -> LevelFilter {
        match self {
            Self::Debug => LevelFilter::Debug,
            Self::Verbose => LevelFilter::Info,
            Self::Notice => LevelFilter::Info,
            Self::Warning => LevelFilter::Warn,
            Self::Nothing => LevelFilter::Off,
        }
    }
}

/// Logger writing to a file when configured, stderr otherwise.
pub struct VigilLogger {
    level: LevelFilter,
    file: Option<Mutex<File>>,
}

impl VigilLogger {
    pub fn new(loglevel: &str, logfile: &str) -> Self {
        let level = LogLevel::from_str(loglevel).to_level_filter();

        let file = if !logfile.is_empty() {
            match OpenOptions::new().create(true).append(true).open(logfile) {
                Ok(f) => Some(Mutex::new(f)),
                Err(e) => {
                    eprintln!("Warning: failed to open log file '{}': {}", logfile, e);
                    None
                }
            }
        } else {
            None
        };

        Self { level, file }
    }

    fn format_record(&self, record: &Record) -> String {
        let level_char = match record.level() {
            log::Level::Error => '!',
            log::Level::Warn => '#',
            log::Level::Info => '*',
            log::Level::Debug => '-',
            log::Level::Trace => '.',
        };

        let now = std::time::SystemTime::now()
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        format!(
            "{}:{} {} {}\n",
            std::process::id(),
            level_char,
            now,
            record.args()
        )
    }
}

impl Log for VigilLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let formatted = self.format_record(record);

        if let Some(ref file) = self.file {
            if let Ok(mut f) = file.lock() {
                let _ = f.write_all(formatted.as_bytes());
            }
        } else {
            eprint!("{}", formatted);
        }
    }

    fn flush(&self) {
        if let Some(ref file) = self.file {
            if let Ok(mut f) = file.lock() {
                let _ = f.flush();
            }
        }
    }
}

/// Install the logger. Falls back to `env_logger` on failure at the caller.
pub fn init_logging(loglevel: &str, logfile: &str) -> Result<(), log::SetLoggerError> {
    let logger = Box::new(VigilLogger::new(loglevel, logfile));
    let level = LogLevel::from_str(loglevel).to_level_filter();

    log::set_boxed_logger(logger)?;
    log::set_max_level(level);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parsing() {
        assert_eq!(
            LogLevel::from_str("debug").to_level_filter(),
            LevelFilter::Debug
        );
        assert_eq!(
            LogLevel::from_str("verbose").to_level_filter(),
            LevelFilter::Info
        );
        assert_eq!(
            LogLevel::from_str("warning").to_level_filter(),
            LevelFilter::Warn
        );
        assert_eq!(
            LogLevel::from_str("nothing").to_level_filter(),
            LevelFilter::Off
        );
        // Unknown defaults to notice.
        assert_eq!(
            LogLevel::from_str("unknown").to_level_filter(),
            LevelFilter::Info
        );
    }
}
