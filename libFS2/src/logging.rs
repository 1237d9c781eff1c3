//! Channel-backed `log` backend.
//!
//! A training process hosting the loader installs it with [`init_logger`] and drains the returned
//! receiver, e.g. once per step, to print loader diagnostics (dropped samples, length mismatches)
//! in its own format. Records of other crates are ignored.

use std::fmt;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{Level, Metadata, Record, SetLoggerError};

/// Records are forwarded if their target starts with this prefix.
pub const LOG_TARGET_PREFIX: &str = "fs2::";

pub type FsLogReceiver = Receiver<LogMessage>;

#[derive(Clone, Debug)]
pub struct LogMessage {
    pub level: Level,
    pub target: String,
    pub message: String,
    pub line: Option<u32>,
}

impl fmt::Display for LogMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(l) => write!(f, "{} | {}:{} | {}", self.level, self.target, l, self.message),
            None => write!(f, "{} | {} | {}", self.level, self.target, self.message),
        }
    }
}

pub struct FsLogger {
    sender: Sender<LogMessage>,
    level: Level,
}

impl FsLogger {
    pub fn build(level: Level) -> (FsLogger, FsLogReceiver) {
        let (sender, receiver) = unbounded();
        (FsLogger { sender, level }, receiver)
    }
}

impl log::Log for FsLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level && metadata.target().starts_with(LOG_TARGET_PREFIX)
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let msg = LogMessage {
            level: record.level(),
            target: record.target().to_string(),
            message: record.args().to_string(),
            line: record.line(),
        };
        // Receiver is gone, fall back to stderr.
        if let Err(e) = self.sender.send(msg) {
            eprintln!("{}", e.into_inner());
        }
    }

    fn flush(&self) {}
}

/// Installs an [`FsLogger`] up to `level` as global `log` backend and returns its receiver.
///
/// Fails if a global logger is already set.
pub fn init_logger(level: Level) -> Result<FsLogReceiver, SetLoggerError> {
    let (logger, receiver) = FsLogger::build(level);
    log::set_boxed_logger(Box::new(logger))?;
    log::set_max_level(level.to_level_filter());
    Ok(receiver)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{Mutex, OnceLock};

    use log::Log;

    use super::*;

    static CAPTURED: OnceLock<Mutex<(FsLogReceiver, Vec<LogMessage>)>> = OnceLock::new();

    /// Installs the global logger on first use and returns all warnings logged so far by any test
    /// of this binary.
    pub(crate) fn captured_warnings() -> Vec<LogMessage> {
        let captured = CAPTURED.get_or_init(|| {
            let receiver = init_logger(Level::Warn).expect("No other global logger in tests");
            Mutex::new((receiver, Vec::new()))
        });
        let mut guard = captured.lock().unwrap_or_else(|e| e.into_inner());
        let (receiver, msgs) = &mut *guard;
        msgs.extend(receiver.try_iter());
        msgs.clone()
    }

    #[test]
    fn test_forwards_crate_records_only() {
        let (logger, receiver) = FsLogger::build(Level::Info);
        let record = |target: &'static str, level: Level| {
            logger.log(
                &Record::builder()
                    .args(format_args!("hello"))
                    .level(level)
                    .target(target)
                    .line(Some(7))
                    .build(),
            )
        };
        record("fs2::dataset", Level::Warn);
        record("fs2::dataset", Level::Debug);
        record("fs2_other", Level::Error);
        record("other", Level::Error);
        let msgs: Vec<LogMessage> = receiver.try_iter().collect();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].level, Level::Warn);
        assert_eq!(msgs[0].message, "hello");
        assert_eq!(msgs[0].to_string(), "WARN | fs2::dataset:7 | hello");
    }

    #[test]
    fn test_global_logger_receives_crate_warnings() {
        captured_warnings();
        log::warn!("loader test marker {}", 17);
        log::warn!(target: "other", "loader test marker {}", 18);
        let msgs = captured_warnings();
        assert_eq!(msgs.iter().filter(|m| m.message == "loader test marker 17").count(), 1);
        assert!(msgs.iter().all(|m| m.message != "loader test marker 18"));
        assert!(init_logger(Level::Info).is_err());
    }
}
