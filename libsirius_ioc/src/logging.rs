use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;

use spdlog::formatter::{pattern, PatternFormatter};
use spdlog::sink::{RotatingFileSink, RotationPolicy, StdStream, StdStreamSink};
use spdlog::{Level, LevelFilter, Logger};

use super::channel::ChannelValue;
use super::database::Database;
use super::error::LoggingError;

/// Name of the bounded, last-writer-wins channel mirroring user-facing messages
pub const LOG_CHANNEL: &str = "Log-Mon";

const MAX_LOG_FILE_SIZE: u64 = 10 * 1024 * 1024;
const MAX_LOG_FILES: usize = 5;

/// Install the default logger: a rotating file sink in `log_dir` plus stdout.
///
/// The `log` crate facade is forwarded to the same logger so binaries and
/// dependencies using `log::info!` end up in the same file.
pub fn init_logging(log_dir: &Path, ioc_name: &str, debug: bool) -> Result<(), LoggingError> {
    std::fs::create_dir_all(log_dir)?;
    let file_sink = Arc::new(
        RotatingFileSink::builder()
            .base_path(log_dir.join(format!("{ioc_name}.log")))
            .rotation_policy(RotationPolicy::FileSize(MAX_LOG_FILE_SIZE))
            .max_files(MAX_LOG_FILES)
            .formatter(Box::new(PatternFormatter::new(pattern!(
                "[{date_short} {time_short}] - [thread: {tid}] - [{^{level}}] - {payload}{eol}"
            ))))
            .build()?,
    );
    let stdout_sink = Arc::new(
        StdStreamSink::builder()
            .std_stream(StdStream::Stdout)
            .formatter(Box::new(PatternFormatter::new(pattern!(
                "[{time_short}] - [{^{level}}] - {payload}{eol}"
            ))))
            .build()?,
    );
    let level = if debug { Level::Debug } else { Level::Info };
    let logger = Arc::new(
        Logger::builder()
            .sink(file_sink)
            .sink(stdout_sink)
            .level_filter(LevelFilter::MoreSevereEqual(level))
            .flush_level_filter(LevelFilter::MoreSevereEqual(Level::Warn))
            .build()?,
    );
    spdlog::set_default_logger(logger);
    spdlog::init_log_crate_proxy()?;
    log::set_max_level(if debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    });
    Ok(())
}

/// Flush the default logger; called on the way out of the process
pub fn flush_logging() {
    spdlog::default_logger().flush();
}

/// Writes messages both to the log file and to the IOC's `Log-Mon` channel.
#[derive(Debug, Clone)]
pub struct LogChannel {
    db: Arc<Database>,
}

impl LogChannel {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    fn publish(&self, message: &str) {
        if !self.db.contains(LOG_CHANNEL) {
            return;
        }
        // Strings are truncated to the channel bound by the database
        if let Err(e) = self.db.set_value(LOG_CHANNEL, ChannelValue::Str(message.to_string())) {
            spdlog::error!("Could not publish to {LOG_CHANNEL}: {e}");
        }
    }

    pub fn info(&self, message: &str) {
        spdlog::info!("{message}");
        self.publish(message);
    }

    pub fn warn(&self, message: &str) {
        spdlog::warn!("{message}");
        self.publish(message);
    }

    pub fn error(&self, message: &str) {
        spdlog::error!("{message}");
        self.publish(&format!("ERR:{message}"));
    }

    /// Last message published on the channel
    pub fn last(&self) -> String {
        match self.db.value(LOG_CHANNEL) {
            Ok(ChannelValue::Str(s)) => s,
            _ => String::new(),
        }
    }
}

/// Run one iteration of a loop behind a panic barrier.
///
/// A panic is logged and pushed to `Log-Mon`; the loop carries on with its next
/// iteration. Returns `None` if the iteration panicked.
pub fn guarded<T>(log: &LogChannel, task: &str, f: impl FnOnce() -> T) -> Option<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(payload) => {
            let reason = if let Some(s) = payload.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                String::from("unknown panic")
            };
            log.error(&format!("{task} failed: {reason}"));
            None
        }
    }
}
