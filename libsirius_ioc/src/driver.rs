use fxhash::FxHashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::channel::{readback_name, ChannelType, ChannelValue, Reading, Suffix};
use super::database::Database;
use super::error::{DatabaseError, WriteRejection};
use super::logging::{guarded, LogChannel};

/// The application side of an IOC.
///
/// The driver validates every client write before handing it to the
/// application, and calls `process` from the main loop.
pub trait Application: Send + Sync {
    /// Optionally override the database value of a channel. Must not block.
    /// Returning `None` falls through to the database.
    fn read(&self, _name: &str) -> Option<ChannelValue> {
        None
    }

    /// Act on a validated client write. Device-facing side effects belong on
    /// the work queue. Return `false` to reject the write.
    fn write(&self, name: &str, value: &ChannelValue) -> bool;

    /// Called once the accepted write is visible in the database
    fn after_write(&self, _name: &str, _value: &ChannelValue) {}

    /// Periodic work. Must sleep or yield when there is nothing to do.
    fn process(&self, interval: Duration) {
        std::thread::sleep(interval);
    }

    /// Stop long-running scans. Called once on the way out.
    fn shutdown(&self) {}
}

/// Bridge between the transport server and the application.
pub struct Driver {
    db: Arc<Database>,
    app: Arc<dyn Application>,
    log: LogChannel,
    last_scan: Mutex<FxHashMap<String, Instant>>,
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("channels", &self.db.len())
            .finish()
    }
}

impl Driver {
    pub fn new(db: Arc<Database>, app: Arc<dyn Application>) -> Self {
        let log = LogChannel::new(db.clone());
        Self {
            db,
            app,
            log,
            last_scan: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn application(&self) -> &Arc<dyn Application> {
        &self.app
    }

    /// Read a channel on behalf of a client
    pub fn read(&self, name: &str) -> Result<Reading, DatabaseError> {
        self.db.check_client_read(name)?;
        if let Some(value) = self.app.read(name) {
            self.db.set_value(name, value)?;
        }
        self.db.reading(name)
    }

    /// Write a channel on behalf of a client; `false` if it was rejected
    pub fn write(&self, name: &str, value: Option<ChannelValue>) -> bool {
        self.try_write(name, value).is_ok()
    }

    /// Write a channel on behalf of a client. Rejections are logged to
    /// `Log-Mon` and returned. The application publishes its own reasons.
    pub fn try_write(&self, name: &str, value: Option<ChannelValue>) -> Result<(), WriteRejection> {
        let result = self.validate_and_apply(name, value);
        match &result {
            Err(rejection @ WriteRejection::Application(_)) => {
                spdlog::debug!("{rejection}");
            }
            Err(rejection) => self.log.warn(&rejection.to_string()),
            Ok(()) => (),
        }
        result
    }

    // Validation, in order: writable suffix and access, non-null value, enum
    // range, type, control limits. Then the application decides.
    fn validate_and_apply(
        &self,
        name: &str,
        value: Option<ChannelValue>,
    ) -> Result<(), WriteRejection> {
        let desc = self
            .db
            .descriptor(name)
            .map_err(|_| WriteRejection::UnknownChannel(name.to_string()))?;
        let suffix = Suffix::of(name);
        if !suffix.is_writable() {
            return Err(WriteRejection::ReadOnlySuffix(name.to_string()));
        }
        self.db
            .check_client_write(name)
            .map_err(|e| WriteRejection::AccessDenied(name.to_string(), e.to_string()))?;
        let value = value.ok_or_else(|| WriteRejection::NullValue(name.to_string()))?;
        if desc.ctype == ChannelType::Enum {
            match value.enum_index(&desc.enums) {
                Some(idx) if idx >= 0 && (idx as usize) < desc.enums.len() => (),
                Some(idx) => return Err(WriteRejection::EnumOutOfRange(name.to_string(), idx)),
                None => return Err(WriteRejection::TypeMismatch(name.to_string(), value.to_string())),
            }
        }
        let value = value
            .coerce(desc)
            .map_err(|e| WriteRejection::TypeMismatch(name.to_string(), e.to_string()))?;
        if !desc.within_limits(&value) {
            return Err(WriteRejection::OutOfRange {
                name: name.to_string(),
                value: value.to_string(),
                low: desc.lolim.unwrap_or(f64::NEG_INFINITY),
                high: desc.hilim.unwrap_or(f64::INFINITY),
            });
        }

        if !self.app.write(name, &value) {
            return Err(WriteRejection::Application(name.to_string()));
        }

        if suffix == Suffix::Command {
            // Commands count accepted writes and ignore the client's value
            if let Err(e) = self.db.increment(name) {
                spdlog::error!("Failed to count accepted command {name}: {e}");
            }
            self.app.after_write(name, &value);
            return Ok(());
        }
        if let Some(rb) = readback_name(name) {
            if self.db.contains(&rb) {
                self.store(&rb, value.clone());
            }
        }
        self.store(name, value.clone());
        self.app.after_write(name, &value);
        Ok(())
    }

    fn store(&self, name: &str, value: ChannelValue) {
        if let Err(e) = self.db.set_value(name, value) {
            spdlog::error!("Failed to store accepted write to {name}: {e}");
        }
    }

    /// One main-loop tick: refresh due scanned channels, then let the
    /// application do its periodic work.
    pub fn process(&self, interval: Duration) {
        self.scan();
        guarded(&self.log, "Application process", || self.app.process(interval));
    }

    fn scan(&self) {
        let now = Instant::now();
        let mut last_scan = self.last_scan.lock();
        for desc in self.db.descriptors() {
            let period = match desc.scan {
                Some(period) => period,
                None => continue,
            };
            let due = last_scan
                .get(&desc.name)
                .map_or(true, |last| now.duration_since(*last) >= period);
            if !due {
                continue;
            }
            last_scan.insert(desc.name.clone(), now);
            if let Some(value) = self.app.read(&desc.name) {
                if let Err(e) = self.db.set_value(&desc.name, value) {
                    spdlog::warn!("Scan of {} failed: {e}", desc.name);
                }
            }
        }
    }

    pub fn shutdown(&self) {
        self.app.shutdown();
    }
}
