// The channel database is the one piece of state every thread touches. Descriptors
// are fixed at boot, so they live outside the lock; only readings (value + alarm
// + timestamp) sit behind the RwLock. Change notifications are fanned out over
// crossbeam channels.
use crossbeam_channel::{unbounded, Receiver, Sender};
use fxhash::FxHashMap;
use parking_lot::{Mutex, RwLock};

use super::access::AccessRules;
use super::channel::{
    validate_name, AccessClass, Alarm, ChannelDescriptor, ChannelType, ChannelValue, Condition,
    Reading, Severity,
};
use super::error::DatabaseError;

/// The automatically derived channel listing every channel of the database
pub const PROPERTIES_CHANNEL: &str = "Properties-Cte";

/// Notification emitted when a channel's value or alarm changes
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelUpdate {
    pub name: String,
    pub reading: Reading,
}

/// Typed, access-controlled registry of named channels.
///
/// The shape of the database (names, types, metadata) is immutable after
/// [`Database::create`]; only values and alarm states mutate.
#[derive(Debug)]
pub struct Database {
    index: FxHashMap<String, usize>,
    descriptors: Vec<ChannelDescriptor>,
    readings: RwLock<Vec<Reading>>,
    rules: RwLock<AccessRules>,
    subscribers: Mutex<Vec<Sender<ChannelUpdate>>>,
}

impl Database {
    /// Build the database from its declarative description.
    ///
    /// Fails on malformed or duplicated names, enum channels without labels and
    /// initial values that do not fit the declared type.
    pub fn create(descriptors: Vec<ChannelDescriptor>) -> Result<Self, DatabaseError> {
        let mut index = FxHashMap::default();
        let mut accepted: Vec<ChannelDescriptor> = Vec::with_capacity(descriptors.len() + 1);
        let mut readings = Vec::with_capacity(descriptors.len() + 1);

        for mut desc in descriptors {
            validate_name(&desc.name)?;
            if desc.name == PROPERTIES_CHANNEL {
                continue; // always derived
            }
            if index.contains_key(&desc.name) {
                return Err(DatabaseError::DuplicateChannel(desc.name));
            }
            if desc.ctype == ChannelType::Enum && desc.enums.is_empty() {
                return Err(DatabaseError::MissingEnumLabels(desc.name));
            }
            let value = desc.value.coerce(&desc)?;
            desc.value = value.clone();
            index.insert(desc.name.clone(), accepted.len());
            accepted.push(desc);
            readings.push(Reading::new(value));
        }

        let mut names: Vec<String> = accepted.iter().map(|d| d.name.clone()).collect();
        names.push(PROPERTIES_CHANNEL.to_string());
        let props = ChannelDescriptor::string_array(PROPERTIES_CHANNEL, names);
        index.insert(props.name.clone(), accepted.len());
        readings.push(Reading::new(props.value.clone()));
        accepted.push(props);

        Ok(Self {
            index,
            descriptors: accepted,
            readings: RwLock::new(readings),
            rules: RwLock::new(AccessRules::default()),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    fn position(&self, name: &str) -> Result<usize, DatabaseError> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| DatabaseError::UnknownChannel(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn descriptor(&self, name: &str) -> Result<&ChannelDescriptor, DatabaseError> {
        Ok(&self.descriptors[self.position(name)?])
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ChannelDescriptor> {
        self.descriptors.iter()
    }

    /// Current reading and metadata of a channel
    pub fn get(&self, name: &str) -> Result<(Reading, &ChannelDescriptor), DatabaseError> {
        let pos = self.position(name)?;
        let reading = self.readings.read()[pos].clone();
        Ok((reading, &self.descriptors[pos]))
    }

    pub fn reading(&self, name: &str) -> Result<Reading, DatabaseError> {
        Ok(self.get(name)?.0)
    }

    pub fn value(&self, name: &str) -> Result<ChannelValue, DatabaseError> {
        Ok(self.get(name)?.0.value)
    }

    /// Validate and store a value. The alarm is recomputed from the alarm
    /// limits (a value is never refused for being outside them). Emits a change
    /// notification if value or alarm changed; returns whether it did.
    pub fn set_value(&self, name: &str, value: ChannelValue) -> Result<bool, DatabaseError> {
        let pos = self.position(name)?;
        let desc = &self.descriptors[pos];
        let value = value.coerce(desc)?;
        let alarm = desc.limit_alarm(&value);
        self.store(pos, value, alarm)
    }

    /// Store a value with an explicit alarm, as mirrored from an external source
    pub fn set_value_with_alarm(
        &self,
        name: &str,
        value: ChannelValue,
        alarm: Alarm,
    ) -> Result<bool, DatabaseError> {
        let pos = self.position(name)?;
        let desc = &self.descriptors[pos];
        let value = value.coerce(desc)?;
        let limit_alarm = desc.limit_alarm(&value);
        let alarm = if limit_alarm.severity > alarm.severity {
            limit_alarm
        } else {
            alarm
        };
        self.store(pos, value, alarm)
    }

    // Notifications are sent while the write lock is held so subscribers observe
    // updates of one channel in the order they were stored.
    fn store(&self, pos: usize, value: ChannelValue, alarm: Alarm) -> Result<bool, DatabaseError> {
        let mut readings = self.readings.write();
        let current = &mut readings[pos];
        if current.value == value && current.alarm == alarm {
            return Ok(false);
        }
        current.value = value;
        current.alarm = alarm;
        current.timestamp = super::channel::now_timestamp();
        let reading = current.clone();
        self.notify(&self.descriptors[pos].name, reading);
        Ok(true)
    }

    /// Add one to an integer channel and return the new count. The read and the
    /// write happen under one lock, so concurrent increments are never lost.
    /// Saturates at `i32::MAX`. Always notifies.
    pub fn increment(&self, name: &str) -> Result<i32, DatabaseError> {
        let pos = self.position(name)?;
        let desc = &self.descriptors[pos];
        let mut readings = self.readings.write();
        let current = &mut readings[pos];
        let count = current
            .value
            .as_i64()
            .map_or(0, |n| n.clamp(i32::MIN as i64, i32::MAX as i64) as i32);
        let next = count.saturating_add(1);
        let value = ChannelValue::Int(next).coerce(desc)?;
        current.alarm = desc.limit_alarm(&value);
        current.value = value;
        current.timestamp = super::channel::now_timestamp();
        let reading = current.clone();
        self.notify(&desc.name, reading);
        Ok(next)
    }

    /// Set the alarm state independently of the value. Always notifies.
    pub fn set_alarm(
        &self,
        name: &str,
        severity: Severity,
        condition: Condition,
    ) -> Result<(), DatabaseError> {
        let pos = self.position(name)?;
        let mut readings = self.readings.write();
        readings[pos].alarm = Alarm::new(severity, condition);
        readings[pos].timestamp = super::channel::now_timestamp();
        let reading = readings[pos].clone();
        self.notify(&self.descriptors[pos].name, reading);
        Ok(())
    }

    /// Names in insertion order, optionally restricted to those containing `filter`
    pub fn list(&self, filter: Option<&str>) -> Vec<String> {
        self.descriptors
            .iter()
            .filter(|d| filter.map_or(true, |f| d.name.contains(f)))
            .map(|d| d.name.clone())
            .collect()
    }

    /// Receive every subsequent change notification
    pub fn subscribe(&self) -> Receiver<ChannelUpdate> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    fn notify(&self, name: &str, reading: Reading) {
        let update = ChannelUpdate {
            name: name.to_string(),
            reading,
        };
        // Drop subscribers whose receiving end is gone
        self.subscribers
            .lock()
            .retain(|tx| tx.send(update.clone()).is_ok());
    }

    /// Install the access rules. Every group referenced by a channel must exist.
    pub fn set_access_rules(&self, rules: AccessRules) -> Result<(), DatabaseError> {
        for desc in self.descriptors.iter() {
            if !rules.has_group(&desc.group) {
                return Err(DatabaseError::UnknownGroup(
                    desc.group.clone(),
                    desc.name.clone(),
                ));
            }
        }
        *self.rules.write() = rules;
        Ok(())
    }

    /// Decide whether a client (as opposed to the application) may write a channel
    pub fn check_client_write(&self, name: &str) -> Result<(), DatabaseError> {
        let desc = self.descriptor(name)?;
        match desc.access {
            AccessClass::Writable => (),
            AccessClass::Readable | AccessClass::ReadOnlyForClients => {
                return Err(DatabaseError::ReadOnly(name.to_string()))
            }
        }
        if !self.rules.read().can_write(&desc.group) {
            return Err(DatabaseError::AccessDenied(
                name.to_string(),
                desc.group.clone(),
            ));
        }
        Ok(())
    }

    pub fn check_client_read(&self, name: &str) -> Result<(), DatabaseError> {
        let desc = self.descriptor(name)?;
        if !self.rules.read().can_read(&desc.group) {
            return Err(DatabaseError::AccessDenied(
                name.to_string(),
                desc.group.clone(),
            ));
        }
        Ok(())
    }
}
