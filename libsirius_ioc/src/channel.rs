//! The channel data model: names, suffix policy, types, values and alarms.
//!
//! A channel name is a colon separated hierarchy such as
//! `SI-10SB:ID-EPU50:Gap-SP`. Inside a database names are stored without the
//! process prefix, so the local name of the example above is `Gap-SP` when the
//! IOC prefix is `SI-10SB:ID-EPU50:`.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::error::ChannelError;

/// Longest string a scalar string channel will hold. Longer values are truncated.
pub const MAX_STRING_LEN: usize = 255;

/// Seconds since the unix epoch, as carried in every [`Reading`]
pub fn now_timestamp() -> f64 {
    time::OffsetDateTime::now_utc().unix_timestamp_nanos() as f64 / 1.0e9
}

/// The intent conveyed by the last `-Xxx` segment of a channel name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suffix {
    Setpoint,
    Readback,
    Select,
    Status,
    Command,
    Monitor,
    Constant,
    Other,
}

impl Suffix {
    pub fn of(name: &str) -> Self {
        let tail = match name.rsplit_once('-') {
            Some((_, tail)) => tail,
            None => return Self::Other,
        };
        match tail {
            "SP" => Self::Setpoint,
            "RB" => Self::Readback,
            "Sel" => Self::Select,
            "Sts" => Self::Status,
            "Cmd" => Self::Command,
            "Mon" => Self::Monitor,
            "Cte" => Self::Constant,
            _ => Self::Other,
        }
    }

    /// Only setpoints, selectors and commands may be written by clients
    pub fn is_writable(&self) -> bool {
        matches!(self, Self::Setpoint | Self::Select | Self::Command)
    }
}

/// Name of the readback paired with a setpoint or selector, if any
pub fn readback_name(name: &str) -> Option<String> {
    match Suffix::of(name) {
        Suffix::Setpoint => Some(format!("{}-RB", &name[..name.len() - 3])),
        Suffix::Select => Some(format!("{}-Sts", &name[..name.len() - 4])),
        _ => None,
    }
}

/// Check that a channel name is ASCII, free of whitespace, made of non-empty
/// colon separated segments and terminated by a `-Suffix`.
pub fn validate_name(name: &str) -> Result<(), ChannelError> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_graphic()) {
        return Err(ChannelError::BadName(name.to_string()));
    }
    if name.split(':').any(|seg| seg.is_empty()) {
        return Err(ChannelError::BadName(name.to_string()));
    }
    match name.rsplit_once('-') {
        Some((head, tail))
            if !head.is_empty() && !tail.is_empty() && tail.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            Ok(())
        }
        _ => Err(ChannelError::BadName(name.to_string())),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelType {
    Int,
    Float,
    Enum,
    String,
    Char,
}

/// Alarm severity, ordered from harmless to unusable
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum Severity {
    #[default]
    NoAlarm,
    Minor,
    Major,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Condition {
    #[default]
    NoAlarm,
    HiHi,
    High,
    Low,
    LoLo,
    Timeout,
    Disconnected,
    Comm,
    State,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Alarm {
    pub severity: Severity,
    pub condition: Condition,
}

impl Alarm {
    pub const NONE: Alarm = Alarm {
        severity: Severity::NoAlarm,
        condition: Condition::NoAlarm,
    };

    pub fn new(severity: Severity, condition: Condition) -> Self {
        Self {
            severity,
            condition,
        }
    }

    pub fn disconnected() -> Self {
        Self::new(Severity::Invalid, Condition::Disconnected)
    }

    pub fn timeout() -> Self {
        Self::new(Severity::Invalid, Condition::Timeout)
    }

    pub fn comm() -> Self {
        Self::new(Severity::Invalid, Condition::Comm)
    }

    pub fn is_invalid(&self) -> bool {
        self.severity == Severity::Invalid
    }
}

/// Who may write a channel.
///
/// `ReadOnlyForClients` channels carry a writable suffix but are driven by the
/// application only (e.g. a selector locked during a measurement).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessClass {
    Readable,
    Writable,
    ReadOnlyForClients,
}

/// The value of a channel. Scalars and fixed size arrays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChannelValue {
    Int(i32),
    Float(f64),
    Enum(u16),
    Str(String),
    Bytes(Vec<u8>),
    IntArray(Vec<i32>),
    FloatArray(Vec<f64>),
    StrArray(Vec<String>),
}

impl ChannelValue {
    pub fn channel_type(&self) -> ChannelType {
        match self {
            Self::Int(_) | Self::IntArray(_) => ChannelType::Int,
            Self::Float(_) | Self::FloatArray(_) => ChannelType::Float,
            Self::Enum(_) => ChannelType::Enum,
            Self::Str(_) | Self::StrArray(_) => ChannelType::String,
            Self::Bytes(_) => ChannelType::Char,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Bytes(v) => v.len(),
            Self::IntArray(v) => v.len(),
            Self::FloatArray(v) => v.len(),
            Self::StrArray(v) => v.len(),
            _ => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Enum(v) => Some(*v as f64),
            Self::Str(s) => s.trim().parse().ok(),
            Self::IntArray(v) if v.len() == 1 => Some(v[0] as f64),
            Self::FloatArray(v) if v.len() == 1 => Some(v[0]),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v as i64),
            Self::Enum(v) => Some(*v as i64),
            Self::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            Self::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.as_i64().map(|v| v != 0)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn to_f64_vec(&self) -> Option<Vec<f64>> {
        match self {
            Self::FloatArray(v) => Some(v.clone()),
            Self::IntArray(v) => Some(v.iter().map(|x| *x as f64).collect()),
            Self::Int(_) | Self::Float(_) | Self::Enum(_) => self.as_f64().map(|x| vec![x]),
            _ => None,
        }
    }

    /// Every numeric element, used for limit checks. Empty for text values.
    pub fn numeric_elements(&self) -> Vec<f64> {
        match self {
            Self::Int(v) => vec![*v as f64],
            Self::Float(v) => vec![*v],
            Self::IntArray(v) => v.iter().map(|x| *x as f64).collect(),
            Self::FloatArray(v) => v.clone(),
            _ => vec![],
        }
    }

    /// The enum index this value designates for a channel with the given labels
    pub fn enum_index(&self, labels: &[String]) -> Option<i64> {
        match self {
            Self::Str(s) => match labels.iter().position(|l| l == s.trim()) {
                Some(idx) => Some(idx as i64),
                None => s.trim().parse().ok(),
            },
            _ => self.as_i64(),
        }
    }

    /// Convert this value into one that fits the descriptor's type and count
    pub fn coerce(&self, desc: &ChannelDescriptor) -> Result<ChannelValue, ChannelError> {
        let mismatch = || ChannelError::TypeMismatch {
            name: desc.name.clone(),
            expected: desc.ctype,
            found: self.channel_type(),
        };
        let value = match (desc.ctype, desc.count > 1) {
            (ChannelType::Float, false) => ChannelValue::Float(self.as_f64().ok_or_else(mismatch)?),
            (ChannelType::Int, false) => {
                let v = self.as_i64().ok_or_else(mismatch)?;
                ChannelValue::Int(i32::try_from(v).map_err(|_| mismatch())?)
            }
            (ChannelType::Enum, _) => {
                let idx = self.enum_index(&desc.enums).ok_or_else(mismatch)?;
                if idx < 0 || idx as usize >= desc.enums.len() {
                    return Err(ChannelError::EnumOutOfRange(desc.name.clone(), idx));
                }
                ChannelValue::Enum(idx as u16)
            }
            (ChannelType::String, false) => match self {
                Self::Str(s) => ChannelValue::Str(truncate(s, MAX_STRING_LEN)),
                _ => return Err(mismatch()),
            },
            (ChannelType::Char, _) => match self {
                Self::Bytes(b) => ChannelValue::Bytes(b.clone()),
                Self::Str(s) => ChannelValue::Bytes(s.as_bytes().to_vec()),
                _ => return Err(mismatch()),
            },
            (ChannelType::Float, true) => ChannelValue::FloatArray(match self {
                Self::Str(s) => parse_elements(s).ok_or_else(mismatch)?,
                other => other.to_f64_vec().ok_or_else(mismatch)?,
            }),
            (ChannelType::Int, true) => ChannelValue::IntArray(match self {
                Self::IntArray(v) => v.clone(),
                Self::Int(v) => vec![*v],
                Self::Str(s) => parse_elements(s).ok_or_else(mismatch)?,
                Self::FloatArray(v) if v.iter().all(|x| x.fract() == 0.0) => {
                    v.iter().map(|x| *x as i32).collect()
                }
                _ => return Err(mismatch()),
            }),
            (ChannelType::String, true) => ChannelValue::StrArray(match self {
                Self::StrArray(v) => v.clone(),
                Self::Str(s) => s.split_whitespace().map(String::from).collect(),
                _ => return Err(mismatch()),
            }),
        };
        if value.len() > desc.count.max(1) {
            return Err(ChannelError::TooManyElements(
                desc.name.clone(),
                value.len(),
                desc.count,
            ));
        }
        Ok(value)
    }
}

fn parse_elements<T: std::str::FromStr>(text: &str) -> Option<Vec<T>> {
    text.split_whitespace().map(|s| s.parse().ok()).collect()
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|x| x.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Values render the way save files store them: arrays space separated
impl fmt::Display for ChannelValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Enum(v) => write!(f, "{v}"),
            Self::Str(s) => write!(f, "{s}"),
            Self::Bytes(b) => write!(f, "{}", String::from_utf8_lossy(b)),
            Self::IntArray(v) => write!(f, "{}", join(v)),
            Self::FloatArray(v) => write!(f, "{}", join(v)),
            Self::StrArray(v) => write!(f, "{}", join(v)),
        }
    }
}

/// A value together with its alarm state and the time it was produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub value: ChannelValue,
    pub alarm: Alarm,
    pub timestamp: f64,
}

impl Reading {
    pub fn new(value: ChannelValue) -> Self {
        Self {
            value,
            alarm: Alarm::NONE,
            timestamp: now_timestamp(),
        }
    }
}

/// Declarative description of one channel, the unit of a database description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    pub name: String,
    pub ctype: ChannelType,
    pub count: usize,
    pub value: ChannelValue,
    pub unit: String,
    pub prec: u8,
    /// Control limits. Client writes outside of them are refused.
    pub lolim: Option<f64>,
    pub hilim: Option<f64>,
    /// Minor alarm limits
    pub low: Option<f64>,
    pub high: Option<f64>,
    /// Major alarm limits
    pub lolo: Option<f64>,
    pub hihi: Option<f64>,
    pub enums: Vec<String>,
    pub access: AccessClass,
    pub group: String,
    pub scan: Option<Duration>,
}

impl ChannelDescriptor {
    fn new(name: &str, ctype: ChannelType, count: usize, value: ChannelValue) -> Self {
        let access = if Suffix::of(name).is_writable() {
            AccessClass::Writable
        } else {
            AccessClass::Readable
        };
        Self {
            name: name.to_string(),
            ctype,
            count,
            value,
            unit: String::new(),
            prec: 0,
            lolim: None,
            hilim: None,
            low: None,
            high: None,
            lolo: None,
            hihi: None,
            enums: Vec::new(),
            access,
            group: String::from("default"),
            scan: None,
        }
    }

    pub fn float(name: &str, value: f64) -> Self {
        Self::new(name, ChannelType::Float, 1, ChannelValue::Float(value))
    }

    pub fn int(name: &str, value: i32) -> Self {
        Self::new(name, ChannelType::Int, 1, ChannelValue::Int(value))
    }

    pub fn string(name: &str, value: &str) -> Self {
        Self::new(name, ChannelType::String, 1, ChannelValue::Str(value.to_string()))
    }

    pub fn enumeration(name: &str, labels: &[&str], value: u16) -> Self {
        let mut desc = Self::new(name, ChannelType::Enum, 1, ChannelValue::Enum(value));
        desc.enums = labels.iter().map(|l| l.to_string()).collect();
        desc
    }

    pub fn float_array(name: &str, count: usize, value: Vec<f64>) -> Self {
        Self::new(name, ChannelType::Float, count, ChannelValue::FloatArray(value))
    }

    pub fn int_array(name: &str, count: usize, value: Vec<i32>) -> Self {
        Self::new(name, ChannelType::Int, count, ChannelValue::IntArray(value))
    }

    pub fn string_array(name: &str, value: Vec<String>) -> Self {
        let count = value.len().max(1);
        Self::new(name, ChannelType::String, count, ChannelValue::StrArray(value))
    }

    pub fn bytes(name: &str, count: usize) -> Self {
        Self::new(name, ChannelType::Char, count, ChannelValue::Bytes(Vec::new()))
    }

    pub fn unit(mut self, unit: &str) -> Self {
        self.unit = unit.to_string();
        self
    }

    pub fn prec(mut self, prec: u8) -> Self {
        self.prec = prec;
        self
    }

    pub fn limits(mut self, lolim: f64, hilim: f64) -> Self {
        self.lolim = Some(lolim);
        self.hilim = Some(hilim);
        self
    }

    pub fn minor_alarm(mut self, low: f64, high: f64) -> Self {
        self.low = Some(low);
        self.high = Some(high);
        self
    }

    pub fn major_alarm(mut self, lolo: f64, hihi: f64) -> Self {
        self.lolo = Some(lolo);
        self.hihi = Some(hihi);
        self
    }

    pub fn access(mut self, access: AccessClass) -> Self {
        self.access = access;
        self
    }

    pub fn group(mut self, group: &str) -> Self {
        self.group = group.to_string();
        self
    }

    pub fn scan(mut self, period: Duration) -> Self {
        self.scan = Some(period);
        self
    }

    pub fn suffix(&self) -> Suffix {
        Suffix::of(&self.name)
    }

    /// Alarm implied by the value's position relative to the alarm limits.
    /// Values exactly at a limit do not alarm.
    pub fn limit_alarm(&self, value: &ChannelValue) -> Alarm {
        let mut alarm = Alarm::NONE;
        for v in value.numeric_elements() {
            let candidate = if self.hihi.is_some_and(|l| v > l) {
                Alarm::new(Severity::Major, Condition::HiHi)
            } else if self.lolo.is_some_and(|l| v < l) {
                Alarm::new(Severity::Major, Condition::LoLo)
            } else if self.high.is_some_and(|l| v > l) {
                Alarm::new(Severity::Minor, Condition::High)
            } else if self.low.is_some_and(|l| v < l) {
                Alarm::new(Severity::Minor, Condition::Low)
            } else {
                Alarm::NONE
            };
            if candidate.severity > alarm.severity {
                alarm = candidate;
            }
        }
        alarm
    }

    /// True if every numeric element lies within the control limits (inclusive)
    pub fn within_limits(&self, value: &ChannelValue) -> bool {
        value.numeric_elements().iter().all(|v| {
            self.lolim.map_or(true, |lo| *v >= lo) && self.hilim.map_or(true, |hi| *v <= hi)
        })
    }
}
