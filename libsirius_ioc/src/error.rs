use std::path::PathBuf;
use thiserror::Error;

use super::channel::ChannelType;

#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    #[error("Malformed channel name {0:?}")]
    BadName(String),
    #[error("Channel {name} expects a value of type {expected:?}; found {found:?}")]
    TypeMismatch {
        name: String,
        expected: ChannelType,
        found: ChannelType,
    },
    #[error("Enum index {1} is out of range for channel {0}")]
    EnumOutOfRange(String, i64),
    #[error("Channel {0} holds at most {2} elements; got {1}")]
    TooManyElements(String, usize, usize),
}

#[derive(Debug, Clone, Error)]
pub enum DatabaseError {
    #[error("Unknown channel {0}")]
    UnknownChannel(String),
    #[error("Channel {0} is declared more than once")]
    DuplicateChannel(String),
    #[error("Enum channel {0} has no labels")]
    MissingEnumLabels(String),
    #[error("Access group {0} of channel {1} is not defined in the access rules")]
    UnknownGroup(String, String),
    #[error("Channel {0} is read-only for clients")]
    ReadOnly(String),
    #[error("Access to channel {0} denied by group {1}")]
    AccessDenied(String, String),
    #[error("Database failed due to channel error: {0}")]
    Channel(#[from] ChannelError),
}

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("Could not load access rules as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Access rules do not define the default group")]
    MissingDefault,
    #[error("Access rules failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Access rules failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("Bus frame of {0} bytes exceeds the frame size limit")]
    FrameTooLong(usize),
    #[error("Bus failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Bus failed to (de)serialize a frame: {0}")]
    ParsingError(#[from] serde_json::Error),
    #[error("Could not resolve bus address {0}")]
    BadAddress(String),
    #[error("Timed out waiting for {0}")]
    Timeout(String),
    #[error("Channel {0} is not connected")]
    Disconnected(String),
    #[error("No server on the address list serves channel {0}")]
    NotFound(String),
    #[error("Write to {0} rejected: {1}")]
    Rejected(String, String),
    #[error("Unexpected reply for {0}")]
    UnexpectedResponse(String),
    #[error("Channel client is shut down")]
    ShutDown,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Work queue consumer is already running")]
    AlreadyStarted,
    #[error("Work queue failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

/// Reasons a client write is refused, in the order they are checked
#[derive(Debug, Clone, Error)]
pub enum WriteRejection {
    #[error("Write to unknown channel {0}")]
    UnknownChannel(String),
    #[error("Write to {0} rejected: channel is read-only")]
    ReadOnlySuffix(String),
    #[error("Write to {0} rejected: {1}")]
    AccessDenied(String, String),
    #[error("Write to {0} rejected: null value")]
    NullValue(String),
    #[error("Write to {0} rejected: enum index {1} out of range")]
    EnumOutOfRange(String, i64),
    #[error("Write to {0} rejected: type mismatch ({1})")]
    TypeMismatch(String, String),
    #[error("Write to {name} rejected: value {value} out of range [{low}, {high}]")]
    OutOfRange {
        name: String,
        value: String,
        low: f64,
        high: f64,
    },
    #[error("Write to {0} rejected by the application")]
    Application(String),
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Logging failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Logging failed due to spdlog error: {0}")]
    SpdlogError(#[from] spdlog::Error),
    #[error("Logging failed to install the log crate proxy: {0}")]
    ProxyError(#[from] log::SetLoggerError),
}

#[derive(Debug, Error)]
pub enum AutosaveError {
    #[error("Could not load save request as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("No save file found in {0:?}")]
    NoSaveFile(PathBuf),
    #[error("Autosave failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Autosave failed to format a timestamp: {0}")]
    FormatError(#[from] time::error::Format),
}

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("Drive failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Drive {0} sent a malformed reply: {1:?}")]
    Protocol(u8, String),
    #[error("Drive {0} reported error {1}")]
    DeviceError(u8, String),
    #[error("Drive {0} did not answer after {1} attempts")]
    Unresponsive(u8, usize),
}

#[derive(Debug, Error)]
pub enum GpioError {
    #[error("GPIO failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("GPIO reply checksum mismatch: expected {0:#04x}, found {1:#04x}")]
    BadChecksum(u8, u8),
    #[error("GPIO reply has unexpected op code {0:#04x}")]
    UnexpectedOp(u8),
    #[error("GPIO device answered with error code {0:#04x}")]
    DeviceError(u8),
    #[error("GPIO payload of {0} bytes is too long")]
    PayloadTooLong(usize),
    #[error("GPIO variable {0:#04x} returned an empty payload")]
    EmptyPayload(u8),
}

#[derive(Debug, Error)]
pub enum EpuError {
    #[error("EPU failed due to drive error: {0}")]
    DriveError(#[from] DriveError),
    #[error("EPU failed due to GPIO error: {0}")]
    GpioError(#[from] GpioError),
    #[error("{0}")]
    Interlock(String),
    #[error("Timed out waiting for {0}")]
    Timeout(String),
    #[error("EPU failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Clone, Error)]
pub enum KickError {
    #[error("Kicks above MaxKick{0}")]
    AboveMaxKick(&'static str),
    #[error("Plane {0} has {1} kicks but {2} deltas")]
    LengthMismatch(&'static str, usize, usize),
}

#[derive(Debug, Error)]
pub enum SofbError {
    #[error("SOFB failed due to kick error: {0}")]
    KickError(#[from] KickError),
    #[error("SOFB failed due to bus error: {0}")]
    BusError(#[from] BusError),
    #[error("SOFB failed due to database error: {0}")]
    DatabaseError(#[from] DatabaseError),
    #[error("{0} not connected")]
    NotConnected(String),
    #[error("Response matrix has {found} elements; expected {expected}")]
    MatrixShape { expected: usize, found: usize },
    #[error("Expected {expected} {what} values; found {found}")]
    Length {
        what: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("{what} must be finite and not negative; got {value}")]
    InvalidParameter { what: &'static str, value: f64 },
    #[error("{0}")]
    Busy(String),
    #[error("SOFB failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Fatal errors. Any of these ends the process before or instead of the main loop.
#[derive(Debug, Error)]
pub enum IocError {
    #[error("Another instance of this IOC is already running")]
    AlreadyRunning,
    #[error("IOC failed due to config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("IOC failed due to database error: {0}")]
    DatabaseError(#[from] DatabaseError),
    #[error("IOC failed due to access rules error: {0}")]
    AccessError(#[from] AccessError),
    #[error("IOC failed due to bus error: {0}")]
    BusError(#[from] BusError),
    #[error("IOC failed due to work queue error: {0}")]
    QueueError(#[from] QueueError),
    #[error("IOC failed due to logging error: {0}")]
    LoggingError(#[from] LoggingError),
    #[error("IOC failed due to autosave error: {0}")]
    AutosaveError(#[from] AutosaveError),
    #[error("IOC failed due to EPU error: {0}")]
    EpuError(#[from] EpuError),
    #[error("IOC failed due to SOFB error: {0}")]
    SofbError(#[from] SofbError),
    #[error("IOC failed to install signal handlers: {0}")]
    SignalError(#[from] ctrlc::Error),
    #[error("IOC failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}
