use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::error::ConfigError;

/// Environment variable naming the control-system root prefix
pub const PREFIX_ENV: &str = "VACA_PREFIX";

/// Convert a number of seconds from a config file into a Duration.
/// Negative or non-finite values become zero.
pub fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

/// Read any YAML configuration document
pub fn read_yaml_file<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::BadFilePath(path.to_path_buf()));
    }
    let yaml_str = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str::<T>(&yaml_str)?)
}

/// Write a configuration document (typically a `Default` template) as YAML
pub fn write_yaml_file<T: Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let yaml_str = serde_yaml::to_string(config)?;
    std::fs::write(path, yaml_str)?;
    Ok(())
}

/// Save/restore settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutosaveConfig {
    pub enabled: bool,
    pub dir: PathBuf,
    pub request_file: PathBuf,
    pub basename: String,
    /// Seconds between saves
    pub period: f64,
    /// Number of save files retained per basename
    pub max_files: usize,
    /// Seconds to wait after boot before restoring
    pub restore_delay: f64,
    /// Timeout of each channel read or write, in seconds
    pub timeout: f64,
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: PathBuf::from("autosave"),
            request_file: PathBuf::from("autosave.req"),
            basename: String::from("ioc"),
            period: 30.0,
            max_files: 10,
            restore_delay: 5.0,
            timeout: 1.0,
        }
    }
}

/// Runtime settings shared by every IOC. Applications add their own section
/// next to this one in their configuration file.
///
/// The YAML format is
///
/// ```yml
/// root_prefix: ''
/// prefix: 'SI-10SB:ID-EPU50:'
/// bind_address: 0.0.0.0:0
/// addr_list: []
/// scan_interval: 0.1
/// connection_timeout: 0.5
/// probe_timeout: 0.5
/// queue_capacity: 1000
/// access_rules: null
/// log_dir: log
/// lock_dir: /tmp/sirius_ioc
/// autosave:
///   enabled: false
///   dir: autosave
///   request_file: autosave.req
///   basename: ioc
///   period: 30.0
///   max_files: 10
///   restore_delay: 5.0
///   timeout: 1.0
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IocConfig {
    /// Control-system root prefix; overridden by `VACA_PREFIX`
    pub root_prefix: String,
    /// Device prefix of this IOC, appended to the root prefix
    pub prefix: String,
    pub bind_address: String,
    /// Servers searched, in order, for external channels
    pub addr_list: Vec<String>,
    /// Main loop period in seconds
    pub scan_interval: f64,
    /// External channel timeout in seconds
    pub connection_timeout: f64,
    /// Timeout of the singleton probe in seconds
    pub probe_timeout: f64,
    pub queue_capacity: usize,
    pub access_rules: Option<PathBuf>,
    pub log_dir: PathBuf,
    /// Directory of the per-prefix instance locks
    pub lock_dir: PathBuf,
    pub autosave: AutosaveConfig,
}

impl Default for IocConfig {
    fn default() -> Self {
        Self {
            root_prefix: String::new(),
            prefix: String::new(),
            bind_address: String::from("0.0.0.0:0"),
            addr_list: Vec::new(),
            scan_interval: 0.1,
            connection_timeout: 0.5,
            probe_timeout: 0.5,
            queue_capacity: 1000,
            access_rules: None,
            log_dir: PathBuf::from("log"),
            lock_dir: std::env::temp_dir().join("sirius_ioc"),
            autosave: AutosaveConfig::default(),
        }
    }
}

impl IocConfig {
    /// Read the configuration in a YAML file
    /// Returns a Config if successful
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        read_yaml_file(config_path)
    }

    /// Let `VACA_PREFIX` override the root prefix
    pub fn apply_environment(&mut self) {
        if let Ok(root) = std::env::var(PREFIX_ENV) {
            self.root_prefix = root;
        }
    }

    /// The prefix every served channel name carries on the bus
    pub fn channel_prefix(&self) -> String {
        format!("{}{}", self.root_prefix, self.prefix)
    }

    pub fn scan_period(&self) -> Duration {
        seconds(self.scan_interval)
    }

    pub fn timeout(&self) -> Duration {
        seconds(self.connection_timeout)
    }

    pub fn probe_period(&self) -> Duration {
        seconds(self.probe_timeout)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scan_interval <= 0.0 || !self.scan_interval.is_finite() {
            return Err(ConfigError::Invalid(format!(
                "scan_interval must be positive; got {}",
                self.scan_interval
            )));
        }
        if self.lock_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(String::from(
                "lock_dir must name a directory",
            )));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid(String::from(
                "queue_capacity must be at least 1",
            )));
        }
        if self.autosave.enabled && self.autosave.max_files == 0 {
            return Err(ConfigError::Invalid(String::from(
                "autosave.max_files must be at least 1",
            )));
        }
        Ok(())
    }
}

//Unit tests
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_round_trips_through_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ioc.yml");
        let mut config = IocConfig::default();
        config.prefix = String::from("SI-10SB:ID-EPU50:");
        write_yaml_file(&path, &config).unwrap();
        assert_eq!(IocConfig::read_config_file(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ioc.yml");
        std::fs::write(&path, "prefix: 'SI-Glob:AP-SOFB:'\nscan_interval: 0.5\n").unwrap();
        let config = IocConfig::read_config_file(&path).unwrap();
        assert_eq!(config.prefix, "SI-Glob:AP-SOFB:");
        assert_eq!(config.scan_period(), Duration::from_millis(500));
        assert_eq!(config.queue_capacity, 1000);
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            IocConfig::read_config_file(Path::new("/definitely/not/here.yml")),
            Err(ConfigError::BadFilePath(_))
        ));
    }

    #[test]
    fn test_validation() {
        let mut config = IocConfig::default();
        assert!(config.validate().is_ok());
        config.scan_interval = 0.0;
        assert!(config.validate().is_err());
        config.scan_interval = 0.1;
        config.lock_dir = PathBuf::new();
        assert!(config.validate().is_err());
        assert_eq!(seconds(-1.0), Duration::ZERO);
    }
}
