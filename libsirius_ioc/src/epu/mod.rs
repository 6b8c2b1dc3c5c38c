//! The EPU50 insertion-device controller: two pairs of motion drives (gap and
//! phase) coordinated through enable, halt-release and start interlocks.
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::seconds;

pub mod app;
pub mod axis;
pub mod coordinator;

/// Where one undulator's devices live
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EpuDevice {
    pub name: String,
    pub prefix: String,
    /// Serial bridge shared by the four drives
    pub drive_line: String,
    pub gpio_address: String,
    /// Bus addresses of drives A, B, I and S
    pub drive_addresses: [u8; 4],
}

impl Default for EpuDevice {
    fn default() -> Self {
        Self {
            name: String::from("EPU50"),
            prefix: String::from("SI-10SB:ID-EPU50:"),
            drive_line: String::from("127.0.0.1:4001"),
            gpio_address: String::from("127.0.0.1:5050"),
            drive_addresses: [1, 2, 3, 4],
        }
    }
}

/// Motion settings, the `epu` section of the EPU IOC configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EpuConfig {
    pub devices: Vec<EpuDevice>,
    /// Soft limits of the gap target, in mm
    pub gap_limits: [f64; 2],
    /// Soft limits of the phase target, in mm
    pub phase_limits: [f64; 2],
    /// Ceiling of the maximum speed channels, in mm/s
    pub speed_ceiling: f64,
    /// Position convergence tolerance, in mm
    pub tolerance: f64,
    /// Period of the standstill monitor, in seconds
    pub standstill_period: f64,
    /// Period of the movement monitor, in seconds
    pub moving_period: f64,
    /// How long to wait for a drive to reach a diagnostic, in seconds
    pub device_timeout: f64,
    /// Longest movement before the monitor gives up, in seconds
    pub move_timeout: f64,
}

impl Default for EpuConfig {
    fn default() -> Self {
        Self {
            devices: vec![EpuDevice::default()],
            gap_limits: [22.0, 300.0],
            phase_limits: [-25.0, 25.0],
            speed_ceiling: 10.0,
            tolerance: 0.001,
            standstill_period: 1.0,
            moving_period: 0.05,
            device_timeout: 2.0,
            move_timeout: 600.0,
        }
    }
}

impl EpuConfig {
    /// The device named `name`, or the first one configured
    pub fn device(&self, name: Option<&str>) -> Option<&EpuDevice> {
        match name {
            Some(name) => self.devices.iter().find(|d| d.name == name),
            None => self.devices.first(),
        }
    }

    pub fn standstill_period(&self) -> Duration {
        seconds(self.standstill_period)
    }

    pub fn moving_period(&self) -> Duration {
        seconds(self.moving_period)
    }

    pub fn device_timeout(&self) -> Duration {
        seconds(self.device_timeout)
    }

    pub fn move_timeout(&self) -> Duration {
        seconds(self.move_timeout)
    }
}
