//! State of a drive pair and the interlocks guarding its transitions.
//!
//! ```text
//! faulted --clear_error--> disabled --enable--> enabled-halted
//!   --halt-release--> enabled-released --start--> moving --converged--> reached
//! ```
//! Any state falls back to `faulted` when a drive reports a fault or stops
//! answering.
use crate::devices::ecodrive::{is_clearable_fault, READY_TO_ENABLE, READY_TO_MOVE};
use crate::devices::Axis;

/// Minutes to seconds, drives take velocities in mm/min
const SECONDS_PER_MINUTE: f64 = 60.0;

/// Labels of the drives of a pair, as used in channel names
pub fn drive_labels(axis: Axis) -> [&'static str; 2] {
    match axis {
        Axis::Gap => ["A", "B"],
        Axis::Phase => ["I", "S"],
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    Faulted,
    Disabled,
    EnabledHalted,
    EnabledReleased,
    Moving,
    Reached,
}

impl PairState {
    pub const LABELS: [&'static str; 6] = [
        "Faulted",
        "Disabled",
        "EnabledHalted",
        "EnabledReleased",
        "Moving",
        "Reached",
    ];

    pub fn index(&self) -> u16 {
        match self {
            Self::Faulted => 0,
            Self::Disabled => 1,
            Self::EnabledHalted => 2,
            Self::EnabledReleased => 3,
            Self::Moving => 4,
            Self::Reached => 5,
        }
    }
}

/// Registers of one drive as last read
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DriveSnapshot {
    pub diagnostic: String,
    pub encoder: f64,
    pub resolver: f64,
    pub target_position: f64,
    pub target_velocity: f64,
    pub max_velocity: f64,
    pub halted: bool,
}

/// Everything known about a pair at one instant. `None` marks a device that
/// did not answer.
#[derive(Debug, Clone, PartialEq)]
pub struct PairSnapshot {
    pub axis: Axis,
    pub drives: [Option<DriveSnapshot>; 2],
    pub enabled: Option<bool>,
    pub released: Option<bool>,
    pub moving: bool,
    /// Both drives accepted the last target and velocity writes
    pub consistent: bool,
}

impl PairSnapshot {
    pub fn disconnected(axis: Axis) -> Self {
        Self {
            axis,
            drives: [None, None],
            enabled: None,
            released: None,
            moving: false,
            consistent: true,
        }
    }

    /// Encoder position of the pair's reference drive
    pub fn position(&self) -> Option<f64> {
        self.drives[0].as_ref().map(|d| d.encoder)
    }

    fn connected(&self) -> Option<[&DriveSnapshot; 2]> {
        match &self.drives {
            [Some(a), Some(b)] => Some([a, b]),
            _ => None,
        }
    }

    pub fn is_faulted(&self) -> bool {
        match self.connected() {
            Some(drives) => {
                self.enabled.is_none()
                    || drives.iter().any(|d| is_clearable_fault(&d.diagnostic))
            }
            None => true,
        }
    }

    pub fn state(&self, tolerance: f64) -> PairState {
        if self.is_faulted() {
            return PairState::Faulted;
        }
        if !self.enabled.unwrap_or(false) {
            return PairState::Disabled;
        }
        if !self.released.unwrap_or(false) {
            return PairState::EnabledHalted;
        }
        if self.moving {
            return PairState::Moving;
        }
        match self.connected() {
            Some(drives)
                if drives
                    .iter()
                    .all(|d| (d.encoder - d.target_position).abs() <= tolerance) =>
            {
                PairState::Reached
            }
            _ => PairState::EnabledReleased,
        }
    }

    fn refuse(&self, action: &str, reason: String) -> Result<(), String> {
        Err(format!("{} {action} refused: {reason}", self.axis))
    }

    fn require_connected(&self, action: &str) -> Result<[&DriveSnapshot; 2], String> {
        let labels = drive_labels(self.axis);
        for (idx, drive) in self.drives.iter().enumerate() {
            if drive.is_none() {
                self.refuse(action, format!("drive {} not connected", labels[idx]))?;
            }
        }
        if self.enabled.is_none() || self.released.is_none() {
            self.refuse(action, String::from("GPIO not connected"))?;
        }
        self.connected()
            .ok_or_else(|| format!("{} {action} refused: drives not connected", self.axis))
    }

    fn require_diagnostic(&self, action: &str, expected: &str) -> Result<(), String> {
        let labels = drive_labels(self.axis);
        let drives = self.require_connected(action)?;
        for (label, drive) in labels.iter().zip(drives) {
            if drive.diagnostic != expected {
                self.refuse(
                    action,
                    format!("drive {label} diagnostic is {}, expected {expected}", drive.diagnostic),
                )?;
            }
        }
        Ok(())
    }

    /// `disabled -> enabled-halted`
    pub fn check_enable(&self) -> Result<(), String> {
        self.require_diagnostic("enable", READY_TO_ENABLE)
    }

    /// `enabled-halted -> enabled-released`
    pub fn check_release(&self) -> Result<(), String> {
        self.require_diagnostic("release", READY_TO_MOVE)
    }

    /// `faulted -> disabled`: every fault shown must be one a reset clears
    pub fn check_clear(&self) -> Result<(), String> {
        let labels = drive_labels(self.axis);
        let drives = self.require_connected("reset")?;
        for (label, drive) in labels.iter().zip(drives) {
            let code = &drive.diagnostic;
            if !is_clearable_fault(code) && code != READY_TO_ENABLE && code != READY_TO_MOVE {
                self.refuse("reset", format!("drive {label} diagnostic {code} is not clearable"))?;
            }
        }
        Ok(())
    }

    /// `enabled-released -> moving`
    pub fn check_start(&self, limits: [f64; 2], tolerance: f64) -> Result<(), String> {
        let drives = self.require_connected("start")?;
        if self.enabled != Some(true) {
            self.refuse("start", String::from("drives not enabled"))?;
        }
        if self.released != Some(true) {
            self.refuse("start", String::from("halt not released"))?;
        }
        self.require_diagnostic("start", READY_TO_MOVE)?;
        if !self.consistent {
            self.refuse("start", String::from("drive setpoints inconsistent"))?;
        }
        let [a, b] = drives;
        if (a.target_position - b.target_position).abs() > tolerance {
            self.refuse(
                "start",
                format!("targets differ ({} vs {})", a.target_position, b.target_position),
            )?;
        }
        if (a.target_velocity - b.target_velocity).abs() > tolerance {
            self.refuse(
                "start",
                format!("velocities differ ({} vs {})", a.target_velocity, b.target_velocity),
            )?;
        }
        if a.target_position < limits[0] || a.target_position > limits[1] {
            self.refuse(
                "start",
                format!(
                    "target {} outside soft limits [{}, {}]",
                    a.target_position, limits[0], limits[1]
                ),
            )?;
        }
        Ok(())
    }
}

/// Drive velocity in mm/min for a requested speed in mm/s, bounded by the
/// maximum speed channel and by the drive's own maximum velocity
pub fn drive_velocity(speed: f64, max_speed: f64, drive_max_velocity: f64) -> f64 {
    (speed.min(max_speed) * SECONDS_PER_MINUTE)
        .min(drive_max_velocity)
        .max(0.0)
}

pub fn clamp_max_speed(requested: f64, ceiling: f64) -> f64 {
    requested.clamp(0.0, ceiling)
}
