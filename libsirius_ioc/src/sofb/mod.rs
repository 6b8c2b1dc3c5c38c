//! Slow orbit feedback: orbit acquisition, response-matrix inversion, kick
//! processing and the closed-loop and measurement workers.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::config::seconds;

pub mod app;
pub mod correctors;
pub mod engine;
pub mod kicks;
pub mod matrix;
pub mod orbit;

/// Correction planes. RF acts on the orbit through the beam energy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Plane {
    H,
    V,
    RF,
}

impl Plane {
    pub const ALL: [Plane; 3] = [Plane::H, Plane::V, Plane::RF];

    pub fn label(&self) -> &'static str {
        match self {
            Self::H => "H",
            Self::V => "V",
            Self::RF => "RF",
        }
    }

    /// Corrector family name used in channel names
    pub fn family(&self) -> &'static str {
        match self {
            Self::H => "CH",
            Self::V => "CV",
            Self::RF => "RF",
        }
    }

    pub fn index(&self) -> usize {
        match self {
            Self::H => 0,
            Self::V => 1,
            Self::RF => 2,
        }
    }
}

impl fmt::Display for Plane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Sizes of the orbit and corrector vectors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub nr_bpms: usize,
    pub nr_ch: usize,
    pub nr_cv: usize,
    pub has_rf: bool,
}

impl Geometry {
    pub fn nr_rf(&self) -> usize {
        self.has_rf as usize
    }

    pub fn nr_correctors(&self) -> usize {
        self.nr_ch + self.nr_cv + self.nr_rf()
    }

    /// Length of an orbit vector: x readings followed by y readings
    pub fn orbit_len(&self) -> usize {
        2 * self.nr_bpms
    }

    pub fn matrix_len(&self) -> usize {
        self.orbit_len() * self.nr_correctors()
    }

    pub fn plane_of(&self, corrector: usize) -> Plane {
        if corrector < self.nr_ch {
            Plane::H
        } else if corrector < self.nr_ch + self.nr_cv {
            Plane::V
        } else {
            Plane::RF
        }
    }

    /// Index range of a plane inside a corrector vector
    pub fn range(&self, plane: Plane) -> std::ops::Range<usize> {
        match plane {
            Plane::H => 0..self.nr_ch,
            Plane::V => self.nr_ch..self.nr_ch + self.nr_cv,
            Plane::RF => self.nr_ch + self.nr_cv..self.nr_correctors(),
        }
    }
}

/// Accelerator served by a SOFB instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Accelerator {
    SI,
    BO,
}

const SI_BPM_SUBSECTIONS: [&str; 8] = ["M1", "M2", "C1-1", "C1-2", "C2", "C3-1", "C3-2", "C4"];
const SI_CH_SUBSECTIONS: [&str; 6] = ["M1", "M2", "C1", "C2", "C3", "C4"];
const SI_SECTORS: usize = 20;
const BO_BPMS: usize = 50;
const BO_CORRECTORS: usize = 25;

impl Accelerator {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "SI" => Some(Self::SI),
            "BO" => Some(Self::BO),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::SI => "SI",
            Self::BO => "BO",
        }
    }

    pub fn prefix(&self) -> String {
        format!("{}-Glob:AP-SOFB:", self.label())
    }

    pub fn geometry(&self) -> Geometry {
        match self {
            Self::SI => Geometry {
                nr_bpms: SI_SECTORS * SI_BPM_SUBSECTIONS.len(),
                nr_ch: SI_SECTORS * SI_CH_SUBSECTIONS.len(),
                nr_cv: SI_SECTORS * SI_BPM_SUBSECTIONS.len(),
                has_rf: true,
            },
            Self::BO => Geometry {
                nr_bpms: BO_BPMS,
                nr_ch: BO_CORRECTORS,
                nr_cv: BO_CORRECTORS,
                has_rf: false,
            },
        }
    }

    pub fn bpm_names(&self) -> Vec<String> {
        match self {
            Self::SI => (1..=SI_SECTORS)
                .flat_map(|s| SI_BPM_SUBSECTIONS.iter().map(move |sub| format!("SI-{s:02}{sub}:DI-BPM")))
                .collect(),
            Self::BO => (1..=BO_BPMS).map(|i| format!("BO-{i:02}U:DI-BPM")).collect(),
        }
    }

    /// Names of the CH correctors, then the CV correctors
    pub fn corrector_names(&self) -> Vec<String> {
        match self {
            Self::SI => {
                let ch = (1..=SI_SECTORS)
                    .flat_map(|s| SI_CH_SUBSECTIONS.iter().map(move |sub| format!("SI-{s:02}{sub}:PS-CH")));
                let cv = (1..=SI_SECTORS)
                    .flat_map(|s| SI_BPM_SUBSECTIONS.iter().map(move |sub| format!("SI-{s:02}{sub}:PS-CV")));
                ch.chain(cv).collect()
            }
            Self::BO => {
                let ch = (1..=BO_CORRECTORS).map(|i| format!("BO-{:02}U:PS-CH", 2 * i - 1));
                let cv = (1..=BO_CORRECTORS).map(|i| format!("BO-{:02}U:PS-CV", 2 * i));
                ch.chain(cv).collect()
            }
        }
    }
}

impl fmt::Display for Accelerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Correction settings, the `sofb` section of the SOFB IOC configuration.
/// Per-plane arrays are ordered H, V, RF.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SofbConfig {
    /// Closed-loop frequency in Hz
    pub loop_frequency: f64,
    /// Orbit acquisition timeout, in seconds
    pub orbit_timeout: f64,
    /// Δkicks at or below these magnitudes are left alone
    pub kick_tolerance: [f64; 3],
    pub max_kick: [f64; 3],
    pub max_delta_kick: [f64; 3],
    /// Fraction of the computed Δkicks applied per cycle
    pub corr_factor: [f64; 3],
    /// Kick excursion of the response-matrix measurement
    pub meas_delta: [f64; 3],
    /// Settling time after each measurement kick, in seconds
    pub meas_wait: f64,
    pub wait_readbacks: bool,
    /// Timeout of each readback wait, in seconds
    pub readback_timeout: f64,
    pub readback_tolerance: f64,
    /// Event fired to apply kicks synchronously
    pub trigger: Option<String>,
    pub rf_generator: String,
    pub min_sing_value: f64,
    pub tikhonov: f64,
}

impl Default for SofbConfig {
    fn default() -> Self {
        Self {
            loop_frequency: 1.0,
            orbit_timeout: 1.0,
            kick_tolerance: [0.001, 0.001, 0.01],
            max_kick: [300.0, 300.0, 500.0e6],
            max_delta_kick: [5.0, 5.0, 500.0],
            corr_factor: [1.0, 1.0, 1.0],
            meas_delta: [15.0, 15.0, 75.0],
            meas_wait: 1.0,
            wait_readbacks: true,
            readback_timeout: 0.5,
            readback_tolerance: 0.01,
            trigger: None,
            rf_generator: String::from("RF-Gen:GeneralFreq"),
            min_sing_value: 0.2,
            tikhonov: 0.0,
        }
    }
}

impl SofbConfig {
    pub fn loop_period(&self) -> Duration {
        if self.loop_frequency > 0.0 {
            seconds(1.0 / self.loop_frequency)
        } else {
            Duration::from_secs(1)
        }
    }

    pub fn orbit_timeout(&self) -> Duration {
        seconds(self.orbit_timeout)
    }

    pub fn readback_timeout(&self) -> Duration {
        seconds(self.readback_timeout)
    }
}

//Unit tests
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometries() {
        let si = Accelerator::SI.geometry();
        assert_eq!((si.nr_bpms, si.nr_ch, si.nr_cv, si.has_rf), (160, 120, 160, true));
        assert_eq!(Accelerator::SI.bpm_names().len(), 160);
        assert_eq!(Accelerator::SI.corrector_names().len(), 280);
        let bo = Accelerator::BO.geometry();
        assert_eq!(bo.nr_correctors(), 50);
        assert_eq!(Accelerator::BO.bpm_names()[0], "BO-01U:DI-BPM");
        assert_eq!(Accelerator::parse("si"), Some(Accelerator::SI));
        assert_eq!(Accelerator::parse("TB"), None);
    }

    #[test]
    fn test_plane_ranges() {
        let g = Geometry {
            nr_bpms: 4,
            nr_ch: 3,
            nr_cv: 2,
            has_rf: true,
        };
        assert_eq!(g.range(Plane::V), 3..5);
        assert_eq!(g.range(Plane::RF), 5..6);
        assert_eq!(g.plane_of(4), Plane::V);
        assert_eq!(g.plane_of(5), Plane::RF);
        assert_eq!(g.matrix_len(), 8 * 6);
    }
}
