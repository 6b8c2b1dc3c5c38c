//! Device abstractions used by the motion coordinator: the motion drives
//! ([`ecodrive::Drive`]) and the general purpose I/O ([`gpio::IoBus`]).
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod ecodrive;
pub mod gpio;

/// One of the two drive pairs of an undulator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    /// Drives A and B
    Gap,
    /// Drives I and S
    Phase,
}

impl Axis {
    pub const ALL: [Axis; 2] = [Axis::Gap, Axis::Phase];

    pub fn label(&self) -> &'static str {
        match self {
            Self::Gap => "Gap",
            Self::Phase => "Phase",
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}
