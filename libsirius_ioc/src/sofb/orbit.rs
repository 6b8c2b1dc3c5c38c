//! Orbit acquisition from the BPMs, smoothing and referencing.
use fxhash::FxHashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::bus::client::{ChannelClient, ExternalChannel};
use crate::channel::ChannelValue;
use crate::error::SofbError;

/// Where the orbit is taken from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrbitMode {
    /// A fixed orbit written by the operator
    Offline,
    SlowOrb,
    MultiTurn,
    SinglePass,
}

impl OrbitMode {
    pub const LABELS: [&'static str; 4] = ["Offline", "SlowOrb", "MultiTurn", "SinglePass"];

    pub fn from_index(idx: u16) -> Option<Self> {
        match idx {
            0 => Some(Self::Offline),
            1 => Some(Self::SlowOrb),
            2 => Some(Self::MultiTurn),
            3 => Some(Self::SinglePass),
            _ => None,
        }
    }

    pub fn index(&self) -> u16 {
        match self {
            Self::Offline => 0,
            Self::SlowOrb => 1,
            Self::MultiTurn => 2,
            Self::SinglePass => 3,
        }
    }

    fn suffixes(&self) -> Option<[&'static str; 2]> {
        match self {
            Self::Offline => None,
            Self::SlowOrb => Some(["PosX-Mon", "PosY-Mon"]),
            Self::MultiTurn => Some(["MTPosX-Mon", "MTPosY-Mon"]),
            Self::SinglePass => Some(["SPPosX-Mon", "SPPosY-Mon"]),
        }
    }
}

/// Supplier of raw BPM readings
pub trait OrbitSource: Send + Sync {
    /// x readings of every BPM followed by the y readings. Never called in
    /// `Offline` mode.
    fn acquire(&self, mode: OrbitMode, timeout: Duration) -> Result<Vec<f64>, SofbError>;

    fn connected(&self) -> bool;
}

/// Orbit read from the position channels of the BPMs
#[derive(Debug)]
pub struct BpmOrbit {
    client: Arc<ChannelClient>,
    bpms: Vec<String>,
    handles: Mutex<FxHashMap<OrbitMode, Vec<ExternalChannel>>>,
}

impl BpmOrbit {
    pub fn new(client: Arc<ChannelClient>, bpms: Vec<String>) -> Self {
        let orbit = Self {
            client,
            bpms,
            handles: Mutex::new(FxHashMap::default()),
        };
        // The slow orbit is the default; connect to it right away
        orbit.handles(OrbitMode::SlowOrb);
        orbit
    }

    // Handles are created the first time a mode is used: x of every BPM, then y
    fn handles(&self, mode: OrbitMode) -> Vec<ExternalChannel> {
        let suffixes = match mode.suffixes() {
            Some(suffixes) => suffixes,
            None => return Vec::new(),
        };
        self.handles
            .lock()
            .entry(mode)
            .or_insert_with(|| {
                suffixes
                    .iter()
                    .flat_map(|suffix| {
                        self.bpms
                            .iter()
                            .map(move |bpm| self.client.channel(&format!("{bpm}:{suffix}")))
                    })
                    .collect()
            })
            .clone()
    }
}

// Multi-turn channels carry one reading per turn
fn position(value: &ChannelValue) -> Option<f64> {
    let samples = value.to_f64_vec()?;
    if samples.is_empty() {
        return None;
    }
    Some(samples.iter().sum::<f64>() / samples.len() as f64)
}

impl OrbitSource for BpmOrbit {
    fn acquire(&self, mode: OrbitMode, timeout: Duration) -> Result<Vec<f64>, SofbError> {
        let handles = self.handles(mode);
        let mut orbit = Vec::with_capacity(handles.len());
        for handle in handles.iter() {
            let value = match handle.valid_value() {
                Some(value) => value,
                None => handle.get(timeout)?.value,
            };
            let pos = position(&value).ok_or_else(|| SofbError::NotConnected(handle.name().to_string()))?;
            orbit.push(pos);
        }
        Ok(orbit)
    }

    fn connected(&self) -> bool {
        self.handles(OrbitMode::SlowOrb).iter().all(|h| h.connected())
    }
}

/// Smoothed, referenced orbit of one accelerator
pub struct Orbit {
    source: Arc<dyn OrbitSource>,
    len: usize,
    timeout: Duration,
    mode: OrbitMode,
    reference: Vec<f64>,
    offline: Vec<f64>,
    smooth_pts: usize,
    buffer: VecDeque<Vec<f64>>,
}

impl std::fmt::Debug for Orbit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orbit")
            .field("mode", &self.mode)
            .field("len", &self.len)
            .field("smooth_pts", &self.smooth_pts)
            .finish()
    }
}

impl Orbit {
    pub fn new(source: Arc<dyn OrbitSource>, len: usize, timeout: Duration) -> Self {
        Self {
            source,
            len,
            timeout,
            mode: OrbitMode::SlowOrb,
            reference: vec![0.0; len],
            offline: vec![0.0; len],
            smooth_pts: 1,
            buffer: VecDeque::new(),
        }
    }

    pub fn mode(&self) -> OrbitMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: OrbitMode) {
        if mode != self.mode {
            self.mode = mode;
            self.buffer.clear();
        }
    }

    pub fn reference(&self) -> &[f64] {
        &self.reference
    }

    fn checked(&self, what: &'static str, values: &[f64]) -> Result<Vec<f64>, SofbError> {
        if values.len() != self.len {
            return Err(SofbError::Length {
                what,
                expected: self.len,
                found: values.len(),
            });
        }
        Ok(values.to_vec())
    }

    pub fn set_reference(&mut self, reference: &[f64]) -> Result<(), SofbError> {
        self.reference = self.checked("reference orbit", reference)?;
        Ok(())
    }

    pub fn set_offline(&mut self, offline: &[f64]) -> Result<(), SofbError> {
        self.offline = self.checked("offline orbit", offline)?;
        Ok(())
    }

    /// Half of an orbit vector: the x readings followed by the y readings
    pub fn set_reference_plane(&mut self, y: bool, values: &[f64]) -> Result<(), SofbError> {
        let half = self.len / 2;
        let values = self.checked_half("reference orbit", values)?;
        let start = if y { half } else { 0 };
        self.reference[start..start + half].copy_from_slice(&values);
        Ok(())
    }

    pub fn set_offline_plane(&mut self, y: bool, values: &[f64]) -> Result<(), SofbError> {
        let half = self.len / 2;
        let values = self.checked_half("offline orbit", values)?;
        let start = if y { half } else { 0 };
        self.offline[start..start + half].copy_from_slice(&values);
        Ok(())
    }

    fn checked_half(&self, what: &'static str, values: &[f64]) -> Result<Vec<f64>, SofbError> {
        if values.len() != self.len / 2 {
            return Err(SofbError::Length {
                what,
                expected: self.len / 2,
                found: values.len(),
            });
        }
        Ok(values.to_vec())
    }

    pub fn smooth_points(&self) -> usize {
        self.smooth_pts
    }

    pub fn set_smooth_points(&mut self, points: usize) {
        self.smooth_pts = points.max(1);
        while self.buffer.len() > self.smooth_pts {
            self.buffer.pop_front();
        }
    }

    pub fn reset_smoothing(&mut self) {
        self.buffer.clear();
    }

    pub fn source_connected(&self) -> bool {
        self.mode == OrbitMode::Offline || self.source.connected()
    }

    /// One unsmoothed, unreferenced acquisition
    pub fn acquire(&self) -> Result<Vec<f64>, SofbError> {
        match self.mode {
            OrbitMode::Offline => Ok(self.offline.clone()),
            mode => {
                let raw = self.source.acquire(mode, self.timeout)?;
                self.checked("orbit", &raw)
            }
        }
    }

    /// Acquire once more and return the average over the smoothing window
    pub fn sample(&mut self) -> Result<Vec<f64>, SofbError> {
        let raw = self.acquire()?;
        self.buffer.push_back(raw);
        while self.buffer.len() > self.smooth_pts {
            self.buffer.pop_front();
        }
        let count = self.buffer.len() as f64;
        let mut mean = vec![0.0; self.len];
        for orbit in self.buffer.iter() {
            for (m, x) in mean.iter_mut().zip(orbit.iter()) {
                *m += x / count;
            }
        }
        Ok(mean)
    }

    /// Distance of a smoothed orbit to the reference
    pub fn referenced(&self, orbit: &[f64]) -> Vec<f64> {
        orbit
            .iter()
            .zip(self.reference.iter())
            .map(|(x, r)| x - r)
            .collect()
    }
}

//Unit tests
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: AtomicUsize,
    }

    impl OrbitSource for Counting {
        fn acquire(&self, mode: OrbitMode, _timeout: Duration) -> Result<Vec<f64>, SofbError> {
            assert_ne!(mode, OrbitMode::Offline);
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as f64;
            Ok(vec![n, -n, 2.0 * n, 0.0])
        }

        fn connected(&self) -> bool {
            true
        }
    }

    fn orbit() -> Orbit {
        let source = Arc::new(Counting {
            calls: AtomicUsize::new(0),
        });
        Orbit::new(source, 4, Duration::from_millis(10))
    }

    #[test]
    fn test_smoothing_window() {
        let mut orbit = orbit();
        orbit.set_smooth_points(2);
        assert_eq!(orbit.sample().unwrap(), vec![0.0, 0.0, 0.0, 0.0]);
        assert_eq!(orbit.sample().unwrap(), vec![0.5, -0.5, 1.0, 0.0]);
        // The first acquisition leaves the window
        assert_eq!(orbit.sample().unwrap(), vec![1.5, -1.5, 3.0, 0.0]);
        orbit.reset_smoothing();
        assert_eq!(orbit.sample().unwrap(), vec![3.0, -3.0, 6.0, 0.0]);
    }

    #[test]
    fn test_reference_and_offline() {
        let mut orbit = orbit();
        orbit.set_reference_plane(true, &[1.0, 1.0]).unwrap();
        assert_eq!(orbit.reference(), &[0.0, 0.0, 1.0, 1.0]);
        assert!(orbit.set_reference(&[1.0]).is_err());

        orbit.set_mode(OrbitMode::Offline);
        orbit.set_offline(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        let sample = orbit.sample().unwrap();
        assert_eq!(orbit.referenced(&sample), vec![1.0, 2.0, 2.0, 3.0]);
    }

    #[test]
    fn test_multi_turn_positions_are_averaged() {
        assert_eq!(position(&ChannelValue::FloatArray(vec![1.0, 2.0, 3.0])), Some(2.0));
        assert_eq!(position(&ChannelValue::Float(0.5)), Some(0.5));
        assert_eq!(position(&ChannelValue::FloatArray(Vec::new())), None);
        assert_eq!(OrbitMode::from_index(2), Some(OrbitMode::MultiTurn));
        assert_eq!(OrbitMode::from_index(4), None);
    }
}
