use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::axis::{drive_labels, drive_velocity, DriveSnapshot, PairSnapshot};
use super::EpuConfig;
use crate::devices::ecodrive::{is_clearable_fault, Drive, READY_TO_MOVE};
use crate::devices::gpio::IoBus;
use crate::devices::Axis;
use crate::error::{DriveError, EpuError};

const DIAGNOSTIC_POLL: Duration = Duration::from_millis(50);

fn index(axis: Axis) -> usize {
    match axis {
        Axis::Gap => 0,
        Axis::Phase => 1,
    }
}

fn read_drive(drive: &dyn Drive) -> Result<DriveSnapshot, DriveError> {
    Ok(DriveSnapshot {
        diagnostic: drive.get_diagnostic_code()?,
        encoder: drive.get_encoder_position()?,
        resolver: drive.get_resolver_position()?,
        target_position: drive.get_target_position()?,
        target_velocity: drive.get_target_velocity()?,
        max_velocity: drive.get_max_velocity()?,
        halted: drive.get_halten_status()?,
    })
}

/// Owns the four drives and the I/O of an undulator and performs the pair
/// transitions.
///
/// Sequences that must not interleave with the standstill monitor (clearing
/// errors, enable and release, reading every register) run under the coarse
/// device lock. Long sequences additionally raise the busy flag, which the
/// standstill monitor waits on.
pub struct MotionCoordinator {
    drives: [[Arc<dyn Drive>; 2]; 2],
    io: Arc<dyn IoBus>,
    config: EpuConfig,
    device: Mutex<()>,
    busy: Mutex<bool>,
    idle: Condvar,
    moving: [AtomicBool; 2],
    consistent: [AtomicBool; 2],
    snapshots: Mutex<[PairSnapshot; 2]>,
}

impl std::fmt::Debug for MotionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MotionCoordinator")
            .field("busy", &self.is_busy())
            .field("snapshots", &*self.snapshots.lock())
            .finish()
    }
}

impl MotionCoordinator {
    pub fn new(
        gap: [Arc<dyn Drive>; 2],
        phase: [Arc<dyn Drive>; 2],
        io: Arc<dyn IoBus>,
        config: EpuConfig,
    ) -> Self {
        Self {
            drives: [gap, phase],
            io,
            config,
            device: Mutex::new(()),
            busy: Mutex::new(false),
            idle: Condvar::new(),
            moving: [AtomicBool::new(false), AtomicBool::new(false)],
            consistent: [AtomicBool::new(true), AtomicBool::new(true)],
            snapshots: Mutex::new([
                PairSnapshot::disconnected(Axis::Gap),
                PairSnapshot::disconnected(Axis::Phase),
            ]),
        }
    }

    pub fn config(&self) -> &EpuConfig {
        &self.config
    }

    pub fn limits(&self, axis: Axis) -> [f64; 2] {
        match axis {
            Axis::Gap => self.config.gap_limits,
            Axis::Phase => self.config.phase_limits,
        }
    }

    pub fn drives(&self, axis: Axis) -> &[Arc<dyn Drive>; 2] {
        &self.drives[index(axis)]
    }

    pub fn is_moving(&self, axis: Axis) -> bool {
        self.moving[index(axis)].load(Ordering::SeqCst)
    }

    pub fn set_moving(&self, axis: Axis, moving: bool) {
        self.moving[index(axis)].store(moving, Ordering::SeqCst);
    }

    pub fn is_consistent(&self, axis: Axis) -> bool {
        self.consistent[index(axis)].load(Ordering::SeqCst)
    }

    pub fn is_busy(&self) -> bool {
        *self.busy.lock()
    }

    /// Block while an exclusive sequence runs, at most `timeout`.
    /// Returns `true` if the devices are free.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut busy = self.busy.lock();
        while *busy {
            if self.idle.wait_until(&mut busy, deadline).timed_out() {
                return !*busy;
            }
        }
        true
    }

    /// Run `f` with the busy flag raised
    pub fn exclusive<T>(&self, f: impl FnOnce() -> T) -> T {
        *self.busy.lock() = true;
        let result = f();
        *self.busy.lock() = false;
        self.idle.notify_all();
        result
    }

    /// Last snapshot taken by [`MotionCoordinator::snapshot`]
    pub fn cached(&self, axis: Axis) -> PairSnapshot {
        self.snapshots.lock()[index(axis)].clone()
    }

    /// Read every register of a pair, under the device lock
    pub fn snapshot(&self, axis: Axis) -> PairSnapshot {
        let _device = self.device.lock();
        self.snapshot_locked(axis)
    }

    fn snapshot_locked(&self, axis: Axis) -> PairSnapshot {
        let labels = drive_labels(axis);
        let drives = self.drives(axis);
        let read = |idx: usize| match read_drive(drives[idx].as_ref()) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                spdlog::debug!("Reading drive {} failed: {e}", labels[idx]);
                None
            }
        };
        let snapshot = PairSnapshot {
            axis,
            drives: [read(0), read(1)],
            enabled: self.io.enabled(axis).ok(),
            released: self.io.halt_released(axis).ok(),
            moving: self.is_moving(axis),
            consistent: self.is_consistent(axis),
        };
        self.snapshots.lock()[index(axis)] = snapshot.clone();
        snapshot
    }

    /// Position of the pair's reference drive, read without the device lock
    pub fn position(&self, axis: Axis) -> Result<f64, DriveError> {
        self.drives(axis)[0].get_encoder_position()
    }

    /// Both drives have reached their target within tolerance
    pub fn converged(&self, axis: Axis) -> Result<bool, DriveError> {
        for drive in self.drives(axis) {
            let target = drive.get_target_position()?;
            if (drive.get_encoder_position()? - target).abs() > self.config.tolerance {
                return Ok(false);
            }
        }
        Ok(true)
    }

    // Apply `write` to both drives and compare what `echo` reads back
    fn couple(
        &self,
        axis: Axis,
        what: &str,
        value: f64,
        write: impl Fn(&dyn Drive, f64) -> Result<(), DriveError>,
        echo: impl Fn(&dyn Drive) -> Result<f64, DriveError>,
    ) -> Result<(), EpuError> {
        let _device = self.device.lock();
        let labels = drive_labels(axis);
        let mut problems = Vec::new();
        for (label, drive) in labels.iter().zip(self.drives(axis)) {
            let result = write(drive.as_ref(), value).and_then(|_| echo(drive.as_ref()));
            match result {
                Ok(read) if (read - value).abs() <= self.config.tolerance => (),
                Ok(read) => problems.push(format!("drive {label} echoed {read}")),
                Err(e) => problems.push(format!("drive {label} rejected it ({e})")),
            }
        }
        let consistent = problems.is_empty();
        self.consistent[index(axis)].store(consistent, Ordering::SeqCst);
        if consistent {
            Ok(())
        } else {
            Err(EpuError::Interlock(format!(
                "{axis} {what} {value} inconsistent: {}",
                problems.join(", ")
            )))
        }
    }

    /// Send a target position to both drives of a pair
    pub fn set_target(&self, axis: Axis, position: f64) -> Result<(), EpuError> {
        self.couple(
            axis,
            "target",
            position,
            |drive, v| drive.set_target_position(v),
            |drive| drive.get_target_position(),
        )
    }

    /// Send a speed in mm/s to both drives of a pair. Returns the velocity in
    /// mm/min actually applied.
    pub fn set_speed(&self, axis: Axis, speed: f64, max_speed: f64) -> Result<f64, EpuError> {
        let mut drive_max = f64::INFINITY;
        for drive in self.drives(axis) {
            drive_max = drive_max.min(drive.get_max_velocity()?);
        }
        let velocity = drive_velocity(speed, max_speed, drive_max);
        self.couple(
            axis,
            "velocity",
            velocity,
            |drive, v| drive.set_target_velocity(v),
            |drive| drive.get_target_velocity(),
        )?;
        Ok(velocity)
    }

    fn wait_for_diagnostic(&self, axis: Axis, expected: &str, stop: &AtomicBool) -> Result<(), EpuError> {
        let deadline = Instant::now() + self.config.device_timeout();
        loop {
            let mut ready = true;
            for drive in self.drives(axis) {
                ready &= drive.get_diagnostic_code()? == expected;
            }
            if ready {
                return Ok(());
            }
            if Instant::now() >= deadline || stop.load(Ordering::SeqCst) {
                return Err(EpuError::Timeout(format!("{axis} drives to report {expected}")));
            }
            std::thread::sleep(DIAGNOSTIC_POLL);
        }
    }

    /// Walk a pair from disabled to enabled-released
    pub fn enable_and_release(&self, axis: Axis, stop: &AtomicBool) -> Result<(), EpuError> {
        self.exclusive(|| {
            let snapshot = self.snapshot(axis);
            if snapshot.enabled != Some(true) {
                snapshot.check_enable().map_err(EpuError::Interlock)?;
                {
                    let _device = self.device.lock();
                    self.io.set_enable(axis, true)?;
                }
                self.wait_for_diagnostic(axis, READY_TO_MOVE, stop)?;
            }
            let snapshot = self.snapshot(axis);
            if snapshot.released != Some(true) {
                snapshot.check_release().map_err(EpuError::Interlock)?;
                let _device = self.device.lock();
                self.io.set_halt_release(axis, true)?;
            }
            Ok(())
        })
    }

    /// Drop halt-release, then enable, unconditionally
    pub fn stop(&self, axis: Axis) -> Result<(), EpuError> {
        self.set_moving(axis, false);
        let _device = self.device.lock();
        let released = self.io.set_halt_release(axis, false);
        let enabled = self.io.set_enable(axis, false);
        released?;
        enabled?;
        Ok(())
    }

    /// Re-check the interlocks on fresh readings and pulse start
    pub fn start(&self, axis: Axis) -> Result<(), EpuError> {
        let _device = self.device.lock();
        let snapshot = self.snapshot_locked(axis);
        snapshot
            .check_start(self.limits(axis), self.config.tolerance)
            .map_err(EpuError::Interlock)?;
        self.io.start(axis)?;
        self.set_moving(axis, true);
        Ok(())
    }

    /// Clear the drive errors of a pair and pulse the I/O reset
    pub fn reset(&self, axis: Axis) -> Result<(), EpuError> {
        self.exclusive(|| {
            let _device = self.device.lock();
            let snapshot = self.snapshot_locked(axis);
            snapshot.check_clear().map_err(EpuError::Interlock)?;
            for (drive, state) in self.drives(axis).iter().zip(snapshot.drives.iter()) {
                if state.as_ref().is_some_and(|s| is_clearable_fault(&s.diagnostic)) {
                    drive.clear_error()?;
                }
            }
            self.io.reset(axis)?;
            Ok(())
        })
    }
}

//Unit tests
#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::ecodrive::READY_TO_ENABLE;
    use crate::error::GpioError;

    #[derive(Default)]
    struct FakeDrive {
        state: Mutex<DriveSnapshot>,
        /// Echo targets off by this much
        skew: f64,
        cleared: AtomicBool,
    }

    impl FakeDrive {
        fn with_diagnostic(code: &str) -> Arc<Self> {
            let drive = Self::default();
            drive.state.lock().diagnostic = code.to_string();
            drive.state.lock().max_velocity = 500.0;
            Arc::new(drive)
        }
    }

    impl Drive for FakeDrive {
        fn address(&self) -> u8 {
            1
        }
        fn get_encoder_position(&self) -> Result<f64, DriveError> {
            Ok(self.state.lock().encoder)
        }
        fn get_resolver_position(&self) -> Result<f64, DriveError> {
            Ok(self.state.lock().resolver)
        }
        fn get_target_position(&self) -> Result<f64, DriveError> {
            Ok(self.state.lock().target_position + self.skew)
        }
        fn set_target_position(&self, position: f64) -> Result<(), DriveError> {
            self.state.lock().target_position = position;
            Ok(())
        }
        fn get_max_velocity(&self) -> Result<f64, DriveError> {
            Ok(self.state.lock().max_velocity)
        }
        fn get_target_velocity(&self) -> Result<f64, DriveError> {
            Ok(self.state.lock().target_velocity)
        }
        fn set_target_velocity(&self, velocity: f64) -> Result<(), DriveError> {
            self.state.lock().target_velocity = velocity;
            Ok(())
        }
        fn get_diagnostic_code(&self) -> Result<String, DriveError> {
            Ok(self.state.lock().diagnostic.clone())
        }
        fn get_halten_status(&self) -> Result<bool, DriveError> {
            Ok(self.state.lock().halted)
        }
        fn clear_error(&self) -> Result<(), DriveError> {
            self.cleared.store(true, Ordering::SeqCst);
            self.state.lock().diagnostic = READY_TO_ENABLE.to_string();
            Ok(())
        }
    }

    /// Enabling a pair moves its drives to ready-to-move
    #[derive(Default)]
    struct FakeIo {
        bits: Mutex<[bool; 4]>,
        starts: Mutex<Vec<Axis>>,
        drives: Mutex<Vec<Arc<FakeDrive>>>,
    }

    impl IoBus for FakeIo {
        fn set_enable(&self, axis: Axis, on: bool) -> Result<(), GpioError> {
            self.bits.lock()[index(axis) * 2] = on;
            if on {
                for drive in self.drives.lock().iter() {
                    drive.state.lock().diagnostic = READY_TO_MOVE.to_string();
                }
            }
            Ok(())
        }
        fn enabled(&self, axis: Axis) -> Result<bool, GpioError> {
            Ok(self.bits.lock()[index(axis) * 2])
        }
        fn set_halt_release(&self, axis: Axis, on: bool) -> Result<(), GpioError> {
            self.bits.lock()[index(axis) * 2 + 1] = on;
            Ok(())
        }
        fn halt_released(&self, axis: Axis) -> Result<bool, GpioError> {
            Ok(self.bits.lock()[index(axis) * 2 + 1])
        }
        fn start(&self, axis: Axis) -> Result<(), GpioError> {
            self.starts.lock().push(axis);
            Ok(())
        }
        fn reset(&self, _axis: Axis) -> Result<(), GpioError> {
            Ok(())
        }
    }

    fn coordinator(code: &str, skew: f64) -> (MotionCoordinator, Vec<Arc<FakeDrive>>, Arc<FakeIo>) {
        let mut fakes: Vec<Arc<FakeDrive>> = (0..4).map(|_| FakeDrive::with_diagnostic(code)).collect();
        if skew != 0.0 {
            let mut skewed = FakeDrive {
                skew,
                ..Default::default()
            };
            skewed.state.get_mut().diagnostic = code.to_string();
            fakes[1] = Arc::new(skewed);
        }
        let io = Arc::new(FakeIo::default());
        *io.drives.lock() = fakes.clone();
        let as_drive = |idx: usize| -> Arc<dyn Drive> { fakes[idx].clone() };
        let coordinator = MotionCoordinator::new(
            [as_drive(0), as_drive(1)],
            [as_drive(2), as_drive(3)],
            io.clone(),
            EpuConfig::default(),
        );
        (coordinator, fakes, io)
    }

    #[test]
    fn test_enable_release_and_start() {
        let (coordinator, fakes, io) = coordinator(READY_TO_ENABLE, 0.0);
        let stop = AtomicBool::new(false);
        coordinator.enable_and_release(Axis::Gap, &stop).unwrap();
        assert_eq!(*io.bits.lock(), [true, true, false, false]);
        assert!(!coordinator.is_busy());

        coordinator.set_target(Axis::Gap, 42.0).unwrap();
        assert_eq!(fakes[0].state.lock().target_position, 42.0);
        assert_eq!(fakes[1].state.lock().target_position, 42.0);
        assert_eq!(coordinator.set_speed(Axis::Gap, 5.0, 10.0).unwrap(), 300.0);

        coordinator.start(Axis::Gap).unwrap();
        assert!(coordinator.is_moving(Axis::Gap));
        assert_eq!(*io.starts.lock(), vec![Axis::Gap]);

        coordinator.stop(Axis::Gap).unwrap();
        assert!(!coordinator.is_moving(Axis::Gap));
        assert_eq!(*io.bits.lock(), [false, false, false, false]);
    }

    #[test]
    fn test_start_refused_when_disabled() {
        let (coordinator, _, io) = coordinator(READY_TO_MOVE, 0.0);
        match coordinator.start(Axis::Phase) {
            Err(EpuError::Interlock(reason)) => assert!(reason.contains("not enabled")),
            other => panic!("unexpected {other:?}"),
        }
        assert!(io.starts.lock().is_empty());
    }

    #[test]
    fn test_inconsistent_echo_forbids_motion() {
        let (coordinator, _, io) = coordinator(READY_TO_ENABLE, 0.5);
        let stop = AtomicBool::new(false);
        coordinator.enable_and_release(Axis::Gap, &stop).unwrap();
        assert!(coordinator.set_target(Axis::Gap, 42.0).is_err());
        assert!(!coordinator.is_consistent(Axis::Gap));
        assert!(coordinator.start(Axis::Gap).is_err());
        assert!(io.starts.lock().is_empty());
    }

    #[test]
    fn test_reset_clears_faults() {
        let (coordinator, fakes, _) = coordinator("F2026", 0.0);
        assert!(coordinator.snapshot(Axis::Gap).is_faulted());
        coordinator.reset(Axis::Gap).unwrap();
        assert!(fakes[0].cleared.load(Ordering::SeqCst));
        assert!(!coordinator.snapshot(Axis::Gap).is_faulted());
    }
}
