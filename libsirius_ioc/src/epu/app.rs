use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::axis::{clamp_max_speed, drive_labels, PairSnapshot, PairState};
use super::coordinator::MotionCoordinator;
use super::{EpuConfig, EpuDevice};
use crate::channel::{ChannelDescriptor, ChannelValue, Condition, Severity};
use crate::database::Database;
use crate::devices::ecodrive::{Drive, EcoDrive, EcoDriveLine};
use crate::devices::gpio::{GpioBus, IoBus};
use crate::devices::Axis;
use crate::driver::Application;
use crate::error::EpuError;
use crate::ioc::AppContext;
use crate::logging::{guarded, LogChannel, LOG_CHANNEL};
use crate::queue::WorkQueue;
use crate::status::StatusWord;

const NO_YES: [&str; 2] = ["No", "Yes"];
const DSBL_ENBL: [&str; 2] = ["Dsbl", "Enbl"];

const STATUS_LABELS: [&str; 13] = [
    "DriveA",
    "DriveB",
    "DriveI",
    "DriveS",
    "GPIO",
    "GapFault",
    "PhaseFault",
    "GapNotReleased",
    "PhaseNotReleased",
    "GapInconsistent",
    "PhaseInconsistent",
    "GapInterlock",
    "PhaseInterlock",
];
const BIT_GPIO: usize = 4;

fn axis_bit(axis: Axis, gap_bit: usize) -> usize {
    match axis {
        Axis::Gap => gap_bit,
        Axis::Phase => gap_bit + 1,
    }
}

fn drive_bit(axis: Axis, idx: usize) -> usize {
    match axis {
        Axis::Gap => idx,
        Axis::Phase => 2 + idx,
    }
}

/// Channels of one EPU, without the IOC prefix
pub fn database(config: &EpuConfig) -> Vec<ChannelDescriptor> {
    let mut db = Vec::new();
    for axis in Axis::ALL {
        let limits = match axis {
            Axis::Gap => config.gap_limits,
            Axis::Phase => config.phase_limits,
        };
        let start = limits[0].max(0.0).min(limits[1]);
        for suffix in ["SP", "RB"] {
            db.push(
                ChannelDescriptor::float(&format!("{axis}-{suffix}"), start)
                    .unit("mm")
                    .prec(3)
                    .limits(limits[0], limits[1]),
            );
            db.push(
                ChannelDescriptor::float(&format!("{axis}Speed-{suffix}"), 1.0)
                    .unit("mm/s")
                    .prec(3)
                    .limits(0.0, config.speed_ceiling),
            );
            db.push(
                ChannelDescriptor::float(&format!("Max{axis}Speed-{suffix}"), config.speed_ceiling)
                    .unit("mm/s")
                    .prec(3)
                    .limits(0.0, 1000.0),
            );
        }
        db.push(ChannelDescriptor::float(&format!("{axis}-Mon"), start).unit("mm").prec(3));
        db.push(ChannelDescriptor::int(&format!("Change{axis}-Cmd"), 0));
        db.push(ChannelDescriptor::int(&format!("Stop{axis}-Cmd"), 0));
        for suffix in ["Sel", "Sts"] {
            db.push(ChannelDescriptor::enumeration(
                &format!("EnblAndRelease{axis}-{suffix}"),
                &DSBL_ENBL,
                0,
            ));
        }
        db.push(ChannelDescriptor::enumeration(
            &format!("{axis}State-Mon"),
            &PairState::LABELS,
            0,
        ));
        db.push(ChannelDescriptor::enumeration(&format!("{axis}Consistent-Mon"), &NO_YES, 1));
        for label in drive_labels(axis) {
            db.push(ChannelDescriptor::string(&format!("Drv{label}Diag-Mon"), ""));
            db.push(ChannelDescriptor::float(&format!("Drv{label}Encoder-Mon"), 0.0).unit("mm").prec(4));
            db.push(ChannelDescriptor::float(&format!("Drv{label}Resolver-Mon"), 0.0).unit("mm").prec(4));
        }
    }
    db.push(ChannelDescriptor::int("Stop-Cmd", 0));
    db.push(ChannelDescriptor::int("Reset-Cmd", 0));
    db.push(ChannelDescriptor::enumeration("Moving-Mon", &NO_YES, 0));
    db.push(ChannelDescriptor::enumeration("IsBusy-Mon", &NO_YES, 0));
    let status = StatusWord::new(&STATUS_LABELS);
    db.push(ChannelDescriptor::int("Status-Mon", status.value()));
    db.push(ChannelDescriptor::string_array("StatusLabels-Cte", status.labels()));
    db.push(ChannelDescriptor::string(LOG_CHANNEL, ""));
    db
}

struct Shared {
    db: Arc<Database>,
    log: LogChannel,
    queue: Arc<WorkQueue>,
    coordinator: MotionCoordinator,
    status: Mutex<StatusWord>,
    responsive: Mutex<[bool; 4]>,
    move_started: Mutex<[Option<Instant>; 2]>,
    stop: AtomicBool,
    wake_lock: Mutex<()>,
    wake: Condvar,
}

fn axis_index(axis: Axis) -> usize {
    match axis {
        Axis::Gap => 0,
        Axis::Phase => 1,
    }
}

impl Shared {
    fn set(&self, name: &str, value: ChannelValue) {
        if let Err(e) = self.db.set_value(name, value) {
            spdlog::error!("Could not update {name}: {e}");
        }
    }

    fn set_flag(&self, name: &str, on: bool) {
        self.set(name, ChannelValue::Enum(on as u16));
    }

    fn update_status(&self, f: impl FnOnce(&mut StatusWord)) {
        let value = {
            let mut status = self.status.lock();
            f(&mut status);
            status.channel_value()
        };
        self.set("Status-Mon", value);
    }

    /// Sleep up to `timeout`; returns early when woken. `false` once stopped.
    fn pause(&self, timeout: Duration) -> bool {
        let mut guard = self.wake_lock.lock();
        if self.stop.load(Ordering::SeqCst) {
            return false;
        }
        self.wake.wait_for(&mut guard, timeout);
        !self.stop.load(Ordering::SeqCst)
    }

    fn wake_monitors(&self) {
        let _guard = self.wake_lock.lock();
        self.wake.notify_all();
    }

    fn publish_moving(&self) {
        let any = Axis::ALL.iter().any(|a| self.coordinator.is_moving(*a));
        self.set_flag("Moving-Mon", any);
    }

    fn publish_snapshot(&self, snapshot: &PairSnapshot) {
        let axis = snapshot.axis;
        let labels = drive_labels(axis);
        for (idx, drive) in snapshot.drives.iter().enumerate() {
            let label = labels[idx];
            let names = [
                format!("Drv{label}Diag-Mon"),
                format!("Drv{label}Encoder-Mon"),
                format!("Drv{label}Resolver-Mon"),
            ];
            let bit = drive_bit(axis, idx);
            let was_responsive = std::mem::replace(&mut self.responsive.lock()[bit], drive.is_some());
            match drive {
                Some(drive) => {
                    self.set(&names[0], ChannelValue::Str(drive.diagnostic.clone()));
                    self.set(&names[1], ChannelValue::Float(drive.encoder));
                    self.set(&names[2], ChannelValue::Float(drive.resolver));
                    if !was_responsive {
                        self.log.info(&format!("Drive {label} responding"));
                    }
                }
                None => {
                    for name in names.iter() {
                        if let Err(e) = self.db.set_alarm(name, Severity::Invalid, Condition::Comm) {
                            spdlog::error!("Could not raise alarm on {name}: {e}");
                        }
                    }
                    if was_responsive {
                        self.log.error(&format!("Drive {label} not responding"));
                    }
                }
            }
        }
        if !self.coordinator.is_moving(axis) {
            if let Some(position) = snapshot.position() {
                self.set(&format!("{axis}-Mon"), ChannelValue::Float(position));
            }
        }
        let state = snapshot.state(self.coordinator.config().tolerance);
        self.set(&format!("{axis}State-Mon"), ChannelValue::Enum(state.index()));
        let released = snapshot.enabled == Some(true) && snapshot.released == Some(true);
        self.set_flag(&format!("EnblAndRelease{axis}-Sts"), released);
        self.set_flag(&format!("{axis}Consistent-Mon"), snapshot.consistent);
        self.update_status(|status| {
            for idx in 0..2 {
                status.set(drive_bit(axis, idx), snapshot.drives[idx].is_none());
            }
            status.set(BIT_GPIO, snapshot.enabled.is_none() || snapshot.released.is_none());
            status.set(axis_bit(axis, 5), snapshot.is_faulted());
            status.set(axis_bit(axis, 7), !released);
            status.set(axis_bit(axis, 9), !snapshot.consistent);
        });
    }

    fn speed_setting(&self, axis: Axis) -> (f64, f64) {
        let read = |name: String, default: f64| {
            self.db
                .value(&name)
                .ok()
                .and_then(|v| v.as_f64())
                .unwrap_or(default)
        };
        let ceiling = self.coordinator.config().speed_ceiling;
        (
            read(format!("{axis}Speed-RB"), 0.0),
            read(format!("Max{axis}Speed-RB"), ceiling),
        )
    }

    fn apply_speed(self: &Arc<Self>, axis: Axis) {
        let shared = self.clone();
        self.queue.submit(&format!("Set {axis} speed"), move |cancelled| {
            if cancelled {
                return;
            }
            let (speed, max_speed) = shared.speed_setting(axis);
            match shared.coordinator.set_speed(axis, speed, max_speed) {
                Ok(velocity) => spdlog::info!("{axis} velocity set to {velocity} mm/min"),
                Err(e) => shared.log.error(&e.to_string()),
            }
            let consistent = shared.coordinator.is_consistent(axis);
            shared.set_flag(&format!("{axis}Consistent-Mon"), consistent);
            shared.update_status(|status| status.set(axis_bit(axis, 9), !consistent));
        });
    }

    fn apply_target(self: &Arc<Self>, axis: Axis, target: f64) {
        let shared = self.clone();
        self.queue.submit(&format!("Set {axis} target"), move |cancelled| {
            if cancelled {
                return;
            }
            match shared.coordinator.set_target(axis, target) {
                Ok(()) => spdlog::info!("{axis} target set to {target}"),
                Err(e) => shared.log.error(&e.to_string()),
            }
            let consistent = shared.coordinator.is_consistent(axis);
            shared.set_flag(&format!("{axis}Consistent-Mon"), consistent);
            shared.update_status(|status| status.set(axis_bit(axis, 9), !consistent));
        });
    }

    fn refuse_start(&self, axis: Axis, reason: &str) {
        self.log.warn(reason);
        self.update_status(|status| status.set(axis_bit(axis, 11), true));
    }

    /// Interlocks are checked on the cached snapshot here and again on fresh
    /// readings when the start leaves the queue.
    fn request_start(self: &Arc<Self>, axis: Axis) -> bool {
        if self.coordinator.is_moving(axis) {
            self.refuse_start(axis, &format!("{axis} start refused: movement in progress"));
            return false;
        }
        let snapshot = self.coordinator.cached(axis);
        let limits = self.coordinator.limits(axis);
        if let Err(reason) = snapshot.check_start(limits, self.coordinator.config().tolerance) {
            self.refuse_start(axis, &reason);
            return false;
        }
        let shared = self.clone();
        self.queue.submit(&format!("Start {axis}"), move |cancelled| {
            if cancelled {
                return;
            }
            match shared.coordinator.start(axis) {
                Ok(()) => {
                    shared.move_started.lock()[axis_index(axis)] = Some(Instant::now());
                    shared.publish_moving();
                    shared.update_status(|status| status.set(axis_bit(axis, 11), false));
                    shared.log.info(&format!("{axis} movement started"));
                    shared.wake_monitors();
                }
                Err(EpuError::Interlock(reason)) => shared.refuse_start(axis, &reason),
                Err(e) => shared.log.error(&format!("{axis} start failed: {e}")),
            }
        });
        true
    }

    fn stop_axes(&self, axes: &[Axis]) {
        for axis in axes {
            match self.coordinator.stop(*axis) {
                Ok(()) => self.log.info(&format!("{axis} stopped")),
                Err(e) => self.log.error(&format!("{axis} stop failed: {e}")),
            }
            self.move_started.lock()[axis_index(*axis)] = None;
            self.set_flag(&format!("EnblAndRelease{axis}-Sts"), false);
            if let Err(e) = self.db.set_value(&format!("EnblAndRelease{axis}-Sel"), ChannelValue::Enum(0)) {
                spdlog::error!("Could not reset the {axis} selector: {e}");
            }
        }
        self.publish_moving();
    }

    fn enable_and_release(self: &Arc<Self>, axis: Axis) {
        let shared = self.clone();
        self.queue.submit(&format!("Enable and release {axis}"), move |cancelled| {
            if cancelled {
                return;
            }
            shared.set_flag("IsBusy-Mon", true);
            match shared.coordinator.enable_and_release(axis, &shared.stop) {
                Ok(()) => shared.log.info(&format!("{axis} enabled and released")),
                Err(e) => shared.log.error(&e.to_string()),
            }
            shared.set_flag("IsBusy-Mon", false);
            let snapshot = shared.coordinator.snapshot(axis);
            shared.publish_snapshot(&snapshot);
        });
    }

    fn reset(self: &Arc<Self>) {
        let shared = self.clone();
        self.queue.submit("Reset drives", move |cancelled| {
            if cancelled {
                return;
            }
            shared.set_flag("IsBusy-Mon", true);
            for axis in Axis::ALL {
                match shared.coordinator.reset(axis) {
                    Ok(()) => shared.log.info(&format!("{axis} drives reset")),
                    Err(e) => shared.log.error(&e.to_string()),
                }
                let snapshot = shared.coordinator.snapshot(axis);
                shared.publish_snapshot(&snapshot);
            }
            shared.set_flag("IsBusy-Mon", false);
        });
    }

    /// Poll the encoders of moving pairs until they converge
    fn movement_loop(&self) {
        let config = self.coordinator.config().clone();
        loop {
            let moving: Vec<Axis> = Axis::ALL
                .into_iter()
                .filter(|a| self.coordinator.is_moving(*a))
                .collect();
            let period = if moving.is_empty() {
                config.standstill_period()
            } else {
                config.moving_period()
            };
            for axis in moving {
                guarded(&self.log, "Movement monitor", || self.follow(axis, &config));
            }
            if !self.pause(period) {
                break;
            }
        }
    }

    fn follow(&self, axis: Axis, config: &EpuConfig) {
        match self.coordinator.position(axis) {
            Ok(position) => self.set(&format!("{axis}-Mon"), ChannelValue::Float(position)),
            Err(e) => {
                spdlog::warn!("{axis} position read failed: {e}");
                if let Err(e) = self.db.set_alarm(&format!("{axis}-Mon"), Severity::Invalid, Condition::Comm) {
                    spdlog::error!("{e}");
                }
                return;
            }
        }
        let started = self.move_started.lock()[axis_index(axis)];
        let finished = match self.coordinator.converged(axis) {
            Ok(true) => {
                self.log.info(&format!("{axis} movement finished"));
                true
            }
            Ok(false) if started.is_some_and(|t| t.elapsed() > config.move_timeout()) => {
                self.log.error(&format!("{axis} movement timed out"));
                true
            }
            Ok(false) => false,
            Err(e) => {
                spdlog::warn!("{axis} convergence check failed: {e}");
                false
            }
        };
        if finished {
            self.coordinator.set_moving(axis, false);
            self.move_started.lock()[axis_index(axis)] = None;
            self.publish_moving();
        }
    }

    /// Refresh every register of idle pairs at the standstill period
    fn standstill_loop(&self) {
        let period = self.coordinator.config().standstill_period();
        loop {
            if self.coordinator.wait_idle(period) {
                self.set_flag("IsBusy-Mon", false);
                for axis in Axis::ALL {
                    if self.coordinator.is_moving(axis) {
                        continue;
                    }
                    guarded(&self.log, "Standstill monitor", || {
                        let snapshot = self.coordinator.snapshot(axis);
                        self.publish_snapshot(&snapshot);
                    });
                }
            } else {
                self.set_flag("IsBusy-Mon", true);
            }
            if !self.pause(period) {
                break;
            }
        }
    }
}

/// The EPU application: maps channel writes onto the motion coordinator and
/// runs the standstill and movement monitors.
pub struct EpuApp {
    shared: Arc<Shared>,
    monitors: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for EpuApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpuApp")
            .field("coordinator", &self.shared.coordinator)
            .finish()
    }
}

impl EpuApp {
    pub fn new(
        context: &AppContext,
        config: EpuConfig,
        gap: [Arc<dyn Drive>; 2],
        phase: [Arc<dyn Drive>; 2],
        io: Arc<dyn IoBus>,
    ) -> Result<Self, EpuError> {
        let shared = Arc::new(Shared {
            db: context.db.clone(),
            log: context.log.clone(),
            queue: context.queue.clone(),
            coordinator: MotionCoordinator::new(gap, phase, io, config),
            status: Mutex::new(StatusWord::new(&STATUS_LABELS)),
            responsive: Mutex::new([true; 4]),
            move_started: Mutex::new([None, None]),
            stop: AtomicBool::new(false),
            wake_lock: Mutex::new(()),
            wake: Condvar::new(),
        });

        // Start from what the drives hold
        for axis in Axis::ALL {
            let snapshot = shared.coordinator.snapshot(axis);
            shared.publish_snapshot(&snapshot);
            if let Some(drive) = &snapshot.drives[0] {
                for suffix in ["SP", "RB"] {
                    shared.set(&format!("{axis}-{suffix}"), ChannelValue::Float(drive.target_position));
                }
            }
        }

        let mut monitors = Vec::new();
        let standstill = shared.clone();
        monitors.push(
            std::thread::Builder::new()
                .name(String::from("epu-standstill"))
                .spawn(move || standstill.standstill_loop())?,
        );
        let movement = shared.clone();
        monitors.push(
            std::thread::Builder::new()
                .name(String::from("epu-movement"))
                .spawn(move || movement.movement_loop())?,
        );
        Ok(Self {
            shared,
            monitors: Mutex::new(monitors),
        })
    }

    /// Open the drive line and the I/O of `device`
    pub fn connect(
        context: &AppContext,
        config: EpuConfig,
        device: &EpuDevice,
    ) -> Result<Self, EpuError> {
        let timeout = config.device_timeout();
        let line = Arc::new(EcoDriveLine::connect(&device.drive_line, timeout)?);
        let drive = |idx: usize| -> Arc<dyn Drive> {
            Arc::new(EcoDrive::new(line.clone(), device.drive_addresses[idx]))
        };
        let io = Arc::new(GpioBus::connect(&device.gpio_address, timeout)?);
        spdlog::info!(
            "{}: drives on {}, GPIO on {}",
            device.name,
            device.drive_line,
            device.gpio_address
        );
        Self::new(context, config, [drive(0), drive(1)], [drive(2), drive(3)], io)
    }

    pub fn coordinator(&self) -> &MotionCoordinator {
        &self.shared.coordinator
    }
}

fn axis_of(name: &str) -> Option<Axis> {
    if name.contains("Gap") {
        Some(Axis::Gap)
    } else if name.contains("Phase") {
        Some(Axis::Phase)
    } else {
        None
    }
}

impl Application for EpuApp {
    fn write(&self, name: &str, value: &ChannelValue) -> bool {
        let shared = &self.shared;
        match (name, axis_of(name)) {
            ("Gap-SP" | "Phase-SP", Some(axis)) => {
                if let Some(target) = value.as_f64() {
                    shared.apply_target(axis, target);
                }
                true
            }
            ("GapSpeed-SP" | "PhaseSpeed-SP", Some(_)) => true,
            ("MaxGapSpeed-SP" | "MaxPhaseSpeed-SP", Some(_)) => true,
            ("ChangeGap-Cmd" | "ChangePhase-Cmd", Some(axis)) => shared.request_start(axis),
            ("EnblAndReleaseGap-Sel" | "EnblAndReleasePhase-Sel", Some(axis)) => {
                if value.as_bool() == Some(true) {
                    shared.enable_and_release(axis);
                }
                true
            }
            ("Reset-Cmd", _) => {
                shared.reset();
                true
            }
            _ => true,
        }
    }

    fn after_write(&self, name: &str, value: &ChannelValue) {
        let shared = &self.shared;
        match (name, axis_of(name)) {
            ("GapSpeed-SP" | "PhaseSpeed-SP", Some(axis)) => shared.apply_speed(axis),
            ("MaxGapSpeed-SP" | "MaxPhaseSpeed-SP", Some(axis)) => {
                let ceiling = shared.coordinator.config().speed_ceiling;
                let requested = value.as_f64().unwrap_or(ceiling);
                let clamped = clamp_max_speed(requested, ceiling);
                if clamped != requested {
                    shared.log.warn(&format!("Max{axis}Speed limited to {clamped} mm/s"));
                    shared.set(&format!("Max{axis}Speed-RB"), ChannelValue::Float(clamped));
                }
                shared.apply_speed(axis);
            }
            ("EnblAndReleaseGap-Sel" | "EnblAndReleasePhase-Sel", Some(axis)) => {
                if value.as_bool() == Some(false) {
                    shared.stop_axes(&[axis]);
                }
            }
            ("StopGap-Cmd" | "StopPhase-Cmd", Some(axis)) => shared.stop_axes(&[axis]),
            ("Stop-Cmd", _) => shared.stop_axes(&Axis::ALL),
            _ => (),
        }
    }

    fn shutdown(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.wake_monitors();
        for handle in self.monitors.lock().drain(..) {
            if handle.join().is_err() {
                spdlog::error!("An EPU monitor thread panicked");
            }
        }
    }
}

//Unit tests
#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

    #[test]
    fn test_database_description() {
        let config = EpuConfig::default();
        let db = Database::create(database(&config)).unwrap();
        for name in [
            "Gap-SP",
            "Gap-RB",
            "PhaseSpeed-SP",
            "MaxGapSpeed-RB",
            "ChangeGap-Cmd",
            "EnblAndReleasePhase-Sts",
            "DrvSDiag-Mon",
            "Moving-Mon",
            "Status-Mon",
            "Stop-Cmd",
        ] {
            assert!(db.contains(name), "{name}");
        }
        let gap = db.descriptor("Gap-SP").unwrap();
        assert_eq!((gap.lolim, gap.hilim), (Some(22.0), Some(300.0)));
        assert_eq!(
            db.value("StatusLabels-Cte").unwrap().len(),
            STATUS_LABELS.len()
        );
    }

    #[test]
    fn test_axis_of() {
        assert_eq!(axis_of("MaxGapSpeed-SP"), Some(Axis::Gap));
        assert_eq!(axis_of("StopPhase-Cmd"), Some(Axis::Phase));
        assert_eq!(axis_of("Reset-Cmd"), None);
    }
}
