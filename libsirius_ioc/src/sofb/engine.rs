//! The correction engine: one correction step, the closed-loop worker and the
//! response-matrix measurement sweep.
use ndarray::Array1;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::correctors::CorrectorSet;
use super::kicks::{process_kicks, PlaneLimits};
use super::matrix::ResponseMatrix;
use super::orbit::Orbit;
use super::{Geometry, Plane, SofbConfig};
use crate::channel::ChannelValue;
use crate::config::seconds;
use crate::database::Database;
use crate::error::SofbError;
use crate::logging::{guarded, LogChannel};

/// Settings operators change through channels
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Indexed by [`Plane::index`]
    pub limits: [PlaneLimits; 3],
    pub meas_delta: [f64; 3],
    pub meas_wait: f64,
    pub loop_frequency: f64,
    pub wait_readbacks: bool,
    pub readback_timeout: f64,
    /// Fire the timing trigger after every apply
    pub sync: bool,
}

impl Settings {
    pub fn from_config(config: &SofbConfig) -> Self {
        let limits = |idx: usize| PlaneLimits {
            max_kick: config.max_kick[idx],
            max_delta_kick: config.max_delta_kick[idx],
            corr_factor: config.corr_factor[idx],
            tolerance: config.kick_tolerance[idx],
        };
        Self {
            limits: [limits(0), limits(1), limits(2)],
            meas_delta: config.meas_delta,
            meas_wait: config.meas_wait,
            loop_frequency: config.loop_frequency,
            wait_readbacks: config.wait_readbacks,
            readback_timeout: config.readback_timeout,
            sync: config.trigger.is_some(),
        }
    }

    pub fn loop_period(&self) -> Duration {
        if self.loop_frequency > 0.0 {
            seconds(1.0 / self.loop_frequency)
        } else {
            Duration::from_secs(1)
        }
    }
}

/// State of the response-matrix measurement, as shown on `MeasRespMat-Mon`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasState {
    Idle,
    Measuring,
    Completed,
    Aborted,
}

impl MeasState {
    pub const LABELS: [&'static str; 4] = ["Idle", "Measuring", "Completed", "Aborted"];

    pub fn index(&self) -> u16 {
        match self {
            Self::Idle => 0,
            Self::Measuring => 1,
            Self::Completed => 2,
            Self::Aborted => 3,
        }
    }
}

#[derive(Default)]
struct Workers {
    closed_loop: Option<JoinHandle<()>>,
    measurement: Option<JoinHandle<()>>,
}

pub struct Engine {
    db: Arc<Database>,
    log: LogChannel,
    geometry: Geometry,
    orbit: Mutex<Orbit>,
    matrix: Mutex<ResponseMatrix>,
    correctors: Arc<dyn CorrectorSet>,
    settings: Mutex<Settings>,
    last_delta: Mutex<Option<Vec<f64>>>,
    loop_running: AtomicBool,
    loop_stop: AtomicBool,
    measuring: AtomicBool,
    meas_stop: AtomicBool,
    shutdown: AtomicBool,
    wake_lock: Mutex<()>,
    wake: Condvar,
    workers: Mutex<Workers>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("geometry", &self.geometry)
            .field("loop_running", &self.loop_running)
            .field("measuring", &self.measuring)
            .finish()
    }
}

impl Engine {
    pub fn new(
        db: Arc<Database>,
        log: LogChannel,
        geometry: Geometry,
        orbit: Orbit,
        matrix: ResponseMatrix,
        correctors: Arc<dyn CorrectorSet>,
        settings: Settings,
    ) -> Self {
        Self {
            db,
            log,
            geometry,
            orbit: Mutex::new(orbit),
            matrix: Mutex::new(matrix),
            correctors,
            settings: Mutex::new(settings),
            last_delta: Mutex::new(None),
            loop_running: AtomicBool::new(false),
            loop_stop: AtomicBool::new(false),
            measuring: AtomicBool::new(false),
            meas_stop: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            wake_lock: Mutex::new(()),
            wake: Condvar::new(),
            workers: Mutex::new(Workers::default()),
        }
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn correctors(&self) -> &Arc<dyn CorrectorSet> {
        &self.correctors
    }

    pub fn is_loop_running(&self) -> bool {
        self.loop_running.load(Ordering::SeqCst)
    }

    pub fn is_measuring(&self) -> bool {
        self.measuring.load(Ordering::SeqCst)
    }

    pub fn settings(&self) -> Settings {
        self.settings.lock().clone()
    }

    pub fn update_settings(&self, f: impl FnOnce(&mut Settings)) {
        f(&mut self.settings.lock());
    }

    pub fn with_orbit<T>(&self, f: impl FnOnce(&mut Orbit) -> T) -> T {
        f(&mut self.orbit.lock())
    }

    /// Change the matrix or its inversion parameters, then republish it
    pub fn with_matrix<T>(
        &self,
        f: impl FnOnce(&mut ResponseMatrix) -> Result<T, SofbError>,
    ) -> Result<T, SofbError> {
        let result = {
            let mut matrix = self.matrix.lock();
            f(&mut matrix)
        };
        self.publish_matrix();
        result
    }

    pub fn matrix(&self) -> ResponseMatrix {
        self.matrix.lock().clone()
    }

    pub fn nr_sing_values(&self) -> usize {
        self.matrix.lock().nr_sing_values()
    }

    fn publish(&self, name: &str, value: ChannelValue) {
        if let Err(e) = self.db.set_value(name, value) {
            spdlog::error!("Could not update {name}: {e}");
        }
    }

    pub fn publish_matrix(&self) {
        let (flat, inverse, sing) = {
            let matrix = self.matrix.lock();
            (matrix.flat(), matrix.inverse_flat(), matrix.sing_values().to_vec())
        };
        self.publish("RespMat-RB", ChannelValue::FloatArray(flat));
        self.publish("InvRespMat-Mon", ChannelValue::FloatArray(inverse));
        self.publish("SingValues-Mon", ChannelValue::FloatArray(sing));
    }

    fn publish_orbit(&self, orbit: &[f64]) {
        let half = orbit.len() / 2;
        self.publish("OrbX-Mon", ChannelValue::FloatArray(orbit[..half].to_vec()));
        self.publish("OrbY-Mon", ChannelValue::FloatArray(orbit[half..].to_vec()));
    }

    /// Publish a corrector vector on `{what}CH-Mon`, `{what}CV-Mon`, `{what}RF-Mon`
    pub fn publish_planes(&self, what: &str, values: &[f64]) {
        for plane in Plane::ALL {
            let range = self.geometry.range(plane);
            if range.is_empty() || range.end > values.len() {
                continue;
            }
            let value = match plane {
                Plane::RF => ChannelValue::Float(values[range.start]),
                _ => ChannelValue::FloatArray(values[range].to_vec()),
            };
            self.publish(&format!("{what}{}-Mon", plane.family()), value);
        }
    }

    fn publish_meas_state(&self, state: MeasState) {
        self.publish("MeasRespMat-Mon", ChannelValue::Enum(state.index()));
    }

    /// Sample the orbit and publish it, outside of the closed loop
    pub fn refresh_orbit(&self) -> Result<(), SofbError> {
        let orbit = self.orbit.lock().sample()?;
        self.publish_orbit(&orbit);
        Ok(())
    }

    pub fn refresh_kicks(&self) -> Result<(), SofbError> {
        let kicks = self.correctors.kicks()?;
        self.publish_planes("Kick", &kicks);
        Ok(())
    }

    pub fn orbit_connected(&self) -> bool {
        self.orbit.lock().source_connected()
    }

    /// Δkicks that cancel the distance of the smoothed orbit to the reference
    pub fn calc_delta(&self) -> Result<Vec<f64>, SofbError> {
        let (orbit, referenced) = {
            let mut orbit = self.orbit.lock();
            let sample = orbit.sample()?;
            let referenced = orbit.referenced(&sample);
            (sample, referenced)
        };
        self.publish_orbit(&orbit);
        let delta = self.matrix.lock().solve(&referenced)?;
        self.publish_planes("DeltaKick", &delta);
        *self.last_delta.lock() = Some(delta.clone());
        Ok(delta)
    }

    /// Clamp `delta` plane by plane and send the result to the correctors.
    /// Nothing is sent unless every plane is inside its envelope.
    pub fn apply_delta(&self, delta: &[f64]) -> Result<(), SofbError> {
        let settings = self.settings();
        let kicks = self.correctors.kicks()?;
        let expected = self.geometry.nr_correctors();
        for (what, found) in [("kick", kicks.len()), ("Δkick", delta.len())] {
            if found != expected {
                return Err(SofbError::Length {
                    what,
                    expected,
                    found,
                });
            }
        }

        let mut new = Vec::with_capacity(expected);
        for plane in Plane::ALL {
            let range = self.geometry.range(plane);
            new.extend(process_kicks(
                plane,
                &kicks[range.clone()],
                &delta[range],
                &settings.limits[plane.index()],
            )?);
        }

        self.correctors.apply(&new)?;
        let timeout = seconds(settings.readback_timeout);
        if settings.wait_readbacks && !self.correctors.wait_readbacks(&new, timeout) {
            self.log.warn("Timed out waiting for the corrector readbacks");
        }
        if settings.sync {
            self.correctors.trigger()?;
        }
        if settings.wait_readbacks && !self.correctors.wait_references(&new, timeout) {
            self.log.warn("Timed out waiting for the corrector references");
        }

        let applied: Vec<f64> = kicks
            .iter()
            .zip(new.iter())
            .map(|(k, n)| n.unwrap_or(*k))
            .collect();
        self.publish_planes("Kick", &applied);
        Ok(())
    }

    pub fn correct_once(&self) -> Result<(), SofbError> {
        let delta = self.calc_delta()?;
        self.apply_delta(&delta)
    }

    /// Apply the Δkicks of the last `calc_delta` once more
    pub fn apply_last(&self) -> Result<(), SofbError> {
        let delta = self.last_delta.lock().clone();
        match delta {
            Some(delta) => self.apply_delta(&delta),
            None => Err(SofbError::Busy(String::from("No Δkicks computed yet"))),
        }
    }

    fn stopped(&self, flag: &AtomicBool) -> bool {
        flag.load(Ordering::SeqCst) || self.shutdown.load(Ordering::SeqCst)
    }

    /// Sleep up to `timeout`. `false` if `flag` or shutdown was raised.
    fn pause(&self, timeout: Duration, flag: &AtomicBool) -> bool {
        let mut guard = self.wake_lock.lock();
        if self.stopped(flag) {
            return false;
        }
        if !timeout.is_zero() {
            self.wake.wait_for(&mut guard, timeout);
        }
        !self.stopped(flag)
    }

    fn wake_workers(&self) {
        let _guard = self.wake_lock.lock();
        self.wake.notify_all();
    }

    pub fn start_loop(self: &Arc<Self>) -> Result<(), SofbError> {
        if self.is_measuring() {
            return Err(SofbError::Busy(String::from(
                "Cannot close the loop while measuring the response matrix",
            )));
        }
        let mut workers = self.workers.lock();
        if self.is_loop_running() && !self.loop_stop.load(Ordering::SeqCst) {
            return Ok(());
        }
        // A loop told to stop finishes its iteration first
        if let Some(handle) = workers.closed_loop.take() {
            if handle.join().is_err() {
                spdlog::error!("The closed-loop thread panicked");
            }
        }
        self.loop_stop.store(false, Ordering::SeqCst);
        self.loop_running.store(true, Ordering::SeqCst);
        // Published before the worker runs, which may open the loop at once
        self.publish("ClosedLoop-Sts", ChannelValue::Enum(1));
        self.log.info("Closed loop started");
        let engine = self.clone();
        let spawned = std::thread::Builder::new()
            .name(String::from("sofb-loop"))
            .spawn(move || engine.closed_loop());
        match spawned {
            Ok(handle) => workers.closed_loop = Some(handle),
            Err(e) => {
                self.loop_running.store(false, Ordering::SeqCst);
                self.publish("ClosedLoop-Sts", ChannelValue::Enum(0));
                return Err(e.into());
            }
        }
        Ok(())
    }

    pub fn stop_loop(&self) {
        self.loop_stop.store(true, Ordering::SeqCst);
        self.wake_workers();
    }

    fn closed_loop(&self) {
        while !self.stopped(&self.loop_stop) {
            let started = Instant::now();
            let period = self.settings.lock().loop_period();
            match guarded(&self.log, "Closed loop", || self.correct_once()) {
                Some(Err(SofbError::KickError(e))) => {
                    // Outside of the safe envelope: open the loop
                    self.log.error(&e.to_string());
                    self.publish("ClosedLoop-Sel", ChannelValue::Enum(0));
                    break;
                }
                Some(Err(e)) => self.log.warn(&format!("Correction failed: {e}")),
                _ => (),
            }
            let elapsed = started.elapsed();
            if elapsed > period {
                self.log.warn(&format!(
                    "Loop iteration took {} ms, longer than the {} ms period",
                    elapsed.as_millis(),
                    period.as_millis()
                ));
                continue;
            }
            if !self.pause(period - elapsed, &self.loop_stop) {
                break;
            }
        }
        self.loop_running.store(false, Ordering::SeqCst);
        self.publish("ClosedLoop-Sts", ChannelValue::Enum(0));
        spdlog::info!("Closed loop stopped");
    }

    pub fn start_measurement(self: &Arc<Self>) -> Result<(), SofbError> {
        if self.is_loop_running() {
            return Err(SofbError::Busy(String::from(
                "Cannot measure the response matrix while the loop is closed",
            )));
        }
        let mut workers = self.workers.lock();
        if self.measuring.swap(true, Ordering::SeqCst) {
            return Err(SofbError::Busy(String::from(
                "Response matrix measurement already running",
            )));
        }
        if let Some(handle) = workers.measurement.take() {
            if handle.join().is_err() {
                spdlog::error!("The measurement thread panicked");
            }
        }
        self.meas_stop.store(false, Ordering::SeqCst);
        self.publish_meas_state(MeasState::Measuring);
        self.log.info("Measurement started");
        let engine = self.clone();
        let spawned = std::thread::Builder::new()
            .name(String::from("sofb-measure"))
            .spawn(move || engine.measure());
        match spawned {
            Ok(handle) => workers.measurement = Some(handle),
            Err(e) => {
                self.measuring.store(false, Ordering::SeqCst);
                self.publish_meas_state(MeasState::Idle);
                return Err(e.into());
            }
        }
        Ok(())
    }

    pub fn stop_measurement(&self) {
        if self.is_measuring() {
            self.meas_stop.store(true, Ordering::SeqCst);
            self.wake_workers();
        }
    }

    /// Back to `Idle`; refused while measuring
    pub fn reset_measurement(&self) -> bool {
        if self.is_measuring() {
            return false;
        }
        self.publish_meas_state(MeasState::Idle);
        true
    }

    fn measure(&self) {
        match guarded(&self.log, "Response matrix measurement", || self.sweep()) {
            Some(Ok(true)) => {
                self.publish_meas_state(MeasState::Completed);
                self.log.info("Measurement completed");
            }
            Some(Ok(false)) => {
                self.publish_meas_state(MeasState::Aborted);
                self.log.info("Measurement stopped");
            }
            Some(Err(e)) => {
                self.publish_meas_state(MeasState::Aborted);
                self.log.error(&format!("Measurement failed: {e}"));
            }
            None => self.publish_meas_state(MeasState::Aborted),
        }
        self.measuring.store(false, Ordering::SeqCst);
    }

    /// Measure one column per enabled corrector. On a stop or a failure the
    /// current and remaining columns are zeroed; the matrix is stored either
    /// way. `Ok(false)` means the sweep was stopped.
    pub fn sweep(&self) -> Result<bool, SofbError> {
        let settings = self.settings();
        let wait = seconds(settings.meas_wait);
        let (enabled, mut matrix) = {
            let matrix = self.matrix.lock();
            (matrix.enabled_correctors(), matrix.matrix().clone())
        };
        let kicks = self.correctors.kicks()?;

        let mut done = 0;
        let mut outcome = Ok(true);
        for idx in enabled.iter() {
            if self.stopped(&self.meas_stop) {
                outcome = Ok(false);
                break;
            }
            let delta = settings.meas_delta[self.geometry.plane_of(*idx).index()];
            match self.measure_column(*idx, kicks[*idx], delta, wait) {
                Ok(Some(column)) => matrix.column_mut(*idx).assign(&Array1::from(column)),
                Ok(None) => {
                    outcome = Ok(false);
                    break;
                }
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
            done += 1;
        }
        for idx in enabled[done..].iter() {
            matrix.column_mut(*idx).fill(0.0);
        }

        self.matrix.lock().set_matrix(matrix)?;
        self.publish_matrix();
        let flat = self.matrix.lock().flat();
        self.publish("RespMat-SP", ChannelValue::FloatArray(flat));
        outcome
    }

    fn measure_column(
        &self,
        idx: usize,
        original: f64,
        delta: f64,
        wait: Duration,
    ) -> Result<Option<Vec<f64>>, SofbError> {
        let outcome = self.probe(idx, original + delta / 2.0, wait).and_then(|plus| match plus {
            None => Ok(None),
            Some(plus) => Ok(self.probe(idx, original - delta / 2.0, wait)?.map(|minus| {
                plus.iter()
                    .zip(minus.iter())
                    .map(|(p, m)| (p - m) / delta)
                    .collect()
            })),
        });
        if let Err(e) = self.set_single(idx, original) {
            self.log.error(&format!("Could not restore corrector {idx}: {e}"));
        }
        outcome
    }

    // Kick one corrector, let the orbit settle and read it. `None` if stopped.
    fn probe(&self, idx: usize, kick: f64, wait: Duration) -> Result<Option<Vec<f64>>, SofbError> {
        self.set_single(idx, kick)?;
        if !self.pause(wait, &self.meas_stop) {
            return Ok(None);
        }
        let orbit = self.orbit.lock().acquire()?;
        Ok(Some(orbit))
    }

    fn set_single(&self, idx: usize, kick: f64) -> Result<(), SofbError> {
        let mut kicks = vec![None; self.correctors.nr_correctors()];
        kicks[idx] = Some(kick);
        self.correctors.apply(&kicks)
    }

    /// Stop both workers and wait for them
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.loop_stop.store(true, Ordering::SeqCst);
        self.meas_stop.store(true, Ordering::SeqCst);
        self.wake_workers();
        let mut workers = self.workers.lock();
        for handle in [workers.closed_loop.take(), workers.measurement.take()]
            .into_iter()
            .flatten()
        {
            if handle.join().is_err() {
                spdlog::error!("A SOFB worker thread panicked");
            }
        }
    }
}

//Unit tests
#[cfg(test)]
mod tests {
    use super::*;
    use crate::sofb::app::database;
    use crate::sofb::orbit::{OrbitMode, OrbitSource};
    use ndarray::Array2;

    /// Correctors whose kicks move the orbit through a fixed response
    struct Machine {
        kicks: Mutex<Vec<f64>>,
        applied: Mutex<Vec<Vec<Option<f64>>>>,
        response: Array2<f64>,
    }

    impl Machine {
        fn new(kicks: Vec<f64>) -> Arc<Self> {
            Arc::new(Self {
                response: Array2::eye(kicks.len()),
                kicks: Mutex::new(kicks),
                applied: Mutex::new(Vec::new()),
            })
        }
    }

    impl CorrectorSet for Machine {
        fn nr_correctors(&self) -> usize {
            self.kicks.lock().len()
        }

        fn kicks(&self) -> Result<Vec<f64>, SofbError> {
            Ok(self.kicks.lock().clone())
        }

        fn apply(&self, kicks: &[Option<f64>]) -> Result<(), SofbError> {
            let mut current = self.kicks.lock();
            for (k, new) in current.iter_mut().zip(kicks.iter()) {
                if let Some(new) = new {
                    *k = *new;
                }
            }
            self.applied.lock().push(kicks.to_vec());
            Ok(())
        }

        fn wait_readbacks(&self, _kicks: &[Option<f64>], _timeout: Duration) -> bool {
            true
        }

        fn trigger(&self) -> Result<(), SofbError> {
            Ok(())
        }

        fn wait_references(&self, _kicks: &[Option<f64>], _timeout: Duration) -> bool {
            true
        }

        fn connected(&self) -> bool {
            true
        }
    }

    struct MachineOrbit(Arc<Machine>);

    impl OrbitSource for MachineOrbit {
        fn acquire(&self, _mode: OrbitMode, _timeout: Duration) -> Result<Vec<f64>, SofbError> {
            let kicks = Array1::from(self.0.kicks.lock().clone());
            Ok(self.0.response.dot(&kicks).to_vec())
        }

        fn connected(&self) -> bool {
            true
        }
    }

    fn geometry() -> Geometry {
        Geometry {
            nr_bpms: 2,
            nr_ch: 2,
            nr_cv: 2,
            has_rf: false,
        }
    }

    fn engine(kicks: Vec<f64>) -> (Arc<Engine>, Arc<Machine>) {
        let config = SofbConfig {
            meas_wait: 0.0,
            loop_frequency: 20.0,
            ..Default::default()
        };
        let db = Arc::new(Database::create(database(geometry(), &config)).unwrap());
        let machine = Machine::new(kicks);
        let orbit = Orbit::new(
            Arc::new(MachineOrbit(machine.clone())),
            geometry().orbit_len(),
            Duration::from_millis(100),
        );
        let matrix = ResponseMatrix::new(geometry(), config.min_sing_value, config.tikhonov);
        let engine = Engine::new(
            db.clone(),
            LogChannel::new(db),
            geometry(),
            orbit,
            matrix,
            machine.clone(),
            Settings::from_config(&config),
        );
        (Arc::new(engine), machine)
    }

    fn identity(engine: &Engine) {
        engine
            .with_matrix(|m| m.set_matrix(Array2::eye(4)))
            .unwrap();
    }

    #[test]
    fn test_correction_step_cancels_orbit() {
        let (engine, machine) = engine(vec![1.0, -2.0, 0.5, 3.0]);
        identity(&engine);
        engine.correct_once().unwrap();
        for k in machine.kicks.lock().iter() {
            assert!(k.abs() < 1e-9);
        }
        let delta = engine.db.value("DeltaKickCV-Mon").unwrap().to_f64_vec().unwrap();
        assert!((delta[0] + 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_kick_above_max_touches_nothing() {
        let (engine, machine) = engine(vec![400.0, 0.0, 0.0, 1.0]);
        identity(&engine);
        let err = engine.correct_once().unwrap_err();
        assert!(matches!(err, SofbError::KickError(_)));
        assert!(machine.applied.lock().is_empty());
    }

    #[test]
    fn test_sweep_measures_the_response() {
        let (engine, machine) = engine(vec![1.0, 2.0, 3.0, 4.0]);
        assert!(engine.sweep().unwrap());
        let measured = engine.matrix();
        for (x, y) in measured.matrix().iter().zip(Array2::<f64>::eye(4).iter()) {
            assert!((x - y).abs() < 1e-9);
        }
        // Every corrector is back where it started
        assert_eq!(*machine.kicks.lock(), vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(measured.nr_sing_values(), 4);
    }

    #[test]
    fn test_disabled_corrector_is_not_measured() {
        let (engine, machine) = engine(vec![0.0; 4]);
        engine
            .with_matrix(|m| m.set_corr_enable(&[true, false, true, true]))
            .unwrap();
        assert!(engine.sweep().unwrap());
        assert!(machine.applied.lock().iter().all(|kicks| kicks[1].is_none()));
        assert_eq!(engine.matrix().matrix()[[1, 1]], 0.0);
    }

    #[test]
    fn test_closed_loop_runs_until_stopped() {
        let (engine, machine) = engine(vec![2.0, 2.0, 2.0, 2.0]);
        identity(&engine);
        engine.update_settings(|s| s.limits.iter_mut().for_each(|l| l.corr_factor = 0.5));
        engine.start_loop().unwrap();
        assert!(engine.start_measurement().is_err());

        let deadline = Instant::now() + Duration::from_secs(5);
        while machine.kicks.lock()[0] > 0.01 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(machine.kicks.lock()[0] <= 0.01);

        engine.stop_loop();
        let deadline = Instant::now() + Duration::from_secs(5);
        while engine.is_loop_running() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!engine.is_loop_running());
        assert_eq!(engine.db.value("ClosedLoop-Sts").unwrap(), ChannelValue::Enum(0));
        engine.shutdown();
    }
}
