use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::correctors::{ChannelCorrectors, CorrectorSet};
use super::engine::{Engine, MeasState, Settings};
use super::matrix::ResponseMatrix;
use super::orbit::{BpmOrbit, Orbit, OrbitMode, OrbitSource};
use super::{Accelerator, Geometry, Plane, SofbConfig};
use crate::channel::{ChannelDescriptor, ChannelValue, Condition, Severity};
use crate::database::Database;
use crate::driver::Application;
use crate::error::SofbError;
use crate::ioc::AppContext;
use crate::logging::{guarded, LogChannel, LOG_CHANNEL};
use crate::queue::WorkQueue;
use crate::status::StatusWord;

const OFF_ON: [&str; 2] = ["Off", "On"];
const DSBL_ENBL: [&str; 2] = ["Dsbl", "Enbl"];
const MEAS_COMMANDS: [&str; 3] = ["Start", "Stop", "Reset"];

const STATUS_LABELS: [&str; 6] = ["Orbit", "Correctors", "Timing", "LoopOpen", "Measuring", "RespMat"];
const BIT_ORBIT: usize = 0;
const BIT_CORRECTORS: usize = 1;
const BIT_TIMING: usize = 2;
const BIT_LOOP_OPEN: usize = 3;
const BIT_MEASURING: usize = 4;
const BIT_RESPMAT: usize = 5;

fn planes(geometry: Geometry) -> Vec<Plane> {
    Plane::ALL
        .into_iter()
        .filter(|p| !geometry.range(*p).is_empty())
        .collect()
}

fn unit(plane: Plane) -> &'static str {
    match plane {
        Plane::RF => "Hz",
        _ => "urad",
    }
}

fn pair(db: &mut Vec<ChannelDescriptor>, make: impl Fn(&str) -> ChannelDescriptor) {
    db.push(make("SP"));
    db.push(make("RB"));
}

/// Channels of one SOFB, without the IOC prefix
pub fn database(geometry: Geometry, config: &SofbConfig) -> Vec<ChannelDescriptor> {
    let nbpm = geometry.nr_bpms;
    let ncorr = geometry.nr_correctors();
    let mut db = Vec::new();

    for suffix in ["Sel", "Sts"] {
        db.push(ChannelDescriptor::enumeration(&format!("ClosedLoop-{suffix}"), &OFF_ON, 0));
    }
    pair(&mut db, |s| {
        ChannelDescriptor::float(&format!("ClosedLoopFreq-{s}"), config.loop_frequency)
            .unit("Hz")
            .prec(2)
            .limits(0.01, 100.0)
    });

    db.push(ChannelDescriptor::enumeration("MeasRespMat-Sel", &MEAS_COMMANDS, 0));
    db.push(ChannelDescriptor::enumeration("MeasRespMat-Mon", &MeasState::LABELS, 0));
    for plane in planes(geometry) {
        let delta = config.meas_delta[plane.index()];
        pair(&mut db, |s| {
            ChannelDescriptor::float(&format!("MeasRespMatKick{}-{s}", plane.family()), delta)
                .unit(unit(plane))
                .prec(3)
                .limits(0.001, 1000.0)
        });
    }
    pair(&mut db, |s| {
        ChannelDescriptor::float(&format!("MeasRespMatWait-{s}"), config.meas_wait)
            .unit("s")
            .prec(3)
            .limits(0.0, 100.0)
    });

    for suffix in ["Sel", "Sts"] {
        db.push(ChannelDescriptor::enumeration(
            &format!("OrbitMode-{suffix}"),
            &OrbitMode::LABELS,
            OrbitMode::SlowOrb.index(),
        ));
    }
    pair(&mut db, |s| ChannelDescriptor::int(&format!("SmoothNrPts-{s}"), 1).limits(1.0, 500.0));
    db.push(ChannelDescriptor::int("SmoothReset-Cmd", 0));
    for what in ["OrbitRef", "OrbitOffline"] {
        for plane in ["X", "Y"] {
            pair(&mut db, |s| {
                ChannelDescriptor::float_array(&format!("{what}{plane}-{s}"), nbpm, vec![0.0; nbpm])
                    .unit("nm")
            });
        }
    }
    db.push(ChannelDescriptor::float_array("OrbX-Mon", nbpm, vec![0.0; nbpm]).unit("nm"));
    db.push(ChannelDescriptor::float_array("OrbY-Mon", nbpm, vec![0.0; nbpm]).unit("nm"));

    for (name, len) in [
        ("BPMX", nbpm),
        ("BPMY", nbpm),
        ("CH", geometry.nr_ch),
        ("CV", geometry.nr_cv),
    ] {
        pair(&mut db, |s| {
            ChannelDescriptor::int_array(&format!("{name}EnblList-{s}"), len, vec![1; len])
                .limits(0.0, 1.0)
        });
    }
    if geometry.has_rf {
        for suffix in ["Sel", "Sts"] {
            db.push(ChannelDescriptor::enumeration(&format!("RFEnbl-{suffix}"), &DSBL_ENBL, 1));
        }
    }

    let len = geometry.matrix_len();
    pair(&mut db, |s| ChannelDescriptor::float_array(&format!("RespMat-{s}"), len, vec![0.0; len]));
    db.push(ChannelDescriptor::float_array("InvRespMat-Mon", len, vec![0.0; len]));
    db.push(ChannelDescriptor::float_array("SingValues-Mon", ncorr, Vec::new()));
    pair(&mut db, |s| {
        ChannelDescriptor::float(&format!("MinSingValue-{s}"), config.min_sing_value)
            .prec(4)
            .limits(0.0, 1.0e6)
    });
    pair(&mut db, |s| {
        ChannelDescriptor::float(&format!("TikhonovRegConst-{s}"), config.tikhonov)
            .prec(4)
            .limits(0.0, 1.0e6)
    });

    for plane in planes(geometry) {
        let family = plane.family();
        let idx = plane.index();
        let n = geometry.range(plane).len();
        for what in ["DeltaKick", "Kick"] {
            let name = format!("{what}{family}-Mon");
            let desc = match plane {
                Plane::RF => ChannelDescriptor::float(&name, 0.0),
                _ => ChannelDescriptor::float_array(&name, n, vec![0.0; n]),
            };
            db.push(desc.unit(unit(plane)).prec(3));
        }
        pair(&mut db, |s| {
            ChannelDescriptor::float(&format!("MaxKick{family}-{s}"), config.max_kick[idx])
                .unit(unit(plane))
                .prec(3)
                .limits(0.0, 1.0e10)
        });
        pair(&mut db, |s| {
            ChannelDescriptor::float(&format!("MaxDeltaKick{family}-{s}"), config.max_delta_kick[idx])
                .unit(unit(plane))
                .prec(3)
                .limits(0.0, 1.0e10)
        });
        pair(&mut db, |s| {
            ChannelDescriptor::float(&format!("ManCorrGain{family}-{s}"), config.corr_factor[idx] * 100.0)
                .unit("%")
                .prec(2)
                .limits(-100.0, 100.0)
        });
    }
    db.push(ChannelDescriptor::int("CalcDelta-Cmd", 0));
    db.push(ChannelDescriptor::int("ApplyDelta-Cmd", 0));
    for suffix in ["Sel", "Sts"] {
        db.push(ChannelDescriptor::enumeration(
            &format!("CorrSync-{suffix}"),
            &OFF_ON,
            config.trigger.is_some() as u16,
        ));
    }

    let status = StatusWord::new(&STATUS_LABELS);
    db.push(ChannelDescriptor::int("Status-Mon", status.value()));
    db.push(ChannelDescriptor::string_array("StatusLabels-Cte", status.labels()));
    db.push(ChannelDescriptor::string(LOG_CHANNEL, ""));
    db
}

/// Plane of a per-plane setpoint such as `MaxKickCH-SP`
fn plane_setting(name: &str, stem: &str) -> Option<Plane> {
    let family = name.strip_prefix(stem)?.strip_suffix("-SP")?;
    Plane::ALL.into_iter().find(|p| p.family() == family)
}

fn flags(value: &ChannelValue) -> Vec<bool> {
    value
        .to_f64_vec()
        .unwrap_or_default()
        .iter()
        .map(|x| *x != 0.0)
        .collect()
}

/// The SOFB application: maps channel writes onto the correction engine and
/// refreshes orbit, kicks and status while the loop is open.
pub struct SofbApp {
    engine: Arc<Engine>,
    db: Arc<Database>,
    log: LogChannel,
    queue: Arc<WorkQueue>,
    status: Mutex<StatusWord>,
    last_refresh: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for SofbApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SofbApp").field("engine", &self.engine).finish()
    }
}

impl SofbApp {
    pub fn new(
        context: &AppContext,
        config: SofbConfig,
        geometry: Geometry,
        source: Arc<dyn OrbitSource>,
        correctors: Arc<dyn CorrectorSet>,
    ) -> Result<Self, SofbError> {
        if correctors.nr_correctors() != geometry.nr_correctors() {
            return Err(SofbError::Length {
                what: "corrector",
                expected: geometry.nr_correctors(),
                found: correctors.nr_correctors(),
            });
        }
        let orbit = Orbit::new(source, geometry.orbit_len(), config.orbit_timeout());
        let matrix = ResponseMatrix::new(geometry, config.min_sing_value, config.tikhonov);
        let engine = Arc::new(Engine::new(
            context.db.clone(),
            context.log.clone(),
            geometry,
            orbit,
            matrix,
            correctors,
            Settings::from_config(&config),
        ));
        engine.publish_matrix();
        let app = Self {
            engine,
            db: context.db.clone(),
            log: context.log.clone(),
            queue: context.queue.clone(),
            status: Mutex::new(StatusWord::new(&STATUS_LABELS)),
            last_refresh: Mutex::new(None),
        };
        app.update_status();
        Ok(app)
    }

    /// Connect to the BPMs and correctors of `accelerator`
    pub fn connect(
        context: &AppContext,
        config: SofbConfig,
        accelerator: Accelerator,
    ) -> Result<Self, SofbError> {
        let geometry = accelerator.geometry();
        let source = Arc::new(BpmOrbit::new(context.client.clone(), accelerator.bpm_names()));
        let correctors = Arc::new(ChannelCorrectors::new(
            context.client.clone(),
            &accelerator.corrector_names(),
            geometry.has_rf.then_some(config.rf_generator.as_str()),
            config.trigger.as_deref(),
            config.readback_tolerance,
        ));
        spdlog::info!(
            "{accelerator} SOFB: {} BPMs, {} correctors",
            geometry.nr_bpms,
            geometry.nr_correctors()
        );
        Self::new(context, config, geometry, source, correctors)
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    fn set(&self, name: &str, value: ChannelValue) {
        if let Err(e) = self.db.set_value(name, value) {
            spdlog::error!("Could not update {name}: {e}");
        }
    }

    fn setting(&self, name: &str) -> Option<ChannelValue> {
        self.db.value(name).ok()
    }

    fn update_status(&self) {
        let engine = &self.engine;
        let sync = engine.settings().sync;
        let value = {
            let mut status = self.status.lock();
            status.set(BIT_ORBIT, !engine.orbit_connected());
            status.set(BIT_CORRECTORS, !engine.correctors().connected());
            status.set(BIT_TIMING, sync && !engine.correctors().timing_connected());
            status.set(BIT_LOOP_OPEN, !engine.is_loop_running());
            status.set(BIT_MEASURING, engine.is_measuring());
            status.set(BIT_RESPMAT, engine.nr_sing_values() == 0);
            status.channel_value()
        };
        self.set("Status-Mon", value);
    }

    fn refresh(&self) {
        if let Err(e) = self.engine.refresh_orbit() {
            spdlog::debug!("Orbit refresh failed: {e}");
            for name in ["OrbX-Mon", "OrbY-Mon"] {
                if let Err(e) = self.db.set_alarm(name, Severity::Invalid, Condition::Comm) {
                    spdlog::error!("{e}");
                }
            }
        }
        if let Err(e) = self.engine.refresh_kicks() {
            spdlog::debug!("Kick refresh failed: {e}");
        }
    }

    fn expect_len(&self, name: &str, value: &ChannelValue, expected: usize) -> bool {
        if value.len() != expected {
            self.log.warn(&format!(
                "{name} needs {expected} values; {} given",
                value.len()
            ));
            return false;
        }
        true
    }

    fn apply_enable_lists(&self) {
        let read = |name: &str| self.setting(name).map(|v| flags(&v)).unwrap_or_default();
        let mut bpm = read("BPMXEnblList-RB");
        bpm.extend(read("BPMYEnblList-RB"));
        let mut corr = read("CHEnblList-RB");
        corr.extend(read("CVEnblList-RB"));
        if self.db.contains("RFEnbl-Sts") {
            corr.push(self.setting("RFEnbl-Sts").and_then(|v| v.as_bool()).unwrap_or(false));
        }
        let result = self.engine.with_matrix(|m| {
            m.set_bpm_enable(&bpm)?;
            m.set_corr_enable(&corr)
        });
        if let Err(e) = result {
            self.log.error(&format!("Enable lists not applied: {e}"));
        }
    }

    fn apply_orbit_setting(&self, name: &str, value: &ChannelValue) {
        let values = value.to_f64_vec().unwrap_or_default();
        let result = self.engine.with_orbit(|orbit| match name {
            "OrbitRefX-SP" => orbit.set_reference_plane(false, &values),
            "OrbitRefY-SP" => orbit.set_reference_plane(true, &values),
            "OrbitOfflineX-SP" => orbit.set_offline_plane(false, &values),
            _ => orbit.set_offline_plane(true, &values),
        });
        if let Err(e) = result {
            self.log.error(&format!("{name} not applied: {e}"));
        }
    }

    fn apply_plane_setting(&self, name: &str, x: f64) -> bool {
        let engine = &self.engine;
        if let Some(plane) = plane_setting(name, "MaxKick") {
            engine.update_settings(|s| s.limits[plane.index()].max_kick = x);
        } else if let Some(plane) = plane_setting(name, "MaxDeltaKick") {
            engine.update_settings(|s| s.limits[plane.index()].max_delta_kick = x);
        } else if let Some(plane) = plane_setting(name, "ManCorrGain") {
            engine.update_settings(|s| s.limits[plane.index()].corr_factor = x / 100.0);
        } else if let Some(plane) = plane_setting(name, "MeasRespMatKick") {
            engine.update_settings(|s| s.meas_delta[plane.index()] = x);
        } else {
            return false;
        }
        true
    }

    fn submit_correction(&self, label: &str, apply: bool) {
        let engine = self.engine.clone();
        let log = self.log.clone();
        self.queue.submit(label, move |cancelled| {
            if cancelled {
                return;
            }
            let result = if apply {
                engine.apply_last()
            } else {
                engine.calc_delta().map(|_| ())
            };
            match result {
                Ok(()) if apply => log.info("Δkicks applied"),
                Ok(()) => log.info("Δkicks computed"),
                Err(e) => log.error(&e.to_string()),
            }
        });
    }
}

impl Application for SofbApp {
    fn write(&self, name: &str, value: &ChannelValue) -> bool {
        let engine = &self.engine;
        let geometry = engine.geometry();
        match name {
            "ClosedLoop-Sel" if value.as_bool() == Some(true) && engine.is_measuring() => {
                self.log.warn("Cannot close the loop while measuring the response matrix");
                false
            }
            "MeasRespMat-Sel" => match value.as_i64() {
                Some(0) if engine.is_loop_running() => {
                    self.log.warn("Cannot measure the response matrix while the loop is closed");
                    false
                }
                Some(2) if engine.is_measuring() => {
                    self.log.warn("Cannot reset while measuring the response matrix");
                    false
                }
                _ => true,
            },
            "CalcDelta-Cmd" | "ApplyDelta-Cmd" if engine.is_loop_running() => {
                self.log.warn("Manual correction refused while the loop is closed");
                false
            }
            "RespMat-SP" => self.expect_len(name, value, geometry.matrix_len()),
            "OrbitRefX-SP" | "OrbitRefY-SP" | "OrbitOfflineX-SP" | "OrbitOfflineY-SP"
            | "BPMXEnblList-SP" | "BPMYEnblList-SP" => self.expect_len(name, value, geometry.nr_bpms),
            "CHEnblList-SP" => self.expect_len(name, value, geometry.nr_ch),
            "CVEnblList-SP" => self.expect_len(name, value, geometry.nr_cv),
            _ => true,
        }
    }

    fn after_write(&self, name: &str, value: &ChannelValue) {
        let engine = &self.engine;
        let x = value.as_f64().unwrap_or_default();
        match name {
            "ClosedLoop-Sel" => {
                if value.as_bool() == Some(true) {
                    if let Err(e) = engine.start_loop() {
                        self.log.warn(&e.to_string());
                        self.set("ClosedLoop-Sel", ChannelValue::Enum(0));
                        self.set("ClosedLoop-Sts", ChannelValue::Enum(0));
                    }
                } else {
                    engine.stop_loop();
                }
            }
            "ClosedLoopFreq-SP" => engine.update_settings(|s| s.loop_frequency = x),
            "MeasRespMat-Sel" => match value.as_i64() {
                Some(0) => {
                    if let Err(e) = engine.start_measurement() {
                        self.log.warn(&e.to_string());
                    }
                }
                Some(1) => engine.stop_measurement(),
                _ => {
                    engine.reset_measurement();
                }
            },
            "MeasRespMatWait-SP" => engine.update_settings(|s| s.meas_wait = x),
            "OrbitMode-Sel" => {
                let mode = OrbitMode::from_index(x as u16).unwrap_or(OrbitMode::SlowOrb);
                engine.with_orbit(|orbit| orbit.set_mode(mode));
                self.log.info(&format!("Orbit mode set to {}", OrbitMode::LABELS[mode.index() as usize]));
            }
            "SmoothNrPts-SP" => engine.with_orbit(|orbit| orbit.set_smooth_points(x as usize)),
            "SmoothReset-Cmd" => engine.with_orbit(|orbit| orbit.reset_smoothing()),
            "OrbitRefX-SP" | "OrbitRefY-SP" | "OrbitOfflineX-SP" | "OrbitOfflineY-SP" => {
                self.apply_orbit_setting(name, value)
            }
            "BPMXEnblList-SP" | "BPMYEnblList-SP" | "CHEnblList-SP" | "CVEnblList-SP"
            | "RFEnbl-Sel" => self.apply_enable_lists(),
            "RespMat-SP" => {
                let values = value.to_f64_vec().unwrap_or_default();
                if let Err(e) = engine.with_matrix(|m| m.set_flat(&values)) {
                    self.log.error(&format!("Response matrix not applied: {e}"));
                }
            }
            "MinSingValue-SP" => {
                if let Err(e) = engine.with_matrix(|m| m.set_min_sing_value(x)) {
                    self.log.error(&format!("Singular value cutoff not applied: {e}"));
                }
            }
            "TikhonovRegConst-SP" => {
                if let Err(e) = engine.with_matrix(|m| m.set_tikhonov(x)) {
                    self.log.error(&format!("Tikhonov constant not applied: {e}"));
                }
            }
            "CalcDelta-Cmd" => self.submit_correction("Calculate Δkicks", false),
            "ApplyDelta-Cmd" => self.submit_correction("Apply Δkicks", true),
            "CorrSync-Sel" => engine.update_settings(|s| s.sync = value.as_bool() == Some(true)),
            _ => {
                if !self.apply_plane_setting(name, x) {
                    spdlog::debug!("No action bound to {name}");
                }
            }
        }
        self.update_status();
    }

    fn process(&self, interval: Duration) {
        let period = self.engine.settings().loop_period();
        let due = self
            .last_refresh
            .lock()
            .map_or(true, |last| last.elapsed() >= period);
        if due {
            *self.last_refresh.lock() = Some(Instant::now());
            if !self.engine.is_loop_running() && !self.engine.is_measuring() {
                guarded(&self.log, "SOFB refresh", || self.refresh());
            }
            self.update_status();
        }
        std::thread::sleep(interval);
    }

    fn shutdown(&self) {
        self.engine.shutdown();
    }
}

//Unit tests
#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> Geometry {
        Geometry {
            nr_bpms: 3,
            nr_ch: 2,
            nr_cv: 2,
            has_rf: true,
        }
    }

    #[test]
    fn test_database_description() {
        let db = Database::create(database(geometry(), &SofbConfig::default())).unwrap();
        for name in [
            "ClosedLoop-Sel",
            "ClosedLoop-Sts",
            "MeasRespMat-Mon",
            "MeasRespMatKickRF-SP",
            "OrbitRefY-RB",
            "CVEnblList-SP",
            "RFEnbl-Sts",
            "InvRespMat-Mon",
            "DeltaKickRF-Mon",
            "ManCorrGainCH-RB",
            "CorrSync-Sts",
        ] {
            assert!(db.contains(name), "{name}");
        }
        assert_eq!(db.descriptor("RespMat-SP").unwrap().count, 6 * 5);
        assert_eq!(
            db.value("ManCorrGainCV-SP").unwrap(),
            ChannelValue::Float(100.0)
        );
    }

    #[test]
    fn test_booster_has_no_rf_channels() {
        let geometry = Accelerator::BO.geometry();
        let db = Database::create(database(geometry, &SofbConfig::default())).unwrap();
        assert!(!db.contains("RFEnbl-Sel"));
        assert!(!db.contains("MaxKickRF-SP"));
        assert!(db.contains("MaxKickCV-SP"));
    }

    #[test]
    fn test_plane_setting_names() {
        assert_eq!(plane_setting("MaxKickCH-SP", "MaxKick"), Some(Plane::H));
        assert_eq!(plane_setting("MaxDeltaKickRF-SP", "MaxDeltaKick"), Some(Plane::RF));
        assert_eq!(plane_setting("MaxDeltaKickCV-SP", "MaxKick"), None);
        assert_eq!(plane_setting("ManCorrGainCV-RB", "ManCorrGain"), None);
        assert_eq!(flags(&ChannelValue::IntArray(vec![1, 0, 1])), vec![true, false, true]);
    }
}
