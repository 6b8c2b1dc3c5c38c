mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{ioc_config, Machine, MachineOrbit, Running, TIMEOUT};
use libsirius_ioc::channel::ChannelValue;
use libsirius_ioc::driver::Application;
use libsirius_ioc::error::BusError;
use libsirius_ioc::sofb::app::{database, SofbApp};
use libsirius_ioc::sofb::{Geometry, SofbConfig};


fn geometry() -> Geometry {
    Geometry {
        nr_bpms: 2,
        nr_ch: 2,
        nr_cv: 2,
        has_rf: false,
    }
}

fn sofb_config() -> SofbConfig {
    SofbConfig {
        loop_frequency: 20.0,
        meas_wait: 0.2,
        wait_readbacks: false,
        orbit_timeout: 0.1,
        ..Default::default()
    }
}

fn start_sofb(prefix: &str, machine: &Arc<Machine>) -> Running {
    let config = sofb_config();
    let machine = machine.clone();
    Running::start(ioc_config(prefix), database(geometry(), &config), move |context| {
        let source = Arc::new(MachineOrbit(machine.clone()));
        let app = SofbApp::new(context, config, geometry(), source, machine)?;
        Ok(Arc::new(app) as Arc<dyn Application>)
    })
}

fn identity() -> Vec<f64> {
    let n = geometry().nr_correctors();
    (0..geometry().orbit_len() * n)
        .map(|i| if i / n == i % n { 1.0 } else { 0.0 })
        .collect()
}

fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while !cond() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    true
}

#[test]
fn test_loop_opens_on_kick_above_max() {
    let machine = Machine::new(vec![400.0, 0.0, 0.0, 1.0]);
    let ioc = start_sofb("SI-Glob:AP-SOFB-Max:", &machine);

    ioc.put("ClosedLoop-Sel", ChannelValue::Enum(1)).unwrap();
    assert!(ioc.updates.log_contains("Kicks above MaxKickH", TIMEOUT));
    assert!(ioc.poll("ClosedLoop-Sts", |v| v.as_i64() == Some(0), TIMEOUT));
    assert_eq!(ioc.get("ClosedLoop-Sel").as_i64(), Some(0));
    assert!(machine.applied.lock().is_empty());
    assert_eq!(machine.kicks.lock()[0], 400.0);
    ioc.stop().unwrap();
}

#[test]
fn test_closed_loop_corrects_the_orbit() {
    let machine = Machine::new(vec![1.0, -2.0, 0.5, 3.0]);
    let ioc = start_sofb("SI-Glob:AP-SOFB-Loop:", &machine);

    ioc.put("RespMat-SP", ChannelValue::FloatArray(identity())).unwrap();
    ioc.put("ClosedLoop-Sel", ChannelValue::Enum(1)).unwrap();
    assert!(ioc.poll("ClosedLoop-Sts", |v| v.as_i64() == Some(1), TIMEOUT));
    assert!(wait_until(TIMEOUT, || machine
        .kicks
        .lock()
        .iter()
        .all(|k| k.abs() < 1e-6)));

    // Manual correction is refused while the loop runs
    let result = ioc.put("CalcDelta-Cmd", ChannelValue::Int(1));
    assert!(matches!(result, Err(BusError::Rejected(_, _))));
    assert!(ioc.updates.log_contains("refused while the loop is closed", TIMEOUT));

    ioc.put("ClosedLoop-Sel", ChannelValue::Enum(0)).unwrap();
    assert!(ioc.poll("ClosedLoop-Sts", |v| v.as_i64() == Some(0), TIMEOUT));
    ioc.stop().unwrap();
}

#[test]
fn test_manual_correction() {
    let machine = Machine::new(vec![0.5, 0.0, -1.0, 0.0]);
    let ioc = start_sofb("SI-Glob:AP-SOFB-Manual:", &machine);

    ioc.put("RespMat-SP", ChannelValue::FloatArray(identity())).unwrap();
    ioc.put("CalcDelta-Cmd", ChannelValue::Int(1)).unwrap();
    assert!(ioc.updates.log_contains("Δkicks computed", TIMEOUT));
    let delta = ioc.get("DeltaKickCH-Mon").to_f64_vec().unwrap();
    assert!((delta[0] + 0.5).abs() < 1e-9);
    // Nothing moves until the Δkicks are applied
    assert_eq!(machine.kicks.lock()[0], 0.5);

    ioc.put("ApplyDelta-Cmd", ChannelValue::Int(1)).unwrap();
    assert!(ioc.updates.log_contains("Δkicks applied", TIMEOUT));
    assert!(machine.kicks.lock().iter().all(|k| k.abs() < 1e-9));
    ioc.stop().unwrap();
}

#[test]
fn test_measurement_stop_zeroes_remaining_columns() {
    let machine = Machine::new(vec![0.0; 4]);
    let ioc = start_sofb("SI-Glob:AP-SOFB-Meas:", &machine);

    ioc.put("MeasRespMat-Sel", ChannelValue::Enum(0)).unwrap();
    assert!(ioc.updates.log_contains("Measurement started", TIMEOUT));
    // Plus, minus and restore of the first corrector
    assert!(wait_until(TIMEOUT, || machine.applied.lock().len() >= 3));

    // The loop cannot close while measuring
    let result = ioc.put("ClosedLoop-Sel", ChannelValue::Enum(1));
    assert!(matches!(result, Err(BusError::Rejected(_, _))));

    ioc.put("MeasRespMat-Sel", ChannelValue::Enum(1)).unwrap();
    assert!(ioc.updates.log_contains("Measurement stopped", TIMEOUT));
    assert!(ioc
        .updates
        .wait_for("MeasRespMat-Mon", |v| v.as_i64() == Some(3), TIMEOUT));

    let n = geometry().nr_correctors();
    let stored = ioc.get("RespMat-RB").to_f64_vec().unwrap();
    assert!((stored[0] - 1.0).abs() < 1e-9);
    for row in 0..geometry().orbit_len() {
        assert_eq!(stored[row * n + 1], 0.0);
        assert_eq!(stored[row * n + n - 1], 0.0);
    }
    // Every probed corrector was put back
    assert!(machine.kicks.lock().iter().all(|k| *k == 0.0));
    ioc.stop().unwrap();
}
