#![allow(dead_code)]
//! Fake devices and a harness running a whole IOC on the loopback interface.
use crossbeam_channel::{unbounded, Receiver};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use libsirius_ioc::bus::client::{ChannelAccess, ChannelClient};
use libsirius_ioc::channel::{ChannelDescriptor, ChannelValue};
use libsirius_ioc::config::IocConfig;
use libsirius_ioc::database::ChannelUpdate;
use libsirius_ioc::devices::ecodrive::Drive;
use libsirius_ioc::devices::gpio::IoBus;
use libsirius_ioc::devices::Axis;
use libsirius_ioc::driver::Application;
use libsirius_ioc::error::{BusError, DriveError, GpioError, IocError, SofbError};
use libsirius_ioc::ioc::{AppContext, Ioc, IocInfo};
use libsirius_ioc::logging::LOG_CHANNEL;
use libsirius_ioc::sofb::correctors::CorrectorSet;
use libsirius_ioc::sofb::orbit::{OrbitMode, OrbitSource};

pub const TIMEOUT: Duration = Duration::from_secs(5);

fn axis_index(axis: Axis) -> usize {
    match axis {
        Axis::Gap => 0,
        Axis::Phase => 1,
    }
}

#[derive(Debug)]
struct DriveRegisters {
    encoder: f64,
    target: f64,
    velocity: f64,
    max_velocity: f64,
    diagnostic: String,
}

/// A drive whose encoder walks toward the target once its pair is started
#[derive(Debug)]
pub struct FakeDrive {
    address: u8,
    registers: Mutex<DriveRegisters>,
    motion: Arc<AtomicBool>,
    step: f64,
    pub target_writes: Mutex<Vec<f64>>,
    pub velocity_writes: Mutex<Vec<f64>>,
}

impl FakeDrive {
    pub fn new(address: u8, position: f64, diagnostic: &str, motion: Arc<AtomicBool>) -> Arc<Self> {
        Arc::new(Self {
            address,
            registers: Mutex::new(DriveRegisters {
                encoder: position,
                target: position,
                velocity: 60.0,
                max_velocity: 500.0,
                diagnostic: diagnostic.to_string(),
            }),
            motion,
            step: 1.0,
            target_writes: Mutex::new(Vec::new()),
            velocity_writes: Mutex::new(Vec::new()),
        })
    }

    pub fn target(&self) -> f64 {
        self.registers.lock().target
    }

    pub fn velocity(&self) -> f64 {
        self.registers.lock().velocity
    }
}

impl Drive for FakeDrive {
    fn address(&self) -> u8 {
        self.address
    }

    fn get_encoder_position(&self) -> Result<f64, DriveError> {
        let mut regs = self.registers.lock();
        if self.motion.load(Ordering::SeqCst) {
            let gap = regs.target - regs.encoder;
            regs.encoder += gap.clamp(-self.step, self.step);
        }
        Ok(regs.encoder)
    }

    fn get_resolver_position(&self) -> Result<f64, DriveError> {
        Ok(self.registers.lock().encoder)
    }

    fn get_target_position(&self) -> Result<f64, DriveError> {
        Ok(self.registers.lock().target)
    }

    fn set_target_position(&self, position: f64) -> Result<(), DriveError> {
        self.target_writes.lock().push(position);
        self.registers.lock().target = position;
        Ok(())
    }

    fn get_max_velocity(&self) -> Result<f64, DriveError> {
        Ok(self.registers.lock().max_velocity)
    }

    fn get_target_velocity(&self) -> Result<f64, DriveError> {
        Ok(self.registers.lock().velocity)
    }

    fn set_target_velocity(&self, velocity: f64) -> Result<(), DriveError> {
        self.velocity_writes.lock().push(velocity);
        self.registers.lock().velocity = velocity;
        Ok(())
    }

    fn get_diagnostic_code(&self) -> Result<String, DriveError> {
        Ok(self.registers.lock().diagnostic.clone())
    }

    fn get_halten_status(&self) -> Result<bool, DriveError> {
        Ok(!self.motion.load(Ordering::SeqCst))
    }

    fn clear_error(&self) -> Result<(), DriveError> {
        self.registers.lock().diagnostic = String::from("A012");
        Ok(())
    }
}

/// Enable and halt-release lines of both pairs; start sets the pair in motion
#[derive(Debug)]
pub struct FakeIo {
    enabled: Mutex<[bool; 2]>,
    released: Mutex<[bool; 2]>,
    motion: [Arc<AtomicBool>; 2],
}

impl FakeIo {
    pub fn motion(&self, axis: Axis) -> Arc<AtomicBool> {
        self.motion[axis_index(axis)].clone()
    }
}

impl IoBus for FakeIo {
    fn set_enable(&self, axis: Axis, on: bool) -> Result<(), GpioError> {
        self.enabled.lock()[axis_index(axis)] = on;
        if !on {
            self.motion[axis_index(axis)].store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    fn enabled(&self, axis: Axis) -> Result<bool, GpioError> {
        Ok(self.enabled.lock()[axis_index(axis)])
    }

    fn set_halt_release(&self, axis: Axis, on: bool) -> Result<(), GpioError> {
        self.released.lock()[axis_index(axis)] = on;
        if !on {
            self.motion[axis_index(axis)].store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    fn halt_released(&self, axis: Axis) -> Result<bool, GpioError> {
        Ok(self.released.lock()[axis_index(axis)])
    }

    fn start(&self, axis: Axis) -> Result<(), GpioError> {
        self.motion[axis_index(axis)].store(true, Ordering::SeqCst);
        Ok(())
    }

    fn reset(&self, _axis: Axis) -> Result<(), GpioError> {
        Ok(())
    }
}

/// The four drives and the I/O of one undulator
#[derive(Debug, Clone)]
pub struct EpuRig {
    pub gap: [Arc<FakeDrive>; 2],
    pub phase: [Arc<FakeDrive>; 2],
    pub io: Arc<FakeIo>,
}

impl EpuRig {
    /// Both pairs enabled and released, drives showing `A211`
    pub fn released(gap: f64, phase: f64) -> Self {
        let motion = [Arc::new(AtomicBool::new(false)), Arc::new(AtomicBool::new(false))];
        let io = Arc::new(FakeIo {
            enabled: Mutex::new([true, true]),
            released: Mutex::new([true, true]),
            motion: motion.clone(),
        });
        let drive = |address, position, axis: Axis| {
            FakeDrive::new(address, position, "A211", motion[axis_index(axis)].clone())
        };
        Self {
            gap: [drive(1, gap, Axis::Gap), drive(2, gap, Axis::Gap)],
            phase: [drive(3, phase, Axis::Phase), drive(4, phase, Axis::Phase)],
            io,
        }
    }

    pub fn gap_drives(&self) -> [Arc<dyn Drive>; 2] {
        [self.gap[0].clone(), self.gap[1].clone()]
    }

    pub fn phase_drives(&self) -> [Arc<dyn Drive>; 2] {
        [self.phase[0].clone(), self.phase[1].clone()]
    }

    pub fn drive_writes(&self) -> usize {
        self.gap
            .iter()
            .chain(self.phase.iter())
            .map(|d| d.target_writes.lock().len() + d.velocity_writes.lock().len())
            .sum()
    }
}

/// Correctors acting on the orbit through an identity response: the orbit
/// is the kick vector itself.
#[derive(Debug)]
pub struct Machine {
    pub kicks: Mutex<Vec<f64>>,
    pub applied: Mutex<Vec<Vec<Option<f64>>>>,
}

impl Machine {
    pub fn new(kicks: Vec<f64>) -> Arc<Self> {
        Arc::new(Self {
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

#[derive(Debug)]
pub struct MachineOrbit(pub Arc<Machine>);

impl OrbitSource for MachineOrbit {
    fn acquire(&self, _mode: OrbitMode, _timeout: Duration) -> Result<Vec<f64>, SofbError> {
        Ok(self.0.kicks.lock().clone())
    }

    fn connected(&self) -> bool {
        true
    }
}

/// Every change notification of a database, kept for inspection
#[derive(Debug)]
pub struct Updates {
    rx: Receiver<ChannelUpdate>,
    seen: Mutex<Vec<ChannelUpdate>>,
}

impl Updates {
    pub fn new(rx: Receiver<ChannelUpdate>) -> Self {
        Self {
            rx,
            seen: Mutex::new(Vec::new()),
        }
    }

    /// `true` once an update of `name` satisfying `pred` was seen
    pub fn wait_for(&self, name: &str, pred: impl Fn(&ChannelValue) -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let matches = |u: &ChannelUpdate| u.name == name && pred(&u.reading.value);
        if self.seen.lock().iter().any(matches) {
            return true;
        }
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(left) {
                Ok(update) => {
                    let found = matches(&update);
                    self.seen.lock().push(update);
                    if found {
                        return true;
                    }
                }
                Err(_) => return false,
            }
        }
    }

    pub fn log_contains(&self, text: &str, timeout: Duration) -> bool {
        self.wait_for(
            LOG_CHANNEL,
            |v| v.as_str().is_some_and(|s| s.contains(text)),
            timeout,
        )
    }

    /// Messages published on `Log-Mon` so far
    pub fn messages(&self) -> Vec<String> {
        let mut seen = self.seen.lock();
        seen.extend(self.rx.try_iter());
        seen.iter()
            .filter(|u| u.name == LOG_CHANNEL)
            .filter_map(|u| u.reading.value.as_str().map(String::from))
            .collect()
    }
}

pub fn ioc_config(prefix: &str) -> IocConfig {
    IocConfig {
        prefix: prefix.to_string(),
        bind_address: String::from("127.0.0.1:0"),
        scan_interval: 0.02,
        ..Default::default()
    }
}

/// An IOC running on its own thread
pub struct Running {
    pub addr: SocketAddr,
    pub prefix: String,
    pub client: ChannelClient,
    pub context: AppContext,
    pub updates: Updates,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<Result<(), IocError>>,
}

impl Running {
    pub fn start<F>(config: IocConfig, descriptors: Vec<ChannelDescriptor>, factory: F) -> Self
    where
        F: FnOnce(&AppContext) -> Result<Arc<dyn Application>, IocError> + Send + 'static,
    {
        let prefix = config.channel_prefix();
        let ioc = Ioc::new(
            IocInfo {
                name: String::from("scenario IOC"),
                description: String::from("integration test"),
                version: String::from("0.0.0"),
            },
            config,
        );
        let started = ioc.on_started();
        let stop = ioc.stop_flag();
        let (context_tx, context_rx) = unbounded();
        let handle = std::thread::spawn(move || {
            ioc.run(descriptors, move |context| {
                let updates = context.db.subscribe();
                let _ = context_tx.send((context.clone(), updates));
                factory(context)
            })
        });
        let (context, updates) = context_rx.recv_timeout(TIMEOUT).unwrap();
        let addr = started.recv_timeout(TIMEOUT).unwrap();
        let client = ChannelClient::new(vec![addr.to_string()], Duration::from_secs(1)).unwrap();
        Self {
            addr,
            prefix,
            client,
            context,
            updates: Updates::new(updates),
            stop,
            handle,
        }
    }

    pub fn get(&self, name: &str) -> ChannelValue {
        self.client
            .get(&format!("{}{name}", self.prefix), Duration::from_secs(1))
            .unwrap()
            .value
    }

    pub fn get_f64(&self, name: &str) -> f64 {
        self.get(name).as_f64().unwrap()
    }

    pub fn put(&self, name: &str, value: ChannelValue) -> Result<(), BusError> {
        self.client
            .put(&format!("{}{name}", self.prefix), value, Duration::from_secs(1))
    }

    /// Poll `name` until `pred` holds
    pub fn poll(&self, name: &str, pred: impl Fn(&ChannelValue) -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if pred(&self.get(name)) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    pub fn stop(self) -> Result<(), IocError> {
        self.client.shutdown();
        self.stop.store(true, Ordering::SeqCst);
        self.handle.join().unwrap()
    }
}
