//! Proxies to channels served by other processes.
//!
//! A [`ChannelClient`] owns a pool of [`ExternalChannel`] handles and one
//! circuit (TCP connection) per server address. A manager thread connects
//! handles in the background: each server of the address list is asked in
//! order, with exponential back-off between rounds. Values pushed by servers
//! are stored in the handle and forwarded as [`ChannelEvent`]s to whoever
//! subscribed, so application logic never runs on the receive path.
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use fxhash::FxHashMap;
use parking_lot::{Condvar, Mutex};
use std::io::BufReader;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::protocol::{read_frame, write_frame, Request, Response};
use crate::channel::{Alarm, ChannelValue, Reading};
use crate::error::BusError;

const MANAGER_PERIOD: Duration = Duration::from_millis(20);
const MIN_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// How a handle keeps its value fresh
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MonitorMode {
    /// The server pushes every change
    Push,
    /// The manager reads the channel at the given period
    Poll(Duration),
}

/// Notification emitted by a handle
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Value { name: String, reading: Reading },
    Connection { name: String, connected: bool },
}

/// Name-based access to remote channels, without keeping a handle around
pub trait ChannelAccess: Send + Sync {
    fn get(&self, name: &str, timeout: Duration) -> Result<Reading, BusError>;
    fn put(&self, name: &str, value: ChannelValue, timeout: Duration) -> Result<(), BusError>;
}

#[derive(Debug)]
struct Circuit {
    addr: String,
    writer: Mutex<TcpStream>,
    pending: Mutex<FxHashMap<u64, Sender<Response>>>,
    monitors: Mutex<FxHashMap<String, Vec<Weak<HandleInner>>>>,
    next_id: AtomicU64,
    alive: AtomicBool,
}

impl Circuit {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn send(&self, request: &Request) -> Result<(), BusError> {
        if !self.is_alive() {
            return Err(BusError::Disconnected(self.addr.clone()));
        }
        let mut writer = self.writer.lock();
        if let Err(e) = write_frame(&mut *writer, request) {
            self.alive.store(false, Ordering::SeqCst);
            let _ = writer.shutdown(Shutdown::Both);
            return Err(e);
        }
        Ok(())
    }

    /// Send a request and wait for the reply carrying its id
    fn request(
        &self,
        build: impl FnOnce(u64) -> Request,
        timeout: Duration,
        what: &str,
    ) -> Result<Response, BusError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = bounded(1);
        self.pending.lock().insert(id, tx);
        if let Err(e) = self.send(&build(id)) {
            self.pending.lock().remove(&id);
            return Err(e);
        }
        match rx.recv_timeout(timeout) {
            Ok(response) => Ok(response),
            Err(RecvTimeoutError::Timeout) => {
                self.pending.lock().remove(&id);
                Err(BusError::Timeout(what.to_string()))
            }
            Err(RecvTimeoutError::Disconnected) => Err(BusError::Disconnected(what.to_string())),
        }
    }

    /// Fire-and-forget
    fn post(&self, build: impl FnOnce(u64) -> Request) -> Result<(), BusError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.send(&build(id))
    }

    fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let _ = self.writer.lock().shutdown(Shutdown::Both);
    }

    fn register_monitor(&self, name: &str, handle: &Arc<HandleInner>) {
        self.monitors
            .lock()
            .entry(name.to_string())
            .or_default()
            .push(Arc::downgrade(handle));
    }

    fn unregister_monitor(&self, name: &str, handle: &Arc<HandleInner>) {
        let mut monitors = self.monitors.lock();
        if let Some(list) = monitors.get_mut(name) {
            list.retain(|w| w.upgrade().is_some_and(|h| !Arc::ptr_eq(&h, handle)));
            if list.is_empty() {
                monitors.remove(name);
            }
        }
    }
}

#[derive(Debug)]
struct HandleState {
    connected: bool,
    reading: Option<Reading>,
    circuit: Option<Arc<Circuit>>,
    next_attempt: Instant,
    backoff: Duration,
    next_poll: Instant,
}

#[derive(Debug)]
struct HandleInner {
    name: String,
    mode: MonitorMode,
    state: Mutex<HandleState>,
    changed: Condvar,
    listeners: Mutex<Vec<Sender<ChannelEvent>>>,
}

impl HandleInner {
    fn emit(&self, event: ChannelEvent) {
        self.listeners
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn on_connect(&self, circuit: Arc<Circuit>, reading: Reading) {
        {
            let mut state = self.state.lock();
            state.connected = true;
            state.circuit = Some(circuit);
            state.reading = Some(reading.clone());
            state.backoff = MIN_BACKOFF;
            if let MonitorMode::Poll(period) = self.mode {
                state.next_poll = Instant::now() + period;
            }
            self.changed.notify_all();
        }
        spdlog::debug!("Channel {} connected", self.name);
        self.emit(ChannelEvent::Connection {
            name: self.name.clone(),
            connected: true,
        });
        self.emit(ChannelEvent::Value {
            name: self.name.clone(),
            reading,
        });
    }

    fn on_value(&self, reading: Reading) {
        {
            let mut state = self.state.lock();
            if !state.connected {
                return;
            }
            state.reading = Some(reading.clone());
            self.changed.notify_all();
        }
        self.emit(ChannelEvent::Value {
            name: self.name.clone(),
            reading,
        });
    }

    fn on_disconnect(&self) {
        {
            let mut state = self.state.lock();
            if !state.connected {
                return;
            }
            state.connected = false;
            state.circuit = None;
            if let Some(reading) = state.reading.as_mut() {
                reading.alarm = Alarm::disconnected();
            }
            state.backoff = MIN_BACKOFF;
            state.next_attempt = Instant::now();
            self.changed.notify_all();
        }
        spdlog::warn!("Channel {} disconnected", self.name);
        self.emit(ChannelEvent::Connection {
            name: self.name.clone(),
            connected: false,
        });
    }

    fn on_search_failed(&self) {
        let mut state = self.state.lock();
        state.next_attempt = Instant::now() + state.backoff;
        state.backoff = (state.backoff * 2).min(MAX_BACKOFF);
    }

    fn circuit(&self) -> Result<Arc<Circuit>, BusError> {
        self.state
            .lock()
            .circuit
            .clone()
            .filter(|c| c.is_alive())
            .ok_or_else(|| BusError::Disconnected(self.name.clone()))
    }
}

/// Proxy to one remote channel. Cloning yields another view of the same handle.
#[derive(Debug, Clone)]
pub struct ExternalChannel {
    inner: Arc<HandleInner>,
}

impl ExternalChannel {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn connected(&self) -> bool {
        self.inner.state.lock().connected
    }

    /// Last known reading. Never blocks on the network.
    pub fn reading(&self) -> Option<Reading> {
        self.inner.state.lock().reading.clone()
    }

    pub fn value(&self) -> Option<ChannelValue> {
        self.reading().map(|r| r.value)
    }

    /// Last known value, only while connected and not in an invalid alarm state
    pub fn valid_value(&self) -> Option<ChannelValue> {
        let state = self.inner.state.lock();
        match (&state.reading, state.connected) {
            (Some(reading), true) if !reading.alarm.is_invalid() => Some(reading.value.clone()),
            _ => None,
        }
    }

    /// Forward this handle's events to `tx`. The current state is sent first.
    pub fn subscribe(&self, tx: Sender<ChannelEvent>) {
        let snapshot = {
            let state = self.inner.state.lock();
            (state.connected, state.reading.clone())
        };
        if let (true, Some(reading)) = snapshot {
            let _ = tx.send(ChannelEvent::Connection {
                name: self.inner.name.clone(),
                connected: true,
            });
            let _ = tx.send(ChannelEvent::Value {
                name: self.inner.name.clone(),
                reading,
            });
        }
        self.inner.listeners.lock().push(tx);
    }

    /// Fire-and-forget write
    pub fn put(&self, value: ChannelValue) -> Result<(), BusError> {
        let circuit = self.inner.circuit()?;
        let name = self.inner.name.clone();
        circuit.post(|id| Request::Put {
            id,
            name,
            value,
            wait: false,
        })
    }

    /// Write and wait for the server to accept or reject the value
    pub fn put_wait(&self, value: ChannelValue, timeout: Duration) -> Result<(), BusError> {
        let circuit = self.inner.circuit()?;
        put_on(&circuit, &self.inner.name, value, timeout)
    }

    /// Read the channel now, refreshing the cached reading
    pub fn get(&self, timeout: Duration) -> Result<Reading, BusError> {
        let circuit = self.inner.circuit()?;
        match get_on(&circuit, &self.inner.name, timeout)? {
            Some(reading) => {
                self.inner.on_value(reading.clone());
                Ok(reading)
            }
            None => Err(BusError::NotFound(self.inner.name.clone())),
        }
    }

    /// Block until the handle connects; `false` on timeout
    pub fn wait_for_connection(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while !state.connected {
            if self.inner.changed.wait_until(&mut state, deadline).timed_out() {
                return state.connected;
            }
        }
        true
    }
}

fn get_on(circuit: &Circuit, name: &str, timeout: Duration) -> Result<Option<Reading>, BusError> {
    let owned = name.to_string();
    match circuit.request(|id| Request::Get { id, name: owned }, timeout, name)? {
        Response::Value { reading, .. } => Ok(Some(reading)),
        Response::Unknown { .. } => Ok(None),
        Response::Nak { reason, .. } => Err(BusError::Rejected(name.to_string(), reason)),
        _ => Err(BusError::UnexpectedResponse(name.to_string())),
    }
}

fn put_on(circuit: &Circuit, name: &str, value: ChannelValue, timeout: Duration) -> Result<(), BusError> {
    let owned = name.to_string();
    let response = circuit.request(
        |id| Request::Put {
            id,
            name: owned,
            value,
            wait: true,
        },
        timeout,
        name,
    )?;
    match response {
        Response::Ack { .. } => Ok(()),
        Response::Nak { reason, .. } => Err(BusError::Rejected(name.to_string(), reason)),
        Response::Unknown { .. } => Err(BusError::NotFound(name.to_string())),
        _ => Err(BusError::UnexpectedResponse(name.to_string())),
    }
}

#[derive(Debug)]
struct ClientInner {
    addr_list: Vec<String>,
    timeout: Duration,
    circuits: Mutex<FxHashMap<String, Arc<Circuit>>>,
    handles: Mutex<Vec<Weak<HandleInner>>>,
    readers: Mutex<Vec<JoinHandle<()>>>,
    stop: AtomicBool,
}

impl ClientInner {
    /// The live circuit to `addr`, opening it if needed. No lock is held while
    /// connecting.
    fn circuit(self: &Arc<Self>, addr: &str) -> Result<Arc<Circuit>, BusError> {
        if self.stop.load(Ordering::SeqCst) {
            return Err(BusError::ShutDown);
        }
        if let Some(circuit) = self.circuits.lock().get(addr).filter(|c| c.is_alive()) {
            return Ok(circuit.clone());
        }
        let socket_addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| BusError::BadAddress(addr.to_string()))?;
        let stream = TcpStream::connect_timeout(&socket_addr, self.timeout)?;
        stream.set_nodelay(true)?;
        let reader = stream.try_clone()?;
        let circuit = Arc::new(Circuit {
            addr: addr.to_string(),
            writer: Mutex::new(stream),
            pending: Mutex::new(FxHashMap::default()),
            monitors: Mutex::new(FxHashMap::default()),
            next_id: AtomicU64::new(1),
            alive: AtomicBool::new(true),
        });

        let mut circuits = self.circuits.lock();
        if let Some(existing) = circuits.get(addr).filter(|c| c.is_alive()) {
            // Lost the race against another opener
            circuit.close();
            return Ok(existing.clone());
        }
        circuits.insert(addr.to_string(), circuit.clone());
        drop(circuits);

        let weak = Arc::downgrade(self);
        let thread_circuit = circuit.clone();
        let handle = std::thread::Builder::new()
            .name(format!("bus-circuit-{addr}"))
            .spawn(move || circuit_loop(weak, thread_circuit, reader))?;
        let mut readers = self.readers.lock();
        readers.retain(|h| !h.is_finished());
        readers.push(handle);
        spdlog::debug!("Opened circuit to {addr}");
        Ok(circuit)
    }

    fn live_handles(&self) -> Vec<Arc<HandleInner>> {
        let mut handles = self.handles.lock();
        handles.retain(|w| w.strong_count() > 0);
        handles.iter().filter_map(Weak::upgrade).collect()
    }

    /// Ask every server of the address list, in order, for the handle's channel
    fn search(self: &Arc<Self>, handle: &Arc<HandleInner>) {
        for addr in self.addr_list.iter() {
            let circuit = match self.circuit(addr) {
                Ok(circuit) => circuit,
                Err(e) => {
                    spdlog::debug!("Server {addr} unavailable for {}: {e}", handle.name);
                    continue;
                }
            };
            let name = handle.name.clone();
            let result = match handle.mode {
                MonitorMode::Push => {
                    circuit.register_monitor(&name, handle);
                    let monitored = circuit.request(
                        |id| Request::Monitor { id, name },
                        self.timeout,
                        &handle.name,
                    );
                    if !matches!(monitored, Ok(Response::Value { .. })) {
                        circuit.unregister_monitor(&handle.name, handle);
                    }
                    monitored
                }
                MonitorMode::Poll(_) => {
                    circuit.request(|id| Request::Get { id, name }, self.timeout, &handle.name)
                }
            };
            match result {
                Ok(Response::Value { reading, .. }) => {
                    handle.on_connect(circuit, reading);
                    return;
                }
                Ok(Response::Nak { reason, .. }) => {
                    spdlog::warn!("Server {addr} refused {}: {reason}", handle.name);
                }
                Ok(_) => (),
                Err(e) => spdlog::debug!("Search for {} on {addr} failed: {e}", handle.name),
            }
        }
        handle.on_search_failed();
    }

    fn poll(&self, handle: &Arc<HandleInner>, period: Duration) {
        handle.state.lock().next_poll = Instant::now() + period;
        let circuit = match handle.circuit() {
            Ok(circuit) => circuit,
            Err(_) => return,
        };
        match get_on(&circuit, &handle.name, self.timeout) {
            Ok(Some(reading)) => handle.on_value(reading),
            Ok(None) => handle.on_disconnect(),
            Err(BusError::Timeout(_)) => {
                // Surfaces as an alarm; the next poll retries
                let reading = handle.state.lock().reading.clone();
                if let Some(mut reading) = reading {
                    reading.alarm = Alarm::timeout();
                    handle.on_value(reading);
                }
            }
            Err(e) => spdlog::debug!("Poll of {} failed: {e}", handle.name),
        }
    }
}

fn manage(client: Weak<ClientInner>) {
    loop {
        let Some(inner) = client.upgrade() else {
            break;
        };
        if inner.stop.load(Ordering::SeqCst) {
            break;
        }
        let now = Instant::now();
        for handle in inner.live_handles() {
            let (connected, next_attempt, next_poll) = {
                let state = handle.state.lock();
                (state.connected, state.next_attempt, state.next_poll)
            };
            if !connected && now >= next_attempt {
                inner.search(&handle);
            } else if let (true, MonitorMode::Poll(period)) = (connected, handle.mode) {
                if now >= next_poll {
                    inner.poll(&handle, period);
                }
            }
            if inner.stop.load(Ordering::SeqCst) {
                break;
            }
        }
        drop(inner);
        std::thread::sleep(MANAGER_PERIOD);
    }
    spdlog::debug!("Channel client manager stopped");
}

fn circuit_loop(client: Weak<ClientInner>, circuit: Arc<Circuit>, stream: TcpStream) {
    let mut reader = BufReader::new(stream);
    loop {
        let response: Response = match read_frame(&mut reader) {
            Ok(Some(response)) => response,
            Ok(None) => break,
            Err(e) => {
                if circuit.is_alive() {
                    spdlog::debug!("Circuit to {} failed: {e}", circuit.addr);
                }
                break;
            }
        };
        match response {
            Response::Update { name, reading } => {
                let handles: Vec<Arc<HandleInner>> = circuit
                    .monitors
                    .lock()
                    .get(&name)
                    .map(|list| list.iter().filter_map(Weak::upgrade).collect())
                    .unwrap_or_default();
                for handle in handles {
                    handle.on_value(reading.clone());
                }
            }
            Response::Error { id: None, message } => {
                spdlog::warn!("Server {} reported: {message}", circuit.addr)
            }
            other => {
                if let Some(id) = other.id() {
                    if let Some(tx) = circuit.pending.lock().remove(&id) {
                        let _ = tx.send(other);
                    }
                }
            }
        }
    }

    circuit.close();
    circuit.pending.lock().clear();
    if let Some(inner) = client.upgrade() {
        let mut circuits = inner.circuits.lock();
        if circuits
            .get(&circuit.addr)
            .is_some_and(|c| Arc::ptr_eq(c, &circuit))
        {
            circuits.remove(&circuit.addr);
        }
    }
    let monitored: Vec<Arc<HandleInner>> = circuit
        .monitors
        .lock()
        .drain()
        .flat_map(|(_, list)| list.into_iter().filter_map(|w| w.upgrade()))
        .collect();
    for handle in monitored {
        handle.on_disconnect();
    }
    // Polled handles share the circuit without being registered as monitors
    if let Some(inner) = client.upgrade() {
        for handle in inner.live_handles() {
            let uses_circuit = handle
                .state
                .lock()
                .circuit
                .as_ref()
                .is_some_and(|c| Arc::ptr_eq(c, &circuit));
            if uses_circuit {
                handle.on_disconnect();
            }
        }
    }
    spdlog::debug!("Circuit to {} closed", circuit.addr);
}

/// Pool of external channel handles.
///
/// Dropping the client (or calling [`ChannelClient::shutdown`]) stops the
/// manager and closes every circuit.
#[derive(Debug)]
pub struct ChannelClient {
    inner: Arc<ClientInner>,
    manager: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelClient {
    pub fn new(addr_list: Vec<String>, timeout: Duration) -> Result<Self, BusError> {
        let inner = Arc::new(ClientInner {
            addr_list,
            timeout,
            circuits: Mutex::new(FxHashMap::default()),
            handles: Mutex::new(Vec::new()),
            readers: Mutex::new(Vec::new()),
            stop: AtomicBool::new(false),
        });
        let weak = Arc::downgrade(&inner);
        let manager = std::thread::Builder::new()
            .name(String::from("bus-client"))
            .spawn(move || manage(weak))?;
        Ok(Self {
            inner,
            manager: Mutex::new(Some(manager)),
        })
    }

    pub fn addr_list(&self) -> &[String] {
        &self.inner.addr_list
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Create a push-monitored handle. It connects in the background.
    pub fn channel(&self, name: &str) -> ExternalChannel {
        self.create(name, MonitorMode::Push)
    }

    /// Create a handle refreshed by polling at `period`
    pub fn polled_channel(&self, name: &str, period: Duration) -> ExternalChannel {
        self.create(name, MonitorMode::Poll(period))
    }

    fn create(&self, name: &str, mode: MonitorMode) -> ExternalChannel {
        let now = Instant::now();
        let inner = Arc::new(HandleInner {
            name: name.to_string(),
            mode,
            state: Mutex::new(HandleState {
                connected: false,
                reading: None,
                circuit: None,
                next_attempt: now,
                backoff: MIN_BACKOFF,
                next_poll: now,
            }),
            changed: Condvar::new(),
            listeners: Mutex::new(Vec::new()),
        });
        self.inner.handles.lock().push(Arc::downgrade(&inner));
        ExternalChannel { inner }
    }

    /// Number of live handles in the pool
    pub fn handle_count(&self) -> usize {
        self.inner.live_handles().len()
    }

    pub fn shutdown(&self) {
        if self.inner.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(manager) = self.manager.lock().take() {
            if manager.join().is_err() {
                spdlog::error!("Channel client manager panicked");
            }
        }
        let circuits: Vec<Arc<Circuit>> = self.inner.circuits.lock().drain().map(|(_, c)| c).collect();
        for circuit in circuits {
            circuit.close();
        }
        let readers: Vec<JoinHandle<()>> = self.inner.readers.lock().drain(..).collect();
        for reader in readers {
            if reader.join().is_err() {
                spdlog::error!("A bus circuit thread panicked");
            }
        }
    }
}

impl Drop for ChannelClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ChannelAccess for ChannelClient {
    fn get(&self, name: &str, timeout: Duration) -> Result<Reading, BusError> {
        for addr in self.inner.addr_list.iter() {
            let circuit = match self.inner.circuit(addr) {
                Ok(circuit) => circuit,
                Err(BusError::ShutDown) => return Err(BusError::ShutDown),
                Err(_) => continue,
            };
            if let Some(reading) = get_on(&circuit, name, timeout)? {
                return Ok(reading);
            }
        }
        Err(BusError::NotFound(name.to_string()))
    }

    fn put(&self, name: &str, value: ChannelValue, timeout: Duration) -> Result<(), BusError> {
        for addr in self.inner.addr_list.iter() {
            let circuit = match self.inner.circuit(addr) {
                Ok(circuit) => circuit,
                Err(BusError::ShutDown) => return Err(BusError::ShutDown),
                Err(_) => continue,
            };
            match put_on(&circuit, name, value.clone(), timeout) {
                Err(BusError::NotFound(_)) => continue,
                other => return other,
            }
        }
        Err(BusError::NotFound(name.to_string()))
    }
}

//Unit tests
#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::server::{ServerHandle, TransportServer};
    use crate::channel::{ChannelDescriptor, Condition};
    use crate::database::Database;
    use crate::driver::{Application, Driver};
    use crossbeam_channel::unbounded;

    struct Accepting;

    impl Application for Accepting {
        fn write(&self, _name: &str, _value: &ChannelValue) -> bool {
            true
        }
    }

    fn serve(prefix: &str) -> (ServerHandle, Arc<Database>) {
        let db = Arc::new(
            Database::create(vec![
                ChannelDescriptor::float("Current-SP", 0.0).limits(-10.0, 10.0),
                ChannelDescriptor::float("Current-RB", 0.0),
                ChannelDescriptor::float("Current-Mon", 0.0),
            ])
            .unwrap(),
        );
        let driver = Arc::new(Driver::new(db.clone(), Arc::new(Accepting)));
        let server = TransportServer::bind("127.0.0.1:0", prefix, driver).unwrap();
        (server.spawn(Duration::from_millis(100)).unwrap(), db)
    }

    #[test]
    fn test_handle_connects_and_follows_changes() {
        let (server, db) = serve("PS:");
        let client = ChannelClient::new(
            vec![server.local_addr().to_string()],
            Duration::from_millis(500),
        )
        .unwrap();
        let handle = client.channel("PS:Current-Mon");
        assert!(handle.wait_for_connection(Duration::from_secs(2)));
        let (tx, rx) = unbounded();
        handle.subscribe(tx);
        db.set_value("Current-Mon", ChannelValue::Float(3.5)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while handle.value() != Some(ChannelValue::Float(3.5)) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(handle.value(), Some(ChannelValue::Float(3.5)));
        assert!(rx
            .try_iter()
            .any(|e| matches!(e, ChannelEvent::Connection { connected: true, .. })));
        client.shutdown();
        server.stop();
    }

    #[test]
    fn test_address_list_is_searched_in_order() {
        let (first, _) = serve("A:");
        let (second, _) = serve("B:");
        let client = ChannelClient::new(
            vec![first.local_addr().to_string(), second.local_addr().to_string()],
            Duration::from_millis(500),
        )
        .unwrap();
        let reading = client.get("B:Current-Mon", Duration::from_millis(500)).unwrap();
        assert_eq!(reading.value, ChannelValue::Float(0.0));
        client
            .put("B:Current-SP", ChannelValue::Float(2.0), Duration::from_millis(500))
            .unwrap();
        assert!(matches!(
            client.put("B:Current-SP", ChannelValue::Float(20.0), Duration::from_millis(500)),
            Err(BusError::Rejected(_, _))
        ));
        assert!(matches!(
            client.get("C:Current-Mon", Duration::from_millis(500)),
            Err(BusError::NotFound(_))
        ));
        drop(client);
        first.stop();
        second.stop();
    }

    #[test]
    fn test_disconnect_invalidates_and_reconnects() {
        let (server, _db) = serve("PS:");
        let addr = server.local_addr();
        let client = ChannelClient::new(vec![addr.to_string()], Duration::from_millis(300)).unwrap();
        let handle = client.channel("PS:Current-Mon");
        assert!(handle.wait_for_connection(Duration::from_secs(2)));
        server.stop();

        let deadline = Instant::now() + Duration::from_secs(2);
        while handle.connected() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!handle.connected());
        let reading = handle.reading().unwrap();
        assert_eq!(reading.alarm.condition, Condition::Disconnected);
        assert_eq!(handle.valid_value(), None);
        client.shutdown();
    }

    #[test]
    fn test_unreachable_server_does_not_connect() {
        let client = ChannelClient::new(
            vec![String::from("127.0.0.1:1")],
            Duration::from_millis(100),
        )
        .unwrap();
        let handle = client.channel("PS:Current-Mon");
        assert!(!handle.wait_for_connection(Duration::from_millis(300)));
        assert!(handle.put(ChannelValue::Float(1.0)).is_err());
    }
}
