use crossbeam_channel::RecvTimeoutError;
use fxhash::FxHashSet;
use parking_lot::Mutex;
use std::io::{BufReader, ErrorKind};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::protocol::{read_frame, write_frame, Request, Response};
use crate::driver::Driver;
use crate::error::BusError;

const ACCEPT_POLL: Duration = Duration::from_millis(20);

/// One subscriber connection
#[derive(Debug)]
struct Session {
    id: u64,
    peer: SocketAddr,
    writer: Mutex<TcpStream>,
    monitors: Mutex<FxHashSet<String>>,
    alive: AtomicBool,
}

impl Session {
    fn send(&self, response: &Response) {
        if !self.alive.load(Ordering::SeqCst) {
            return;
        }
        let mut writer = self.writer.lock();
        if let Err(e) = write_frame(&mut *writer, response) {
            spdlog::debug!("Session {} ({}) write failed: {e}", self.id, self.peer);
            self.close(&writer);
        }
    }

    fn close(&self, stream: &TcpStream) {
        self.alive.store(false, Ordering::SeqCst);
        let _ = stream.shutdown(Shutdown::Both);
    }

    fn is_monitoring(&self, name: &str) -> bool {
        self.monitors.lock().contains(name)
    }
}

/// State shared by the accept, notifier and session threads
#[derive(Debug)]
struct Shared {
    prefix: String,
    driver: Arc<Driver>,
    sessions: Mutex<Vec<Arc<Session>>>,
    session_threads: Mutex<Vec<JoinHandle<()>>>,
    stop: AtomicBool,
    next_session: AtomicU64,
}

impl Shared {
    /// Map a full channel name to the database's local name
    fn local_name<'a>(&self, name: &'a str) -> Option<&'a str> {
        name.strip_prefix(self.prefix.as_str())
            .filter(|local| self.driver.database().contains(local))
    }
}

/// Publishes a [`Driver`]'s database on the bus.
///
/// Names on the wire carry the process prefix. Monitors are pushed on every
/// database change and refreshed at least once per scan period.
#[derive(Debug)]
pub struct TransportServer {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl TransportServer {
    pub fn bind(address: &str, prefix: &str, driver: Arc<Driver>) -> Result<Self, BusError> {
        let addr = address
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| BusError::BadAddress(address.to_string()))?;
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                prefix: prefix.to_string(),
                driver,
                sessions: Mutex::new(Vec::new()),
                session_threads: Mutex::new(Vec::new()),
                stop: AtomicBool::new(false),
                next_session: AtomicU64::new(0),
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, BusError> {
        Ok(self.listener.local_addr()?)
    }

    /// Start the accept and notifier threads
    pub fn spawn(self, scan_period: Duration) -> Result<ServerHandle, BusError> {
        let local_addr = self.local_addr()?;
        let updates = self.shared.driver.database().subscribe();

        let shared = self.shared.clone();
        let notifier = std::thread::Builder::new()
            .name(String::from("bus-notifier"))
            .spawn(move || notify_loop(shared, updates, scan_period))?;

        let shared = self.shared.clone();
        let listener = self.listener;
        let acceptor = std::thread::Builder::new()
            .name(String::from("bus-server"))
            .spawn(move || accept_loop(shared, listener))?;

        spdlog::info!("Transport server listening on {local_addr}");
        Ok(ServerHandle {
            local_addr,
            shared: self.shared,
            threads: vec![acceptor, notifier],
        })
    }
}

/// Handle to a running [`TransportServer`]
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn session_count(&self) -> usize {
        self.shared.sessions.lock().len()
    }

    /// Close every session and join the server threads
    pub fn stop(self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        for session in self.shared.sessions.lock().iter() {
            let writer = session.writer.lock();
            session.close(&writer);
        }
        for handle in self.threads {
            if handle.join().is_err() {
                spdlog::error!("A transport server thread panicked");
            }
        }
        let session_threads: Vec<JoinHandle<()>> =
            self.shared.session_threads.lock().drain(..).collect();
        for handle in session_threads {
            if handle.join().is_err() {
                spdlog::error!("A bus session thread panicked");
            }
        }
        spdlog::info!("Transport server stopped");
    }
}

fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    while !shared.stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = open_session(&shared, stream, peer) {
                    spdlog::warn!("Could not open bus session for {peer}: {e}");
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => std::thread::sleep(ACCEPT_POLL),
            Err(e) => {
                spdlog::warn!("Bus accept failed: {e}");
                std::thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

fn open_session(shared: &Arc<Shared>, stream: TcpStream, peer: SocketAddr) -> Result<(), BusError> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    let reader = stream.try_clone()?;
    let session = Arc::new(Session {
        id: shared.next_session.fetch_add(1, Ordering::Relaxed),
        peer,
        writer: Mutex::new(stream),
        monitors: Mutex::new(FxHashSet::default()),
        alive: AtomicBool::new(true),
    });
    spdlog::debug!("Bus session {} opened by {peer}", session.id);
    shared.sessions.lock().push(session.clone());

    let thread_shared = shared.clone();
    let handle = std::thread::Builder::new()
        .name(format!("bus-session-{}", session.id))
        .spawn(move || session_loop(thread_shared, session, reader))?;
    let mut threads = shared.session_threads.lock();
    threads.retain(|h| !h.is_finished());
    threads.push(handle);
    Ok(())
}

fn session_loop(shared: Arc<Shared>, session: Arc<Session>, stream: TcpStream) {
    let mut reader = BufReader::new(stream);
    loop {
        let request: Request = match read_frame(&mut reader) {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(BusError::ParsingError(e)) => {
                session.send(&Response::Error {
                    id: None,
                    message: format!("Malformed request: {e}"),
                });
                continue;
            }
            Err(e) => {
                if !shared.stop.load(Ordering::SeqCst) {
                    spdlog::debug!("Bus session {} read failed: {e}", session.id);
                }
                break;
            }
        };
        if let Some(response) = handle_request(&shared, &session, request) {
            session.send(&response);
        }
        if !session.alive.load(Ordering::SeqCst) {
            break;
        }
    }
    session.alive.store(false, Ordering::SeqCst);
    shared.sessions.lock().retain(|s| s.id != session.id);
    spdlog::debug!("Bus session {} closed", session.id);
}

fn unknown(id: u64, name: String) -> Response {
    Response::Unknown { id, name }
}

fn handle_request(shared: &Shared, session: &Session, request: Request) -> Option<Response> {
    let driver = &shared.driver;
    match request {
        Request::Get { id, name } => {
            let Some(local) = shared.local_name(&name) else {
                return Some(unknown(id, name));
            };
            Some(match driver.read(local) {
                Ok(reading) => Response::Value { id, name, reading },
                Err(e) => Response::Nak {
                    id,
                    name,
                    reason: e.to_string(),
                },
            })
        }
        Request::Put {
            id,
            name,
            value,
            wait,
        } => {
            let Some(local) = shared.local_name(&name) else {
                return Some(unknown(id, name));
            };
            let response = match driver.try_write(local, Some(value)) {
                Ok(()) => Response::Ack { id, name },
                Err(rejection) => Response::Nak {
                    id,
                    name,
                    reason: rejection.to_string(),
                },
            };
            wait.then_some(response)
        }
        Request::Monitor { id, name } => {
            let Some(local) = shared.local_name(&name) else {
                return Some(unknown(id, name));
            };
            match driver.read(local) {
                Ok(reading) => {
                    session.monitors.lock().insert(local.to_string());
                    Some(Response::Value { id, name, reading })
                }
                Err(e) => Some(Response::Nak {
                    id,
                    name,
                    reason: e.to_string(),
                }),
            }
        }
        Request::ClearMonitor { name } => {
            if let Some(local) = shared.local_name(&name) {
                session.monitors.lock().remove(local);
            }
            None
        }
        Request::List { id, filter } => {
            let names = driver
                .database()
                .list(None)
                .into_iter()
                .map(|local| format!("{}{local}", shared.prefix))
                .filter(|full| filter.as_deref().map_or(true, |f| full.contains(f)))
                .collect();
            Some(Response::Names { id, names })
        }
        Request::Info { id, name } => {
            let Some(local) = shared.local_name(&name) else {
                return Some(unknown(id, name));
            };
            match driver.database().descriptor(local) {
                Ok(desc) => {
                    let mut descriptor = desc.clone();
                    descriptor.name = name;
                    Some(Response::Info { id, descriptor })
                }
                Err(e) => Some(Response::Error {
                    id: Some(id),
                    message: e.to_string(),
                }),
            }
        }
    }
}

fn notify_loop(
    shared: Arc<Shared>,
    updates: crossbeam_channel::Receiver<crate::database::ChannelUpdate>,
    scan_period: Duration,
) {
    let mut last_refresh = Instant::now();
    while !shared.stop.load(Ordering::SeqCst) {
        match updates.recv_timeout(scan_period.min(Duration::from_millis(100))) {
            Ok(update) => {
                let full = format!("{}{}", shared.prefix, update.name);
                let sessions: Vec<Arc<Session>> = shared.sessions.lock().clone();
                for session in sessions.iter().filter(|s| s.is_monitoring(&update.name)) {
                    session.send(&Response::Update {
                        name: full.clone(),
                        reading: update.reading.clone(),
                    });
                }
            }
            Err(RecvTimeoutError::Timeout) => (),
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if last_refresh.elapsed() >= scan_period {
            last_refresh = Instant::now();
            refresh_monitors(&shared);
        }
    }
}

// Periodic push of every monitored channel, so that a slow subscriber still
// converges on the current state.
fn refresh_monitors(shared: &Shared) {
    let sessions: Vec<Arc<Session>> = shared.sessions.lock().clone();
    let db = shared.driver.database();
    for session in sessions {
        let names: Vec<String> = session.monitors.lock().iter().cloned().collect();
        for local in names {
            if let Ok(reading) = db.reading(&local) {
                session.send(&Response::Update {
                    name: format!("{}{local}", shared.prefix),
                    reading,
                });
            }
        }
    }
}
