//! Process lifecycle shared by every IOC binary.
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use super::access::AccessRules;
use super::autosave::Autosave;
use super::bus::client::{ChannelAccess, ChannelClient};
use super::bus::server::TransportServer;
use super::channel::ChannelDescriptor;
use super::config::IocConfig;
use super::database::Database;
use super::driver::{Application, Driver};
use super::error::IocError;
use super::lock::InstanceLock;
use super::logging::{flush_logging, LogChannel, LOG_CHANNEL};
use super::queue::WorkQueue;

/// Constant channel carrying the version of the running IOC
pub const VERSION_CHANNEL: &str = "Version-Cte";

/// What the banner says about an IOC
#[derive(Debug, Clone, PartialEq)]
pub struct IocInfo {
    pub name: String,
    pub description: String,
    pub version: String,
}

/// Everything an application needs from the runtime when it is built
#[derive(Debug, Clone)]
pub struct AppContext {
    pub db: Arc<Database>,
    pub queue: Arc<WorkQueue>,
    pub log: LogChannel,
    /// Client for the external channels the application depends on
    pub client: Arc<ChannelClient>,
    pub config: IocConfig,
    pub stop: Arc<AtomicBool>,
}

/// One IOC process: builds the database, guards against a second instance,
/// serves the channels and runs the main loop until stopped.
#[derive(Debug)]
pub struct Ioc {
    info: IocInfo,
    config: IocConfig,
    stop: Arc<AtomicBool>,
    started: Mutex<Vec<Sender<SocketAddr>>>,
}

impl Ioc {
    pub fn new(info: IocInfo, config: IocConfig) -> Self {
        Self {
            info,
            config,
            stop: Arc::new(AtomicBool::new(false)),
            started: Mutex::new(Vec::new()),
        }
    }

    /// Raising this flag ends the main loop
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// SIGINT and SIGTERM raise the stop flag. Can be installed once per process.
    pub fn install_signal_handlers(&self) -> Result<(), IocError> {
        let stop = self.stop.clone();
        ctrlc::set_handler(move || {
            stop.store(true, Ordering::SeqCst);
        })?;
        Ok(())
    }

    /// Receives the server address once the IOC serves its channels
    pub fn on_started(&self) -> Receiver<SocketAddr> {
        let (tx, rx) = unbounded();
        self.started.lock().push(tx);
        rx
    }

    fn banner(&self, prefix: &str, channels: usize) {
        spdlog::info!("==================================================");
        spdlog::info!("{} - {}", self.info.name, self.info.description);
        spdlog::info!("Version: {}", self.info.version);
        spdlog::info!("Prefix: {prefix}");
        spdlog::info!("Channels: {channels}");
        spdlog::info!("==================================================");
    }

    // The lock covers this host; a server of addr_list answering for our
    // first channel means an instance runs elsewhere.
    fn check_singleton(&self, prefix: &str, first: &str) -> Result<InstanceLock, IocError> {
        let lock = match InstanceLock::acquire(&self.config.lock_dir, prefix) {
            Ok(lock) => lock,
            Err(IocError::AlreadyRunning) => {
                spdlog::error!(
                    "Another instance of this IOC is already running (lock {} is held)",
                    self.config.lock_dir.join(crate::lock::lock_file_name(prefix)).display()
                );
                return Err(IocError::AlreadyRunning);
            }
            Err(e) => return Err(e),
        };
        if self.config.addr_list.is_empty() {
            return Ok(lock);
        }
        let probe = ChannelClient::new(self.config.addr_list.clone(), self.config.probe_period())?;
        let name = format!("{prefix}{first}");
        let found = probe.get(&name, self.config.probe_period()).is_ok();
        probe.shutdown();
        if found {
            spdlog::error!("Another instance of this IOC is already running ({name} answered)");
            return Err(IocError::AlreadyRunning);
        }
        Ok(lock)
    }

    /// Run the IOC until the stop flag is raised.
    ///
    /// `factory` builds the application once the database, work queue and
    /// external channel client exist. An error from it is fatal.
    pub fn run<F>(&self, descriptors: Vec<ChannelDescriptor>, factory: F) -> Result<(), IocError>
    where
        F: FnOnce(&AppContext) -> Result<Arc<dyn Application>, IocError>,
    {
        self.config.validate()?;
        let prefix = self.config.channel_prefix();
        let first = descriptors
            .first()
            .map(|d| d.name.clone())
            .unwrap_or_else(|| VERSION_CHANNEL.to_string());

        let mut descriptors = descriptors;
        descriptors.push(ChannelDescriptor::string(VERSION_CHANNEL, &self.info.version));
        if !descriptors.iter().any(|d| d.name == LOG_CHANNEL) {
            descriptors.push(ChannelDescriptor::string(LOG_CHANNEL, ""));
        }
        let db = Arc::new(Database::create(descriptors)?);

        let _instance = self.check_singleton(&prefix, &first)?;
        self.banner(&prefix, db.len());

        if let Some(path) = &self.config.access_rules {
            db.set_access_rules(AccessRules::read_rules_file(path)?)?;
            spdlog::info!("Access rules loaded from {path:?}");
        }

        let log = LogChannel::new(db.clone());
        let queue = Arc::new(WorkQueue::new(self.config.queue_capacity, log.clone()));
        queue.start()?;
        let client = Arc::new(ChannelClient::new(
            self.config.addr_list.clone(),
            self.config.timeout(),
        )?);
        let context = AppContext {
            db: db.clone(),
            queue: queue.clone(),
            log: log.clone(),
            client: client.clone(),
            config: self.config.clone(),
            stop: self.stop.clone(),
        };
        let app = match factory(&context) {
            Ok(app) => app,
            Err(e) => {
                queue.shutdown();
                client.shutdown();
                return Err(e);
            }
        };
        let driver = Arc::new(Driver::new(db.clone(), app));

        let server = TransportServer::bind(&self.config.bind_address, &prefix, driver.clone())?
            .spawn(self.config.scan_period())?;
        let local_addr = server.local_addr();
        log.info(&format!("{} started, serving on {local_addr}", self.info.name));
        for tx in self.started.lock().drain(..) {
            let _ = tx.send(local_addr);
        }

        let (autosave_client, autosave_threads) = self.start_autosave(&prefix, local_addr, &log)?;

        while !self.stop.load(Ordering::SeqCst) {
            driver.process(self.config.scan_period());
        }

        log.info(&format!("{} shutting down", self.info.name));
        driver.shutdown();
        for handle in autosave_threads {
            if handle.join().is_err() {
                spdlog::error!("An autosave thread panicked");
            }
        }
        queue.shutdown();
        server.stop();
        if let Some(autosave_client) = autosave_client {
            autosave_client.shutdown();
        }
        client.shutdown();
        flush_logging();
        Ok(())
    }

    // Save/restore goes through our own server, so restored values are
    // validated like any client write.
    fn start_autosave(
        &self,
        prefix: &str,
        local_addr: SocketAddr,
        log: &LogChannel,
    ) -> Result<(Option<Arc<ChannelClient>>, Vec<JoinHandle<()>>), IocError> {
        let settings = &self.config.autosave;
        if !settings.enabled {
            return Ok((None, Vec::new()));
        }
        let ip = if local_addr.ip().is_unspecified() {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            local_addr.ip()
        };
        let own = SocketAddr::new(ip, local_addr.port());
        let client = Arc::new(ChannelClient::new(
            vec![own.to_string()],
            crate::config::seconds(settings.timeout),
        )?);
        let access: Arc<dyn ChannelAccess> = client.clone();
        let autosave = Arc::new(Autosave::new(settings.clone(), prefix, access, log.clone()));
        spdlog::info!(
            "Autosave enabled: {} every {}s into {:?}",
            settings.request_file.display(),
            settings.period,
            settings.dir
        );
        let threads = autosave.spawn(self.stop.clone())?;
        Ok((Some(client), threads))
    }
}

//Unit tests
#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelValue;
    use std::time::Duration;

    struct Idle;

    impl Application for Idle {
        fn write(&self, _name: &str, _value: &ChannelValue) -> bool {
            true
        }
    }

    fn config(prefix: &str) -> IocConfig {
        IocConfig {
            prefix: prefix.to_string(),
            bind_address: String::from("127.0.0.1:0"),
            scan_interval: 0.02,
            ..Default::default()
        }
    }

    fn info() -> IocInfo {
        IocInfo {
            name: String::from("test-ioc"),
            description: String::from("lifecycle test"),
            version: String::from("1.2.3"),
        }
    }

    #[test]
    fn test_run_serves_version_and_stops() {
        let ioc = Arc::new(Ioc::new(info(), config("TEST-IOC:")));
        let started = ioc.on_started();
        let stop = ioc.stop_flag();
        let runner = {
            let ioc = ioc.clone();
            std::thread::spawn(move || {
                ioc.run(vec![ChannelDescriptor::float("Value-SP", 0.0)], |_| {
                    Ok(Arc::new(Idle) as Arc<dyn Application>)
                })
            })
        };
        let addr = started.recv_timeout(Duration::from_secs(5)).unwrap();
        let client = ChannelClient::new(vec![addr.to_string()], Duration::from_secs(1)).unwrap();
        let version = client
            .get("TEST-IOC:Version-Cte", Duration::from_secs(1))
            .unwrap();
        assert_eq!(version.value, ChannelValue::Str(String::from("1.2.3")));
        client.shutdown();

        stop.store(true, Ordering::SeqCst);
        assert!(runner.join().unwrap().is_ok());
    }

    #[test]
    fn test_failing_factory_is_fatal() {
        let ioc = Ioc::new(info(), config("TEST-FACTORY:"));
        let result = ioc.run(vec![ChannelDescriptor::float("Value-SP", 0.0)], |_| {
            Err(IocError::AlreadyRunning)
        });
        assert!(result.is_err());
    }
}
