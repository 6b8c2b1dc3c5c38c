//! # sirius_epu_ioc
//!
//! Part of the sirius_ioc crate family.
//!
//! The IOC of the EPU50 insertion devices: serves the gap and phase channels and moves the
//! two drive pairs of one undulator.
//!
//! ## Install
//!
//! Use `cargo install --path ./sirius_epu_ioc` from the top level repository.
//!
//! ## Use
//!
//! Make a template configuration with
//!
//! ```bash
//! sirius_epu_ioc -c epu.yml new
//! ```
//!
//! edit the `epu.devices` list to point at the drive serial bridge and the GPIO of each
//! undulator, then run
//!
//! ```bash
//! sirius_epu_ioc -c epu.yml --device EPU50
//! ```
//!
//! `--autosave-dir` turns save/restore on; `--debug` enables verbose logging.
use clap::{Arg, ArgAction, ArgMatches, Command};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use libsirius_ioc::config::{read_yaml_file, write_yaml_file, IocConfig};
use libsirius_ioc::driver::Application;
use libsirius_ioc::epu::app::{database, EpuApp};
use libsirius_ioc::epu::{EpuConfig, EpuDevice};
use libsirius_ioc::error::{ConfigError, IocError};
use libsirius_ioc::ioc::{Ioc, IocInfo};
use libsirius_ioc::logging::{flush_logging, init_logging};

const IOC_NAME: &str = "sirius_epu_ioc";

/// The configuration file of the EPU IOC
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct Config {
    ioc: IocConfig,
    epu: EpuConfig,
}

fn make_template_config(path: &Path) -> Result<(), ConfigError> {
    let mut config = Config::default();
    config.ioc.prefix = EpuDevice::default().prefix;
    config.ioc.autosave.request_file = PathBuf::from("epu50.req");
    config.ioc.autosave.basename = String::from("epu50");
    write_yaml_file(path, &config)
}

fn cli() -> Command {
    Command::new(IOC_NAME)
        .about("Sirius EPU50 insertion device IOC")
        .arg_required_else_help(true)
        .subcommand(Command::new("new").about("Make a template configuration yaml file"))
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .required(true)
                .help("Path to the configuration file"),
        )
        .arg(
            Arg::new("device")
                .long("device")
                .help("Name of the EPU to serve; the first configured one by default"),
        )
        .arg(
            Arg::new("debug")
                .long("debug")
                .action(ArgAction::SetTrue)
                .help("Enable verbose logging"),
        )
        .arg(
            Arg::new("autosave-dir")
                .long("autosave-dir")
                .help("Directory of the save files; enables autosave"),
        )
        .arg(
            Arg::new("request-file")
                .long("request-file")
                .help("File listing the channels to save"),
        )
}

fn run(matches: &ArgMatches) -> Result<(), IocError> {
    let config_path = PathBuf::from(
        matches
            .get_one::<String>("config")
            .ok_or_else(|| ConfigError::Invalid(String::from("a configuration path is required")))?,
    );

    if let Some(("new", _)) = matches.subcommand() {
        spdlog::info!("Making a template config at {}...", config_path.display());
        make_template_config(&config_path)?;
        spdlog::info!("Done.");
        return Ok(());
    }

    let mut config: Config = read_yaml_file(&config_path)?;
    config.ioc.apply_environment();
    if let Some(dir) = matches.get_one::<String>("autosave-dir") {
        config.ioc.autosave.dir = PathBuf::from(dir);
        config.ioc.autosave.enabled = true;
    }
    if let Some(request) = matches.get_one::<String>("request-file") {
        config.ioc.autosave.request_file = PathBuf::from(request);
    }
    let requested = matches.get_one::<String>("device").map(|s| s.as_str());
    let device = config.epu.device(requested).cloned().ok_or_else(|| {
        ConfigError::Invalid(format!(
            "no EPU device named {}",
            requested.unwrap_or("<first>")
        ))
    })?;
    if config.ioc.prefix.is_empty() {
        config.ioc.prefix = device.prefix.clone();
    }

    let debug = matches.get_flag("debug");
    init_logging(&config.ioc.log_dir, IOC_NAME, debug)?;
    spdlog::info!("Config successfully loaded from {}.", config_path.display());
    spdlog::info!("Device: {} (drives on {}, GPIO on {})", device.name, device.drive_line, device.gpio_address);
    spdlog::info!("Autosave: {}", config.ioc.autosave.enabled);

    let ioc = Ioc::new(
        IocInfo {
            name: format!("{} IOC", device.name),
            description: String::from("EPU gap and phase motion controller"),
            version: String::from(env!("CARGO_PKG_VERSION")),
        },
        config.ioc.clone(),
    );
    ioc.install_signal_handlers()?;

    let epu = config.epu;
    ioc.run(database(&epu), move |context| {
        let app = EpuApp::connect(context, epu, &device)?;
        Ok(Arc::new(app) as Arc<dyn Application>)
    })
}

fn main() -> ExitCode {
    let matches = cli().get_matches();
    match run(&matches) {
        Ok(()) => {
            flush_logging();
            ExitCode::SUCCESS
        }
        Err(e) => {
            spdlog::error!("{e}");
            flush_logging();
            ExitCode::FAILURE
        }
    }
}
