//! # sirius_sofb_ioc
//!
//! Part of the sirius_ioc crate family. Runs the slow orbit feedback of the storage ring
//! (`SI`) or of the booster (`BO`):
//!
//! ```bash
//! sirius_sofb_ioc -c sofb.yml new
//! sirius_sofb_ioc -c sofb.yml SI
//! ```
use clap::{Arg, ArgAction, ArgMatches, Command};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use libsirius_ioc::config::{read_yaml_file, write_yaml_file, IocConfig};
use libsirius_ioc::driver::Application;
use libsirius_ioc::error::{ConfigError, IocError};
use libsirius_ioc::ioc::{Ioc, IocInfo};
use libsirius_ioc::logging::{flush_logging, init_logging};
use libsirius_ioc::sofb::app::{database, SofbApp};
use libsirius_ioc::sofb::{Accelerator, SofbConfig};

const IOC_NAME: &str = "sirius_sofb_ioc";

/// The configuration file of the SOFB IOC
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct Config {
    ioc: IocConfig,
    sofb: SofbConfig,
}

fn make_template_config(path: &Path) -> Result<(), ConfigError> {
    let mut config = Config::default();
    config.ioc.prefix = Accelerator::SI.prefix();
    config.ioc.autosave.request_file = PathBuf::from("sofb.req");
    config.ioc.autosave.basename = String::from("sofb");
    write_yaml_file(path, &config)
}

fn cli() -> Command {
    Command::new(IOC_NAME)
        .about("Sirius slow orbit feedback IOC")
        .arg_required_else_help(true)
        .subcommand(Command::new("new").about("Make a template configuration yaml file"))
        .arg(
            Arg::new("accelerator")
                .value_parser(["SI", "BO", "si", "bo"])
                .help("Accelerator to correct"),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .required(true)
                .help("Path to the configuration file"),
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

    let accelerator = matches
        .get_one::<String>("accelerator")
        .and_then(|name| Accelerator::parse(name))
        .ok_or_else(|| ConfigError::Invalid(String::from("an accelerator (SI or BO) is required")))?;

    let mut config: Config = read_yaml_file(&config_path)?;
    config.ioc.apply_environment();
    if let Some(dir) = matches.get_one::<String>("autosave-dir") {
        config.ioc.autosave.dir = PathBuf::from(dir);
        config.ioc.autosave.enabled = true;
    }
    if let Some(request) = matches.get_one::<String>("request-file") {
        config.ioc.autosave.request_file = PathBuf::from(request);
    }
    if config.ioc.prefix.is_empty() {
        config.ioc.prefix = accelerator.prefix();
    }

    let debug = matches.get_flag("debug");
    init_logging(&config.ioc.log_dir, IOC_NAME, debug)?;
    spdlog::info!("Config successfully loaded from {}.", config_path.display());
    spdlog::info!("Accelerator: {accelerator}");
    spdlog::info!("Loop frequency: {} Hz", config.sofb.loop_frequency);
    spdlog::info!("Autosave: {}", config.ioc.autosave.enabled);

    let ioc = Ioc::new(
        IocInfo {
            name: format!("{accelerator} SOFB IOC"),
            description: String::from("Slow orbit feedback"),
            version: String::from(env!("CARGO_PKG_VERSION")),
        },
        config.ioc.clone(),
    );
    ioc.install_signal_handlers()?;

    let sofb = config.sofb;
    ioc.run(database(accelerator.geometry(), &sofb), move |context| {
        let app = SofbApp::connect(context, sofb, accelerator)?;
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
