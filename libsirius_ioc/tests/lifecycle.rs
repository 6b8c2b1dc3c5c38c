mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{ioc_config, Running, TIMEOUT};
use libsirius_ioc::channel::{ChannelDescriptor, ChannelValue};
use libsirius_ioc::config::IocConfig;
use libsirius_ioc::driver::Application;
use libsirius_ioc::error::IocError;
use libsirius_ioc::ioc::{AppContext, Ioc, IocInfo};

struct Accepting;

impl Application for Accepting {
    fn write(&self, _name: &str, _value: &ChannelValue) -> bool {
        true
    }
}

fn descriptors() -> Vec<ChannelDescriptor> {
    vec![
        ChannelDescriptor::float("Value-SP", 0.0).limits(-10.0, 10.0),
        ChannelDescriptor::float("Value-RB", 0.0),
    ]
}

fn second_instance(config: IocConfig) -> Ioc {
    Ioc::new(
        IocInfo {
            name: String::from("second"),
            description: String::from("duplicate"),
            version: String::from("0.0.0"),
        },
        config,
    )
}

fn accepting(_: &AppContext) -> Result<Arc<dyn Application>, IocError> {
    Ok(Arc::new(Accepting) as Arc<dyn Application>)
}

#[test]
fn test_second_instance_refuses_to_start() {
    let prefix = "TS-Glob:AP-Dup:";
    let first = Running::start(ioc_config(prefix), descriptors(), accepting);
    assert!(first.updates.log_contains("started, serving on", TIMEOUT));

    // Same configuration as the first one: no server list, ephemeral port
    let config = ioc_config(prefix);
    assert!(config.addr_list.is_empty());
    let began = Instant::now();
    let result = second_instance(config).run(descriptors(), accepting);
    assert!(matches!(result, Err(IocError::AlreadyRunning)));
    assert!(began.elapsed() < Duration::from_secs(1));

    // The first instance keeps serving
    first.put("Value-SP", ChannelValue::Float(2.0)).unwrap();
    assert_eq!(first.get_f64("Value-RB"), 2.0);
    first.stop().unwrap();

    // Once it is gone the prefix is free again
    let again = Running::start(ioc_config(prefix), descriptors(), accepting);
    assert_eq!(again.get_f64("Value-SP"), 0.0);
    again.stop().unwrap();
}

#[test]
fn test_instance_on_another_host_is_found_through_addr_list() {
    let prefix = "TS-Glob:AP-Remote:";
    let first = Running::start(ioc_config(prefix), descriptors(), accepting);

    // A separate lock directory stands in for another host
    let elsewhere = tempfile::tempdir().unwrap();
    let mut config = ioc_config(prefix);
    config.lock_dir = elsewhere.path().to_path_buf();
    config.addr_list = vec![first.addr.to_string()];
    let result = second_instance(config).run(descriptors(), accepting);
    assert!(matches!(result, Err(IocError::AlreadyRunning)));
    first.stop().unwrap();
}

#[test]
fn test_different_prefix_may_run_alongside() {
    let first = Running::start(ioc_config("TS-Glob:AP-Left:"), descriptors(), accepting);
    let second = Running::start(ioc_config("TS-Glob:AP-Right:"), descriptors(), accepting);
    assert_eq!(second.get_f64("Value-SP"), 0.0);
    assert_eq!(first.get_f64("Value-SP"), 0.0);
    second.stop().unwrap();
    first.stop().unwrap();
}
