//! The actuators of the feedback: orbit correctors and the RF generator.
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::bus::client::{ChannelClient, ExternalChannel};
use crate::channel::ChannelValue;
use crate::error::SofbError;

const WAIT_POLL: Duration = Duration::from_millis(10);

pub trait CorrectorSet: Send + Sync {
    fn nr_correctors(&self) -> usize;

    /// Current kick of every corrector
    fn kicks(&self) -> Result<Vec<f64>, SofbError>;

    /// Send the new kicks; `None` entries are left alone
    fn apply(&self, kicks: &[Option<f64>]) -> Result<(), SofbError>;

    /// Wait until the readbacks match the applied kicks. `false` on timeout.
    fn wait_readbacks(&self, kicks: &[Option<f64>], timeout: Duration) -> bool;

    /// Fire the event that makes synchronised correctors act
    fn trigger(&self) -> Result<(), SofbError>;

    /// Wait until the power supply references follow. `false` on timeout.
    fn wait_references(&self, kicks: &[Option<f64>], timeout: Duration) -> bool;

    fn connected(&self) -> bool;

    fn timing_connected(&self) -> bool {
        true
    }
}

#[derive(Debug)]
struct Corrector {
    setpoint: ExternalChannel,
    readback: ExternalChannel,
    reference: ExternalChannel,
}

impl Corrector {
    fn new(client: &ChannelClient, sp: &str, rb: &str, reference: &str) -> Self {
        Self {
            setpoint: client.channel(sp),
            readback: client.channel(rb),
            reference: client.channel(reference),
        }
    }

    fn connected(&self) -> bool {
        self.setpoint.connected() && self.readback.connected() && self.reference.connected()
    }
}

/// Correctors driven through their `Kick-SP/RB/Mon` channels
#[derive(Debug)]
pub struct ChannelCorrectors {
    correctors: Vec<Corrector>,
    trigger: Option<ExternalChannel>,
    tolerance: f64,
}

impl ChannelCorrectors {
    /// `names` are the CH then CV power supplies; `rf_generator` is appended
    /// as the last actuator when given.
    pub fn new(
        client: Arc<ChannelClient>,
        names: &[String],
        rf_generator: Option<&str>,
        trigger: Option<&str>,
        tolerance: f64,
    ) -> Self {
        let mut correctors: Vec<Corrector> = names
            .iter()
            .map(|name| {
                Corrector::new(
                    &client,
                    &format!("{name}:Kick-SP"),
                    &format!("{name}:Kick-RB"),
                    &format!("{name}:Kick-Mon"),
                )
            })
            .collect();
        if let Some(rf) = rf_generator {
            correctors.push(Corrector::new(
                &client,
                &format!("{rf}-SP"),
                &format!("{rf}-RB"),
                &format!("{rf}-RB"),
            ));
        }
        Self {
            correctors,
            trigger: trigger.map(|name| client.channel(name)),
            tolerance,
        }
    }

    fn wait_for(
        &self,
        kicks: &[Option<f64>],
        timeout: Duration,
        channel: impl Fn(&Corrector) -> &ExternalChannel,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let settled = self.correctors.iter().zip(kicks.iter()).all(|(c, k)| match k {
                None => true,
                Some(k) => channel(c)
                    .valid_value()
                    .and_then(|v| v.as_f64())
                    .is_some_and(|v| (v - k).abs() <= self.tolerance),
            });
            if settled {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(WAIT_POLL);
        }
    }
}

impl CorrectorSet for ChannelCorrectors {
    fn nr_correctors(&self) -> usize {
        self.correctors.len()
    }

    fn kicks(&self) -> Result<Vec<f64>, SofbError> {
        self.correctors
            .iter()
            .map(|c| {
                c.readback
                    .valid_value()
                    .and_then(|v| v.as_f64())
                    .ok_or_else(|| SofbError::NotConnected(c.readback.name().to_string()))
            })
            .collect()
    }

    fn apply(&self, kicks: &[Option<f64>]) -> Result<(), SofbError> {
        if kicks.len() != self.correctors.len() {
            return Err(SofbError::Length {
                what: "kick",
                expected: self.correctors.len(),
                found: kicks.len(),
            });
        }
        for (corrector, kick) in self.correctors.iter().zip(kicks.iter()) {
            if let Some(kick) = kick {
                corrector.setpoint.put(ChannelValue::Float(*kick))?;
            }
        }
        Ok(())
    }

    fn wait_readbacks(&self, kicks: &[Option<f64>], timeout: Duration) -> bool {
        self.wait_for(kicks, timeout, |c| &c.readback)
    }

    fn trigger(&self) -> Result<(), SofbError> {
        match &self.trigger {
            Some(trigger) => Ok(trigger.put(ChannelValue::Int(1))?),
            None => Ok(()),
        }
    }

    fn wait_references(&self, kicks: &[Option<f64>], timeout: Duration) -> bool {
        self.wait_for(kicks, timeout, |c| &c.reference)
    }

    fn connected(&self) -> bool {
        self.correctors.iter().all(|c| c.connected())
    }

    fn timing_connected(&self) -> bool {
        self.trigger.as_ref().map_or(true, |t| t.connected())
    }
}

//Unit tests
#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::server::TransportServer;
    use crate::channel::ChannelDescriptor;
    use crate::database::Database;
    use crate::driver::{Application, Driver};

    struct Accepting;

    impl Application for Accepting {
        fn write(&self, _name: &str, _value: &ChannelValue) -> bool {
            true
        }
    }

    #[test]
    fn test_kicks_apply_and_wait() {
        let mut descriptors = Vec::new();
        for name in ["PS-CH1", "PS-CH2"] {
            for suffix in ["SP", "RB", "Mon"] {
                descriptors.push(ChannelDescriptor::float(&format!("{name}:Kick-{suffix}"), 1.0));
            }
        }
        let db = Arc::new(Database::create(descriptors).unwrap());
        let driver = Arc::new(Driver::new(db.clone(), Arc::new(Accepting)));
        let server = TransportServer::bind("127.0.0.1:0", "", driver)
            .unwrap()
            .spawn(Duration::from_millis(20))
            .unwrap();
        let client = Arc::new(
            ChannelClient::new(vec![server.local_addr().to_string()], Duration::from_secs(1)).unwrap(),
        );
        let names = vec![String::from("PS-CH1"), String::from("PS-CH2")];
        let correctors = ChannelCorrectors::new(client.clone(), &names, None, None, 1e-6);
        assert_eq!(correctors.nr_correctors(), 2);

        let deadline = Instant::now() + Duration::from_secs(5);
        while !correctors.connected() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(correctors.kicks().unwrap(), vec![1.0, 1.0]);

        correctors.apply(&[None, Some(2.0)]).unwrap();
        // The readbacks only change when the write reaches the server
        assert!(correctors.wait_readbacks(&[None, Some(2.0)], Duration::from_secs(2)));
        assert!(!correctors.wait_references(&[None, Some(2.0)], Duration::from_millis(50)));
        assert_eq!(db.value("PS-CH1:Kick-SP").unwrap(), ChannelValue::Float(1.0));
        assert!(correctors.apply(&[None]).is_err());

        client.shutdown();
        server.stop();
    }
}
