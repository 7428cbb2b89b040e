//! Units (RTUs) and the directory of verbs they expose.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tracing::{error, info, warn};

use crate::codec::CodecRegistry;
use crate::config::{Autostart, BridgeConfig, UnitConfig};
use crate::error::{Error, Result};
use crate::sensor::Sensor;
use crate::transport::{DEFAULT_RESPONSE_TIMEOUT, Station, Transport};

/// A slave device and the sensors read from it.
pub struct Unit {
    uid: String,
    info: Option<String>,
    prefix: String,
    slaveid: u8,
    autostart: Autostart,
    transport: Arc<Transport>,
    station: Station,
    sensors: Vec<Arc<Sensor>>,
}

impl Unit {
    /// Bind every sensor of `config` on `transport`.
    pub fn build(
        config: &UnitConfig,
        registry: &CodecRegistry,
        transport: Arc<Transport>,
    ) -> Result<Self> {
        let station = Station {
            slave: (config.slaveid != 0).then_some(config.slaveid),
            timeout: match config.timeout {
                0 => DEFAULT_RESPONSE_TIMEOUT,
                ms => Duration::from_millis(ms),
            },
            debug: config.debug,
        };

        let sensors = config
            .sensors
            .iter()
            .map(|sensor| {
                Sensor::bind(config, sensor, registry, Arc::clone(&transport), station)
                    .map_err(|e| prefix_error(&format!("sensor {}", sensor.uid), e))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            uid: config.uid.clone(),
            info: config.info.clone(),
            prefix: config.verb_prefix().to_string(),
            slaveid: config.slaveid,
            autostart: config.autostart,
            transport,
            station,
            sensors,
        })
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn info(&self) -> Option<&str> {
        self.info.as_deref()
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn slaveid(&self) -> u8 {
        self.slaveid
    }

    pub fn autostart(&self) -> Autostart {
        self.autostart
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn sensors(&self) -> &[Arc<Sensor>] {
        &self.sensors
    }

    pub fn sensor(&self, uid: &str) -> Option<&Arc<Sensor>> {
        self.sensors.iter().find(|s| s.uid() == uid)
    }

    /// `<prefix>/admin`
    pub fn admin_verb(&self) -> String {
        format!("{}/admin", self.prefix)
    }

    /// Apply the autostart policy. Only a mandatory connection reports its
    /// failure.
    pub async fn start(&self) -> Result<()> {
        if self.autostart == Autostart::Off || self.transport.is_open().await {
            return Ok(());
        }
        match self.transport.connect().await {
            Ok(()) => Ok(()),
            Err(e) if self.autostart == Autostart::Required => Err(e),
            Err(e) => {
                warn!(unit = %self.uid, error = %e, "Autostart failed, unit stays offline");
                Ok(())
            }
        }
    }

    /// Probe the device. True when it answers.
    pub async fn status(&self) -> Result<bool> {
        let mut scope = self.transport.acquire(self.station).await?;
        scope.report_server_id().await
    }

    /// Open the transport on `uri`.
    pub async fn connect(&self, uri: &str) -> Result<()> {
        self.transport.connect_to(uri).await
    }

    pub async fn disconnect(&self) {
        self.transport.disconnect().await;
    }

    /// Describe every sensor at the given verbosity.
    pub async fn describe(&self, verbose: u8) -> Value {
        let mut entries = Vec::with_capacity(self.sensors.len());
        for sensor in &self.sensors {
            entries.push(sensor.describe(verbose).await);
        }
        Value::Array(entries)
    }

    /// Documentation of the admin verb.
    pub fn admin_documentation(&self) -> Value {
        json!({
            "uid": "admin",
            "info": "RTU admin cmd",
            "verb": self.admin_verb(),
            "usage": {
                "action": ["info", "connect", "disconnect"],
                "verbose": 3,
            },
        })
    }

    /// Stop every polling task of this unit.
    pub fn shutdown(&self) {
        for sensor in &self.sensors {
            sensor.stop_polling();
        }
    }
}

fn prefix_error(context: &str, e: Error) -> Error {
    match e {
        Error::Parse(m) => Error::Parse(format!("{}: {}", context, m)),
        Error::Lookup(m) => Error::Lookup(format!("{}: {}", context, m)),
        Error::Config(m) => Error::Config(format!("{}: {}", context, m)),
        other => other,
    }
}

/// What a verb addresses.
#[derive(Clone)]
pub enum Target {
    Sensor(Arc<Sensor>),
    Admin(Arc<Unit>),
}

/// Every unit of the bridge, indexed by verb.
pub struct Directory {
    units: Vec<Arc<Unit>>,
    verbs: HashMap<String, Target>,
}

impl Directory {
    /// Build units from configuration and apply their autostart policy.
    ///
    /// A unit whose setup fails is logged and left out; the other units are
    /// kept. Fails when the global uri is malformed or when no unit remains.
    pub async fn load(config: &BridgeConfig, registry: &CodecRegistry) -> Result<Self> {
        let shared = config
            .uri
            .as_deref()
            .map(|uri| Transport::new(Some(uri), true).map(Arc::new))
            .transpose()?;

        let mut directory = Self {
            units: Vec::new(),
            verbs: HashMap::new(),
        };

        for unit_config in &config.units {
            let transport = match (&unit_config.uri, &shared) {
                (Some(uri), _) => match Transport::new(Some(uri), false) {
                    Ok(transport) => Arc::new(transport),
                    Err(e) => {
                        error!(unit = %unit_config.uid, error = %e, "Unit skipped");
                        continue;
                    }
                },
                (None, Some(shared)) => Arc::clone(shared),
                (None, None) => {
                    error!(unit = %unit_config.uid, "Unit skipped: no uri and no global uri");
                    continue;
                }
            };

            let unit = match Unit::build(unit_config, registry, transport) {
                Ok(unit) => unit,
                Err(e) => {
                    error!(unit = %unit_config.uid, error = %e, "Unit skipped");
                    continue;
                }
            };

            if let Err(e) = unit.start().await {
                error!(unit = %unit.uid(), error = %e, "Mandatory connection failed, unit skipped");
                continue;
            }

            if let Err(e) = directory.insert(Arc::new(unit)) {
                error!(unit = %unit_config.uid, error = %e, "Unit skipped");
            }
        }

        if directory.units.is_empty() {
            return Err(Error::Config("no unit could be set up".to_string()));
        }

        info!(
            units = directory.units.len(),
            verbs = directory.verbs.len(),
            "Unit directory ready"
        );
        Ok(directory)
    }

    /// Add a unit and its verbs. A verb already taken by another unit is a
    /// configuration error and leaves the directory unchanged.
    pub fn insert(&mut self, unit: Arc<Unit>) -> Result<()> {
        let mut verbs = vec![(unit.admin_verb(), Target::Admin(Arc::clone(&unit)))];
        for sensor in unit.sensors() {
            verbs.push((sensor.verb().to_string(), Target::Sensor(Arc::clone(sensor))));
        }

        if let Some((verb, _)) = verbs.iter().find(|(verb, _)| self.verbs.contains_key(verb)) {
            return Err(Error::Config(format!("verb '{}' already registered", verb)));
        }

        self.verbs.extend(verbs);
        self.units.push(unit);
        Ok(())
    }

    pub fn units(&self) -> &[Arc<Unit>] {
        &self.units
    }

    pub fn unit(&self, uid: &str) -> Option<&Arc<Unit>> {
        self.units.iter().find(|u| u.uid() == uid)
    }

    pub fn lookup(&self, verb: &str) -> Option<&Target> {
        self.verbs.get(verb)
    }

    /// Every sensor of every unit.
    pub fn sensors(&self) -> impl Iterator<Item = &Arc<Sensor>> {
        self.units.iter().flat_map(|u| u.sensors().iter())
    }

    /// Stop polling and close every transport.
    pub async fn shutdown(&self) {
        for unit in &self.units {
            unit.shutdown();
        }
        for unit in &self.units {
            unit.disconnect().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"{
        uri: "tcp://127.0.0.1:1",
        units: [
            {
                uid: "boiler",
                slaveid: 1,
                autostart: 0,
                sensors: [
                    { uid: "temp", register: 0, type: "REGISTER_INPUT", format: "INT16" },
                    { uid: "setpoint", register: 10, type: "REGISTER_HOLDING", format: "UINT16" }
                ]
            },
            {
                uid: "pump",
                prefix: "p1",
                uri: "tcp://127.0.0.1:2",
                autostart: 0,
                sensors: [
                    { uid: "running", register: 0, type: "COIL_HOLDING", format: "BOOL" }
                ]
            },
            {
                uid: "broken",
                slaveid: 2,
                autostart: 0,
                sensors: [
                    { uid: "x", register: 0, type: "REGISTER_INPUT", format: "plugin://nosuch#x" }
                ]
            }
        ]
    }"#;

    async fn directory() -> Directory {
        let config = BridgeConfig::parse(CONFIG).unwrap();
        let registry = CodecRegistry::bundled(None).unwrap();
        Directory::load(&config, &registry).await.unwrap()
    }

    #[tokio::test]
    async fn test_load_skips_broken_unit() {
        let directory = directory().await;
        let uids: Vec<_> = directory.units().iter().map(|u| u.uid()).collect();
        assert_eq!(uids, ["boiler", "pump"]);
        assert_eq!(directory.sensors().count(), 3);
    }

    #[tokio::test]
    async fn test_verbs() {
        let directory = directory().await;
        assert!(matches!(directory.lookup("boiler/temp"), Some(Target::Sensor(_))));
        assert!(matches!(directory.lookup("boiler/admin"), Some(Target::Admin(_))));
        assert!(matches!(directory.lookup("p1/running"), Some(Target::Sensor(_))));
        assert!(directory.lookup("pump/running").is_none());
        assert!(directory.lookup("broken/x").is_none());
    }

    #[tokio::test]
    async fn test_global_uri_is_shared() {
        let directory = directory().await;
        let boiler = directory.unit("boiler").unwrap();
        let pump = directory.unit("pump").unwrap();
        assert!(boiler.transport().is_exclusive().await);
        assert!(!pump.transport().is_exclusive().await);
        assert!(!boiler.transport().is_open().await);
    }

    #[tokio::test]
    async fn test_duplicate_verb_rejected() {
        let mut directory = directory().await;
        let config = BridgeConfig::parse(CONFIG).unwrap();
        let registry = CodecRegistry::with_builtin();
        let transport = Arc::new(Transport::new(Some("tcp://127.0.0.1:3"), false).unwrap());
        let again = Unit::build(&config.units[0], &registry, transport).unwrap();
        assert!(matches!(
            directory.insert(Arc::new(again)),
            Err(Error::Config(_))
        ));
        assert_eq!(directory.units().len(), 2);
    }

    #[tokio::test]
    async fn test_required_autostart_failure_drops_unit() {
        let config = BridgeConfig::parse(
            r#"{
                units: [
                    {
                        uid: "ok",
                        uri: "tcp://127.0.0.1:1",
                        autostart: 0,
                        sensors: [{ uid: "a", register: 0, type: "COIL_INPUT", format: "BOOL" }]
                    },
                    {
                        uid: "gone",
                        uri: "tcp://127.0.0.1:1",
                        autostart: 2,
                        sensors: [{ uid: "a", register: 0, type: "COIL_INPUT", format: "BOOL" }]
                    }
                ]
            }"#,
        )
        .unwrap();
        let registry = CodecRegistry::with_builtin();
        let directory = Directory::load(&config, &registry).await.unwrap();
        assert!(directory.unit("gone").is_none());
        assert!(directory.unit("ok").is_some());
    }

    #[tokio::test]
    async fn test_admin_documentation() {
        let directory = directory().await;
        let doc = directory.unit("pump").unwrap().admin_documentation();
        assert_eq!(doc["verb"], "p1/admin");
        assert_eq!(doc["usage"]["verbose"], 3);
    }
}
