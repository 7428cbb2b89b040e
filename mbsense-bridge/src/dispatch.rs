//! Request routing: verbs, actions and replies.
//!
//! Sensor verbs accept `{"action": "read"|"write"|"subscribe"|"unsubscribe",
//! "data": ..}`, admin verbs `{"action": "connect"|"disconnect"|"info",
//! "uri": .., "verbose": ..}`. The empty verb carries the global actions
//! `ping` and `info`. Actions are matched case-insensitively.
//!
//! Values emitted for subscribed sensors are forwarded as [`SensorEvent`]s
//! on the channel given to [`Dispatcher::new`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use mbsense_common::SensorEvent;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::poller::Subscription;
use crate::sensor::Sensor;
use crate::unit::{Directory, Target, Unit};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SensorRequest {
    action: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AdminRequest {
    action: String,
    #[serde(default)]
    uri: Option<String>,
    #[serde(default)]
    verbose: u8,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GlobalRequest {
    action: String,
    #[serde(default)]
    verbose: u8,
}

fn parse_request<T: for<'de> Deserialize<'de>>(verb: &str, request: &Value) -> Result<T> {
    T::deserialize(request)
        .map_err(|e| Error::Parse(format!("invalid request for '{}': {}", verb, e)))
}

/// Forwarding of one sensor's emissions.
struct Feed {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl Feed {
    async fn stop(self) {
        let _ = self.stop.send(());
        let _ = self.task.await;
    }
}

enum FeedSlot {
    /// Reserved by a subscribe still reading the device.
    Pending(u64),
    Running(Feed),
}

/// Routes requests to sensors and units.
pub struct Dispatcher {
    directory: Arc<Directory>,
    events: mpsc::Sender<SensorEvent>,
    feeds: Mutex<HashMap<String, FeedSlot>>,
    reservations: AtomicU64,
    pings: AtomicU64,
}

impl Dispatcher {
    pub fn new(directory: Arc<Directory>, events: mpsc::Sender<SensorEvent>) -> Self {
        Self {
            directory,
            events,
            feeds: Mutex::new(HashMap::new()),
            reservations: AtomicU64::new(0),
            pings: AtomicU64::new(0),
        }
    }

    pub fn directory(&self) -> &Arc<Directory> {
        &self.directory
    }

    /// Handle one request addressed to `verb`.
    pub async fn handle(&self, verb: &str, request: &Value) -> Result<Value> {
        if verb.is_empty() {
            let request: GlobalRequest = parse_request(verb, request)?;
            return match request.action.to_ascii_lowercase().as_str() {
                "ping" => Ok(self.ping()),
                "info" => Ok(self.info(request.verbose).await),
                other => Err(Error::Parse(format!("unknown global action '{}'", other))),
            };
        }

        match self.directory.lookup(verb) {
            Some(Target::Sensor(sensor)) => {
                let sensor = Arc::clone(sensor);
                self.sensor_request(&sensor, parse_request(verb, request)?).await
            }
            Some(Target::Admin(unit)) => {
                let unit = Arc::clone(unit);
                self.admin_request(&unit, parse_request(verb, request)?).await
            }
            None => Err(Error::Lookup(format!("unknown verb '{}'", verb))),
        }
    }

    async fn sensor_request(&self, sensor: &Arc<Sensor>, request: SensorRequest) -> Result<Value> {
        let action = request.action.to_ascii_lowercase();
        if action != "unsubscribe" && !sensor.transport().is_open().await {
            return Err(Error::NotConnected(format!(
                "unit of {} is not connected",
                sensor.verb()
            )));
        }

        match action.as_str() {
            "read" => sensor.read().await,
            "write" => {
                let data = request.data.ok_or_else(|| {
                    Error::Format(format!("write to {} without data", sensor.verb()))
                })?;
                sensor.write(&data).await?;
                Ok(Value::Null)
            }
            "subscribe" => self.subscribe(sensor).await,
            "unsubscribe" => {
                self.unsubscribe(sensor).await;
                Ok(Value::Null)
            }
            other => Err(Error::Parse(format!(
                "unknown action '{}' for {}",
                other,
                sensor.verb()
            ))),
        }
    }

    async fn admin_request(&self, unit: &Unit, request: AdminRequest) -> Result<Value> {
        match request.action.to_ascii_lowercase().as_str() {
            "connect" => {
                if unit.transport().is_open().await {
                    return Err(Error::Connection(format!(
                        "unit {} is already connected",
                        unit.uid()
                    )));
                }
                let uri = request.uri.ok_or_else(|| {
                    Error::Parse(format!("connect on {} without uri", unit.uid()))
                })?;
                unit.connect(&uri).await?;
                Ok(Value::Null)
            }
            "disconnect" => {
                unit.disconnect().await;
                Ok(Value::Null)
            }
            "info" => Ok(unit.describe(request.verbose).await),
            other => Err(Error::Parse(format!(
                "unknown admin action '{}' for {}",
                other,
                unit.uid()
            ))),
        }
    }

    /// Start forwarding `sensor`'s emissions. Returns the current value.
    ///
    /// Subscribing a sensor that is already forwarded only reads it. The
    /// feed table is not held during device I/O.
    pub async fn subscribe(&self, sensor: &Arc<Sensor>) -> Result<Value> {
        let verb = sensor.verb();
        let ticket = self.reservations.fetch_add(1, Ordering::Relaxed);
        {
            let mut feeds = self.feeds.lock().await;
            if feeds.contains_key(verb) {
                drop(feeds);
                return Ok(sensor.read().await.unwrap_or(Value::Null));
            }
            feeds.insert(verb.to_string(), FeedSlot::Pending(ticket));
        }

        let (value, subscription) = sensor.subscribe().await;
        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(forward(
            Arc::clone(sensor),
            subscription,
            stopped,
            self.events.clone(),
        ));
        let feed = Feed { stop, task };

        let mut feeds = self.feeds.lock().await;
        if matches!(feeds.get(verb), Some(FeedSlot::Pending(t)) if *t == ticket) {
            feeds.insert(verb.to_string(), FeedSlot::Running(feed));
            info!(sensor = %verb, "Subscribed");
        } else {
            // Unsubscribed while the initial read was in flight.
            drop(feeds);
            debug!(sensor = %verb, "Subscription cancelled before it started");
            feed.stop().await;
        }
        Ok(value)
    }

    /// Stop forwarding `sensor`'s emissions. A sensor that is not forwarded
    /// is left alone.
    pub async fn unsubscribe(&self, sensor: &Sensor) {
        let slot = self.feeds.lock().await.remove(sensor.verb());
        match slot {
            Some(FeedSlot::Running(feed)) => {
                feed.stop().await;
                info!(sensor = %sensor.verb(), "Unsubscribed");
            }
            Some(FeedSlot::Pending(_)) => {
                debug!(sensor = %sensor.verb(), "Unsubscribe of a starting subscription")
            }
            None => debug!(sensor = %sensor.verb(), "Unsubscribe without subscription"),
        }
    }

    /// Subscribe every sensor configured with `autosubscribe`. Returns how
    /// many were subscribed.
    pub async fn autosubscribe(&self) -> usize {
        let sensors: Vec<_> = self
            .directory
            .sensors()
            .filter(|s| s.autosubscribe())
            .cloned()
            .collect();
        let mut count = 0;
        for sensor in &sensors {
            match self.subscribe(sensor).await {
                Ok(_) => count += 1,
                Err(e) => warn!(sensor = %sensor.verb(), error = %e, "Autosubscribe failed"),
            }
        }
        count
    }

    /// Stop every feed.
    pub async fn shutdown(&self) {
        let slots: Vec<_> = self.feeds.lock().await.drain().collect();
        for (_, slot) in slots {
            if let FeedSlot::Running(feed) = slot {
                feed.stop().await;
            }
        }
    }

    /// `pong=<n>`, counting every ping.
    pub fn ping(&self) -> Value {
        let count = self.pings.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(count, "ping");
        Value::String(format!("pong={}", count))
    }

    /// Description of every unit.
    ///
    /// Level 0 gives a grouped page with each unit's status and verb
    /// documentation. Level 1 lists `{uid, uri, info}`, level 2 adds the
    /// probed status when the probe succeeds.
    pub async fn info(&self, verbose: u8) -> Value {
        if verbose == 0 {
            let mut groups = Vec::with_capacity(self.directory.units().len());
            for unit in self.directory.units() {
                let online = unit.status().await.unwrap_or(false);
                let mut verbs = vec![unit.admin_documentation()];
                if let Value::Array(sensors) = unit.describe(3).await {
                    verbs.extend(sensors);
                }
                groups.push(json!({
                    "uid": unit.uid(),
                    "info": unit.info(),
                    "status": {
                        "uri": unit.transport().uri().await,
                        "slaveid": unit.slaveid(),
                        "status": online,
                    },
                    "verbs": verbs,
                }));
            }
            return json!({
                "groups": groups,
                "metadata": {
                    "uid": env!("CARGO_PKG_NAME"),
                    "info": env!("CARGO_PKG_DESCRIPTION"),
                    "version": env!("CARGO_PKG_VERSION"),
                    "author": env!("CARGO_PKG_AUTHORS"),
                },
            });
        }

        let mut units = Vec::with_capacity(self.directory.units().len());
        for unit in self.directory.units() {
            let mut entry = json!({
                "uid": unit.uid(),
                "uri": unit.transport().uri().await,
                "info": unit.info(),
            });
            if verbose == 2 {
                if let Ok(status) = unit.status().await {
                    entry["status"] = json!(status);
                }
            }
            units.push(entry);
        }
        Value::Array(units)
    }
}

async fn forward(
    sensor: Arc<Sensor>,
    mut subscription: Subscription,
    mut stopped: oneshot::Receiver<()>,
    events: mpsc::Sender<SensorEvent>,
) {
    loop {
        tokio::select! {
            _ = &mut stopped => break,
            value = subscription.recv() => {
                let Some(value) = value else { break };
                let event = SensorEvent::new(sensor.unit(), sensor.uid(), value);
                if events.send(event).await.is_err() {
                    break;
                }
            }
        }
    }
    sensor.unsubscribe(subscription);
}
