//! Sensors: a register range on one unit, decoded by one codec.

use std::sync::Arc;

use serde_json::{Map, Value, json};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, warn};

use crate::codec::{Codec, CodecRegistry, FormatRef};
use crate::config::{SensorConfig, UnitConfig};
use crate::error::{Error, Result};
use crate::function::RegisterFunction;
use crate::poller::{self, ChangeDetector, EVENT_CAPACITY, Emission, PollSlot, Subscription};
use crate::transport::{Station, Transport};

struct SensorState {
    /// Last words read from the device, `count * words_per_element` long.
    raw: Vec<u16>,
    codec: Box<dyn Codec>,
}

impl SensorState {
    /// Decode the raw buffer. A single element decodes to a scalar, several
    /// to an array in address order where suppressed elements are null.
    /// Returns `None` when the codec suppressed every element.
    fn decode(&mut self, words_per_element: usize, count: usize) -> Result<Option<Value>> {
        let SensorState { raw, codec } = self;
        if count == 1 {
            return codec.decode(raw);
        }

        let mut any = false;
        let mut values = Vec::with_capacity(count);
        for chunk in raw.chunks(words_per_element) {
            match codec.decode(chunk)? {
                Some(value) => {
                    any = true;
                    values.push(value);
                }
                None => values.push(Value::Null),
            }
        }
        Ok(any.then_some(Value::Array(values)))
    }
}

/// A configured sensor bound to its unit's transport.
pub struct Sensor {
    uid: String,
    unit: String,
    verb: String,
    info: Option<String>,
    address: u16,
    function: RegisterFunction,
    format: FormatRef,
    count: usize,
    hertz: u32,
    idle: u32,
    usage: Option<Value>,
    sample: Option<Value>,
    autosubscribe: bool,
    transport: Arc<Transport>,
    station: Station,
    state: Mutex<SensorState>,
    events: broadcast::Sender<Value>,
    poll: std::sync::Mutex<PollSlot>,
}

impl Sensor {
    /// Resolve a sensor's register function and codec and allocate its raw
    /// buffer.
    pub fn bind(
        unit: &UnitConfig,
        config: &SensorConfig,
        registry: &CodecRegistry,
        transport: Arc<Transport>,
        station: Station,
    ) -> Result<Arc<Self>> {
        let function = RegisterFunction::lookup(&config.function)?;
        let format = registry.resolve(&config.format)?;
        let codec = format.instantiate(config.args.as_ref())?;

        let count = usize::from(config.count);
        let words = count * format.words();
        function.validate_count(words)?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        debug!(
            unit = %unit.uid,
            sensor = %config.uid,
            function = function.uid(),
            format = format.uid(),
            address = config.register,
            words,
            "Sensor bound"
        );

        Ok(Arc::new(Self {
            uid: config.uid.clone(),
            unit: unit.uid.clone(),
            verb: format!("{}/{}", unit.verb_prefix(), config.uid),
            info: config.info.clone(),
            address: config.register,
            function,
            format,
            count,
            hertz: config.hertz.unwrap_or(unit.hertz),
            idle: config.idle.unwrap_or(unit.idle),
            usage: config.usage.clone(),
            sample: config.sample.clone(),
            autosubscribe: config.autosubscribe,
            transport,
            station,
            state: Mutex::new(SensorState {
                raw: vec![0; words],
                codec,
            }),
            events,
            poll: std::sync::Mutex::new(PollSlot::default()),
        }))
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Uid of the owning unit.
    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// `<unit prefix>/<sensor uid>`
    pub fn verb(&self) -> &str {
        &self.verb
    }

    pub fn info(&self) -> Option<&str> {
        self.info.as_deref()
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    pub fn function(&self) -> RegisterFunction {
        self.function
    }

    pub fn format(&self) -> &FormatRef {
        &self.format
    }

    /// Number of elements.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Size of the raw buffer in wire units.
    pub fn words(&self) -> usize {
        self.count * self.format.words()
    }

    pub fn hertz(&self) -> u32 {
        self.hertz
    }

    pub fn idle(&self) -> u32 {
        self.idle
    }

    /// Subscribed by the bridge at startup.
    pub fn autosubscribe(&self) -> bool {
        self.autosubscribe
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Number of live subscriptions.
    pub fn subscribers(&self) -> usize {
        self.events.receiver_count()
    }

    /// True while a polling task is armed.
    pub fn is_polling(&self) -> bool {
        self.poll
            .lock()
            .map(|slot| slot.is_armed())
            .unwrap_or_else(|poisoned| poisoned.into_inner().is_armed())
    }

    pub(crate) fn events(&self) -> &broadcast::Sender<Value> {
        &self.events
    }

    pub(crate) fn poll_slot(&self) -> &std::sync::Mutex<PollSlot> {
        &self.poll
    }

    /// Read the range from the device and decode it.
    ///
    /// A value the codec suppresses reads as null.
    pub async fn read(&self) -> Result<Value> {
        let mut state = self.state.lock().await;
        self.refresh(&mut state).await?;
        let value = state.decode(self.format.words(), self.count)?;
        Ok(value.unwrap_or(Value::Null))
    }

    /// Encode `value` and write it to the device.
    ///
    /// An array writes the whole range and must hold exactly `count`
    /// elements. A scalar writes the first element only.
    pub async fn write(&self, value: &Value) -> Result<()> {
        if !self.function.is_writable() {
            return Err(Error::Unsupported(format!(
                "{} is {} and cannot be written",
                self.verb,
                self.function.uid()
            )));
        }

        let words = self.format.words();
        let buffer = {
            let state = self.state.lock().await;
            match value {
                Value::Array(items) if self.count > 1 || items.len() != 1 => {
                    if items.len() != self.count {
                        return Err(Error::Format(format!(
                            "{} expects {} values, got {}",
                            self.verb,
                            self.count,
                            items.len()
                        )));
                    }
                    let mut buffer = vec![0u16; self.count * words];
                    for (item, chunk) in items.iter().zip(buffer.chunks_mut(words)) {
                        state.codec.encode(item, chunk)?;
                    }
                    buffer
                }
                Value::Array(items) => {
                    let mut buffer = vec![0u16; words];
                    state.codec.encode(&items[0], &mut buffer)?;
                    buffer
                }
                scalar => {
                    let mut buffer = vec![0u16; words];
                    state.codec.encode(scalar, &mut buffer)?;
                    buffer
                }
            }
        };

        let mut scope = self.transport.acquire(self.station).await?;
        self.function.write(&mut scope, self.address, &buffer).await
    }

    /// Register a consumer and start polling if this is the first one.
    ///
    /// The sensor is read once immediately; the decoded value is returned
    /// and its words seed the change detector. A failed read is logged and
    /// the detector starts from a zeroed snapshot.
    pub async fn subscribe(self: &Arc<Self>) -> (Value, Subscription) {
        let rx = self.events.subscribe();

        let (value, snapshot) = {
            let mut state = self.state.lock().await;
            match self.refresh(&mut state).await {
                Ok(()) => {
                    let value = match state.decode(self.format.words(), self.count) {
                        Ok(value) => value.unwrap_or(Value::Null),
                        Err(e) => {
                            warn!(sensor = %self.verb, error = %e, "Initial decode failed");
                            Value::Null
                        }
                    };
                    (value, state.raw.clone())
                }
                Err(e) => {
                    warn!(sensor = %self.verb, error = %e, "Initial read failed");
                    (Value::Null, vec![0; state.raw.len()])
                }
            }
        };

        poller::arm(self, snapshot);
        (value, Subscription::new(rx))
    }

    /// Drop a consumer; polling stops with the last one.
    pub fn unsubscribe(&self, subscription: Subscription) {
        drop(subscription);
        poller::release(self);
    }

    /// Stop polling regardless of subscribers.
    pub fn stop_polling(&self) {
        poller::stop(self);
    }

    /// Read and, when the detector asks for it, decode. Used by the polling
    /// task on every tick.
    pub(crate) async fn poll(&self, detector: &mut ChangeDetector) -> Result<Option<Emission>> {
        let mut state = self.state.lock().await;
        self.refresh(&mut state).await?;
        if !detector.check(&state.raw) {
            return Ok(None);
        }
        let value = state.decode(self.format.words(), self.count)?;
        Ok(value.map(|value| Emission {
            value,
            raw: state.raw.clone(),
        }))
    }

    async fn refresh(&self, state: &mut SensorState) -> Result<()> {
        let mut scope = self.transport.acquire(self.station).await?;
        let quantity = u16::try_from(state.raw.len())
            .map_err(|_| Error::Config(format!("{}: range too large", self.verb)))?;
        let words = self.function.read(&mut scope, self.address, quantity).await?;
        state.raw.copy_from_slice(&words);
        Ok(())
    }

    /// Description used by the unit `info` action.
    ///
    /// Levels 0 and 1 give the layout, level 2 adds the current value (null
    /// when the read fails), level 3 gives the verb's documentation.
    pub async fn describe(&self, verbose: u8) -> Value {
        if verbose >= 3 {
            return self.documentation();
        }

        let mut entry = json!({
            "uid": self.uid,
            "type": self.function.uid(),
            "format": self.format.uid(),
            "count": self.count,
            "nbreg": self.words(),
        });
        if verbose == 2 {
            let data = match self.read().await {
                Ok(value) => value,
                Err(e) => {
                    debug!(sensor = %self.verb, error = %e, "Read for info failed");
                    Value::Null
                }
            };
            entry["data"] = data;
        }
        entry
    }

    fn documentation(&self) -> Value {
        let mut doc = Map::new();
        doc.insert("uid".into(), json!(self.uid));
        doc.insert("verb".into(), json!(self.verb));
        if let Some(info) = &self.info {
            doc.insert("info".into(), json!(info));
        }
        doc.insert("type".into(), json!(self.function.info()));
        doc.insert("format".into(), json!(self.format.uid()));
        doc.insert(
            "usage".into(),
            self.usage.clone().unwrap_or_else(|| self.derived_usage()),
        );
        if let Some(sample) = &self.sample {
            doc.insert("sample".into(), sample.clone());
        }
        doc.insert("count".into(), json!(self.count));
        Value::Object(doc)
    }

    fn derived_usage(&self) -> Value {
        let mut actions = Vec::with_capacity(4);
        if self.function.is_writable() {
            actions.push("write");
        }
        actions.extend(["read", "subscribe", "unsubscribe"]);
        json!({ "action": actions, "data": self.format.info() })
    }
}
