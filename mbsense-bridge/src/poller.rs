//! Change-driven polling of subscribed sensors.
//!
//! Each sensor with at least one subscriber runs one polling task. The task
//! re-reads the sensor every `1000 / hertz` ms and emits a decoded value when
//! the raw words changed or when the idle threshold forces one.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::sensor::Sensor;

/// Capacity of a sensor's emission channel.
pub const EVENT_CAPACITY: usize = 16;

/// Decides when a freshly read buffer must be emitted.
///
/// The buffer is compared word for word with the last emitted one. An
/// unchanged buffer counts down the idle threshold and is emitted when it
/// reaches zero; a zero threshold never forces an emission.
#[derive(Debug, Clone)]
pub struct ChangeDetector {
    snapshot: Vec<u16>,
    threshold: u32,
    idle: u32,
}

impl ChangeDetector {
    pub fn new(snapshot: Vec<u16>, threshold: u32) -> Self {
        Self {
            snapshot,
            threshold,
            idle: threshold,
        }
    }

    /// Returns true when `raw` must be decoded and emitted.
    pub fn check(&mut self, raw: &[u16]) -> bool {
        if raw != self.snapshot.as_slice() {
            return true;
        }
        if self.threshold == 0 {
            return false;
        }
        self.idle = self.idle.saturating_sub(1);
        self.idle == 0
    }

    /// Record `raw` as emitted.
    pub fn commit(&mut self, raw: &[u16]) {
        self.snapshot.clear();
        self.snapshot.extend_from_slice(raw);
        self.idle = self.threshold;
    }

    pub fn snapshot(&self) -> &[u16] {
        &self.snapshot
    }
}

struct Armed {
    generation: u64,
    stop: watch::Sender<bool>,
}

/// Polling state of one sensor: armed or not.
#[derive(Default)]
pub(crate) struct PollSlot {
    armed: Option<Armed>,
    generation: u64,
}

impl PollSlot {
    pub(crate) fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    fn disarm(&mut self) {
        if let Some(armed) = self.armed.take() {
            let _ = armed.stop.send(true);
        }
    }
}

/// A value decoded by a polling tick together with the words it came from.
pub(crate) struct Emission {
    pub value: Value,
    pub raw: Vec<u16>,
}

/// Start polling `sensor` unless it is already armed.
pub(crate) fn arm(sensor: &Arc<Sensor>, snapshot: Vec<u16>) {
    let mut slot = lock(sensor.poll_slot());
    if slot.is_armed() {
        return;
    }

    slot.generation += 1;
    let generation = slot.generation;
    let (stop_tx, stop_rx) = watch::channel(false);
    slot.armed = Some(Armed {
        generation,
        stop: stop_tx,
    });

    debug!(sensor = %sensor.verb(), hertz = sensor.hertz(), "Polling armed");
    let detector = ChangeDetector::new(snapshot, sensor.idle());
    tokio::spawn(run(Arc::clone(sensor), generation, detector, stop_rx));
}

/// Stop polling when no subscriber is left.
pub(crate) fn release(sensor: &Sensor) {
    let mut slot = lock(sensor.poll_slot());
    if sensor.events().receiver_count() == 0 && slot.is_armed() {
        slot.disarm();
        debug!(sensor = %sensor.verb(), "Polling disarmed");
    }
}

/// Stop polling unconditionally.
pub(crate) fn stop(sensor: &Sensor) {
    lock(sensor.poll_slot()).disarm();
}

/// Disarm after a failed delivery, unless a newer arming or a new
/// subscriber superseded this task. Returns true when the task must exit.
fn retire(sensor: &Sensor, generation: u64) -> bool {
    let mut slot = lock(sensor.poll_slot());
    match &slot.armed {
        Some(armed) if armed.generation == generation => {
            if sensor.events().receiver_count() > 0 {
                return false;
            }
            slot.armed = None;
            debug!(sensor = %sensor.verb(), "No subscriber left, polling disarmed");
            true
        }
        _ => true,
    }
}

fn lock(slot: &Mutex<PollSlot>) -> std::sync::MutexGuard<'_, PollSlot> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Tick period for a polling frequency.
pub fn period(hertz: u32) -> Duration {
    Duration::from_millis((1000 / u64::from(hertz.max(1))).max(1))
}

async fn run(
    sensor: Arc<Sensor>,
    generation: u64,
    mut detector: ChangeDetector,
    mut stop: watch::Receiver<bool>,
) {
    let period = period(sensor.hertz());
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.changed() => break,
        }
        if *stop.borrow() {
            break;
        }

        let emission = match sensor.poll(&mut detector).await {
            Ok(Some(emission)) => emission,
            Ok(None) => continue,
            Err(e) => {
                warn!(sensor = %sensor.verb(), error = %e, "Polling read failed");
                continue;
            }
        };

        match sensor.events().send(emission.value) {
            Ok(receivers) => {
                debug!(sensor = %sensor.verb(), receivers, "Emitted");
                detector.commit(&emission.raw);
            }
            Err(_) => {
                if retire(&sensor, generation) {
                    break;
                }
                detector.commit(&emission.raw);
            }
        }
    }
    debug!(sensor = %sensor.verb(), generation, "Polling task exited");
}

/// A consumer's handle on a sensor's emissions.
pub struct Subscription {
    rx: broadcast::Receiver<Value>,
}

impl Subscription {
    pub(crate) fn new(rx: broadcast::Receiver<Value>) -> Self {
        Self { rx }
    }

    /// Wait for the next emitted value. Returns `None` once the sensor is
    /// gone.
    pub async fn recv(&mut self) -> Option<Value> {
        loop {
            match self.rx.recv().await {
                Ok(value) => return Some(value),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Subscriber lagging, values dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_triggers_emission() {
        let mut detector = ChangeDetector::new(vec![1, 2], 0);
        assert!(!detector.check(&[1, 2]));
        assert!(detector.check(&[1, 3]));
        // Not committed: still differs from the snapshot.
        assert!(detector.check(&[1, 3]));
        detector.commit(&[1, 3]);
        assert!(!detector.check(&[1, 3]));
        assert_eq!(detector.snapshot(), &[1, 3]);
    }

    #[test]
    fn test_idle_forces_on_kth_tick() {
        let k = 4;
        let mut detector = ChangeDetector::new(vec![7], k);
        for _ in 0..k - 1 {
            assert!(!detector.check(&[7]));
        }
        assert!(detector.check(&[7]));
        detector.commit(&[7]);
        for _ in 0..k - 1 {
            assert!(!detector.check(&[7]));
        }
        assert!(detector.check(&[7]));
    }

    #[test]
    fn test_change_resets_idle_countdown() {
        let mut detector = ChangeDetector::new(vec![0], 3);
        assert!(!detector.check(&[0]));
        assert!(!detector.check(&[0]));
        assert!(detector.check(&[1]));
        detector.commit(&[1]);
        assert!(!detector.check(&[1]));
        assert!(!detector.check(&[1]));
        assert!(detector.check(&[1]));
    }

    #[test]
    fn test_zero_threshold_never_forces() {
        let mut detector = ChangeDetector::new(vec![5, 5], 0);
        for _ in 0..1000 {
            assert!(!detector.check(&[5, 5]));
        }
    }

    #[test]
    fn test_period() {
        assert_eq!(period(10), Duration::from_millis(100));
        assert_eq!(period(3), Duration::from_millis(333));
        assert_eq!(period(5000), Duration::from_millis(1));
        assert_eq!(period(0), Duration::from_millis(1000));
    }
}
