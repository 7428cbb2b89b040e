//! Zenoh front end: requests in, replies and sensor events out.

use std::future::Future;
use std::sync::Arc;

use mbsense_common::{
    Format, KeyExprBuilder, ParsedKeyExpr, SensorEvent, decode_auto, encode, parse_key_expr,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use zenoh::Session;

use crate::codec::CodecRegistry;
use crate::config::BridgeConfig;
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::unit::Directory;

/// Emissions waiting to be published.
const EVENT_QUEUE: usize = 256;

/// Reply published for every request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Reply {
    Success { response: Value },
    Error { kind: String, message: String },
}

impl From<Result<Value>> for Reply {
    fn from(result: Result<Value>) -> Self {
        match result {
            Ok(response) => Reply::Success { response },
            Err(e) => Reply::Error {
                kind: e.kind().to_string(),
                message: e.to_string(),
            },
        }
    }
}

/// The running bridge.
pub struct Bridge {
    session: Session,
    keys: KeyExprBuilder,
    format: Format,
    dispatcher: Arc<Dispatcher>,
    events: mpsc::Receiver<SensorEvent>,
}

impl Bridge {
    /// Build the codec registry and the units, connecting those with an
    /// autostart policy.
    pub async fn new(config: &BridgeConfig, session: Session) -> Result<Self> {
        let registry = CodecRegistry::bundled(config.plugins.as_deref())?;
        info!(
            providers = ?registry.providers().collect::<Vec<_>>(),
            "Codec registry ready"
        );

        let directory = Arc::new(Directory::load(config, &registry).await?);
        let (tx, events) = mpsc::channel(EVENT_QUEUE);

        Ok(Self {
            session,
            keys: KeyExprBuilder::new(config.key_prefix.clone()),
            format: config.serialization,
            dispatcher: Arc::new(Dispatcher::new(directory, tx)),
            events,
        })
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Serve requests until `shutdown` resolves.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let Bridge {
            session,
            keys,
            format,
            dispatcher,
            events,
        } = self;

        let subscriber = session
            .declare_subscriber(keys.command_wildcard())
            .await
            .map_err(|e| Error::Connection(format!("cannot subscribe to commands: {}", e)))?;

        let publisher = tokio::spawn(publish_events(
            session.clone(),
            keys.clone(),
            format,
            events,
        ));

        let subscribed = dispatcher.autosubscribe().await;
        publish_status(&session, &keys, &dispatcher, "running").await;
        info!(
            commands = %keys.command_wildcard(),
            subscribed,
            "Bridge running"
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                sample = subscriber.recv_async() => {
                    let sample = match sample {
                        Ok(sample) => sample,
                        Err(e) => {
                            error!(error = %e, "Command subscriber closed");
                            break;
                        }
                    };
                    let key = sample.key_expr().as_str().to_string();
                    let payload = sample.payload().to_bytes().into_owned();
                    tokio::spawn(serve(
                        session.clone(),
                        keys.clone(),
                        format,
                        Arc::clone(&dispatcher),
                        key,
                        payload,
                    ));
                }
            }
        }

        info!("Shutting down");
        dispatcher.shutdown().await;
        dispatcher.directory().shutdown().await;
        publisher.abort();
        publish_status(&session, &keys, &dispatcher, "offline").await;
        Ok(())
    }
}

async fn serve(
    session: Session,
    keys: KeyExprBuilder,
    format: Format,
    dispatcher: Arc<Dispatcher>,
    key: String,
    payload: Vec<u8>,
) {
    let Some(ParsedKeyExpr::Command { verb }) = parse_key_expr(keys.prefix(), &key) else {
        debug!(key = %key, "Ignoring sample on unexpected key");
        return;
    };

    let reply = match parse_payload(&payload) {
        Ok(request) => {
            debug!(verb = %verb, request = %request, "Request");
            Reply::from(dispatcher.handle(verb, &request).await)
        }
        Err(e) => Reply::from(Err(e)),
    };

    if let Reply::Error { message, .. } = &reply {
        warn!(verb = %verb, error = %message, "Request failed");
    }

    let reply_key = keys.reply_key(verb);
    match encode(&reply, format) {
        Ok(bytes) => {
            if let Err(e) = session.put(&reply_key, bytes).await {
                error!(key = %reply_key, error = %e, "Failed to publish reply");
            }
        }
        Err(e) => error!(key = %reply_key, error = %e, "Failed to encode reply"),
    }
}

/// An empty payload is an empty request object.
fn parse_payload(payload: &[u8]) -> Result<Value> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Ok(json!({}));
    }
    decode_auto(payload).map_err(|e| Error::Parse(format!("undecodable request: {}", e)))
}

async fn publish_events(
    session: Session,
    keys: KeyExprBuilder,
    format: Format,
    mut events: mpsc::Receiver<SensorEvent>,
) {
    while let Some(event) = events.recv().await {
        let key = keys.event_key(&event.unit, &event.sensor);
        match encode(&event, format) {
            Ok(payload) => {
                if let Err(e) = session.put(&key, payload).await {
                    error!(key = %key, error = %e, "Failed to publish event");
                } else {
                    debug!(key = %key, value = %event.value, "Published");
                }
            }
            Err(e) => error!(key = %key, error = %e, "Failed to serialize event"),
        }
    }
}

async fn publish_status(
    session: &Session,
    keys: &KeyExprBuilder,
    dispatcher: &Dispatcher,
    status: &str,
) {
    let units: Vec<_> = dispatcher
        .directory()
        .units()
        .iter()
        .map(|u| u.uid().to_string())
        .collect();
    let payload = json!({
        "bridge": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "units": units,
        "status": status,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });
    if let Err(e) = session.put(keys.status_key(), payload.to_string()).await {
        error!(error = %e, "Failed to publish bridge status");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_shape() {
        let ok = Reply::from(Ok(json!(42)));
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({"status": "success", "response": 42})
        );

        let err = Reply::from(Err(Error::NotConnected("tcp://h:502".into())));
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["kind"], "not-connected");
    }

    #[test]
    fn test_parse_payload() {
        assert_eq!(parse_payload(b"").unwrap(), json!({}));
        assert_eq!(parse_payload(b"  \n").unwrap(), json!({}));
        assert_eq!(
            parse_payload(br#"{"action":"read"}"#).unwrap(),
            json!({"action": "read"})
        );
        assert!(matches!(parse_payload(b"\xff\x00garbage"), Err(Error::Parse(_))));
    }
}
