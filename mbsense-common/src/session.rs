use zenoh::Session;

use crate::config::ZenohConfig;
use crate::error::{Error, Result};

/// Translate a [`ZenohConfig`] into a native Zenoh configuration.
pub fn build_config(config: &ZenohConfig) -> Result<zenoh::Config> {
    if !matches!(config.mode.as_str(), "client" | "peer" | "router") {
        return Err(Error::Config(format!(
            "Invalid Zenoh mode '{}', expected client, peer or router",
            config.mode
        )));
    }

    let mut native = zenoh::Config::default();
    insert(&mut native, "mode", &config.mode)?;
    if !config.connect.is_empty() {
        insert(&mut native, "connect/endpoints", &config.connect)?;
    }
    if !config.listen.is_empty() {
        insert(&mut native, "listen/endpoints", &config.listen)?;
    }
    Ok(native)
}

fn insert<T: serde::Serialize + ?Sized>(
    native: &mut zenoh::Config,
    key: &str,
    value: &T,
) -> Result<()> {
    let json = serde_json::to_string(value)?;
    native
        .insert_json5(key, &json)
        .map_err(|e| Error::Config(format!("Failed to set '{}': {}", key, e)))
}

/// Open a Zenoh session using the provided configuration.
pub async fn connect(config: &ZenohConfig) -> Result<Session> {
    let native = build_config(config)?;

    tracing::info!(
        mode = %config.mode,
        connect = ?config.connect,
        listen = ?config.listen,
        "Opening Zenoh session"
    );

    let session = zenoh::open(native).await?;
    tracing::info!(zid = %session.zid(), "Zenoh session open");
    Ok(session)
}
