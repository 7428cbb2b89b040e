//! Modbus links (serial RTU or TCP) and serialized access to them.
//!
//! A [`Transport`] owns at most one open `tokio-modbus` context. Every
//! request goes through a [`TransportScope`] obtained from
//! [`Transport::acquire`], which holds the link for the whole request and
//! applies the unit's slave settings first.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tokio_modbus::client::{Client, Context};
use tokio_modbus::prelude::*;
use tokio_modbus::slave::SlaveContext;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};

/// Default serial speed when the uri carries none.
pub const DEFAULT_BAUD: u32 = 19200;

/// Default Modbus TCP port.
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Response timeout used when a unit does not configure one.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(1000);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const TTY_SCHEME: &str = "tty://";
const TCP_SCHEME: &str = "tcp://";

/// Where a link connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Serial line, 8N1.
    Serial { device: String, baud: u32 },
    /// TCP socket.
    Tcp { host: String, port: u16 },
}

impl Endpoint {
    /// Parse `tty://<device>[:<baud>]` or `tcp://<host>[:<port>]`.
    ///
    /// The scheme is matched case-insensitively. For serial uris the device
    /// path keeps the slash that follows the scheme, so `tty://dev/ttyUSB0`
    /// names `/dev/ttyUSB0`.
    pub fn parse(uri: &str) -> Result<Self> {
        if let Some(rest) = strip_scheme(uri, TTY_SCHEME) {
            let (path, baud) = split_suffix(rest, DEFAULT_BAUD, uri)?;
            if path.is_empty() {
                return Err(Error::Parse(format!("missing tty device in '{}'", uri)));
            }
            Ok(Endpoint::Serial {
                device: format!("/{}", path.trim_start_matches('/')),
                baud,
            })
        } else if let Some(rest) = strip_scheme(uri, TCP_SCHEME) {
            let (host, port) = split_suffix(rest, DEFAULT_TCP_PORT, uri)?;
            if host.is_empty() {
                return Err(Error::Parse(format!("missing host in '{}'", uri)));
            }
            Ok(Endpoint::Tcp {
                host: host.to_string(),
                port,
            })
        } else {
            Err(Error::Parse(format!(
                "unsupported uri '{}' (expected tty:// or tcp://)",
                uri
            )))
        }
    }

    /// Serial lines cannot carry two requests at once.
    pub fn is_exclusive(&self) -> bool {
        matches!(self, Endpoint::Serial { .. })
    }

    async fn open(&self) -> Result<Context> {
        match self {
            Endpoint::Serial { device, baud } => {
                let builder = tokio_serial::new(device, *baud)
                    .parity(tokio_serial::Parity::None)
                    .data_bits(tokio_serial::DataBits::Eight)
                    .stop_bits(tokio_serial::StopBits::One);
                let serial = tokio_serial::SerialStream::open(&builder).map_err(|e| {
                    Error::Connection(format!("failed to open {}: {}", device, e))
                })?;
                Ok(rtu::attach(serial))
            }
            Endpoint::Tcp { host, port } => {
                let addr = resolve(host, *port).await?;
                tokio::time::timeout(CONNECT_TIMEOUT, tcp::connect(addr))
                    .await
                    .map_err(|_| Error::Connection(format!("connect to {} timed out", addr)))?
                    .map_err(|e| Error::Connection(format!("connect to {}: {}", addr, e)))
            }
        }
    }
}

fn strip_scheme<'a>(uri: &'a str, scheme: &str) -> Option<&'a str> {
    let head = uri.get(..scheme.len())?;
    head.eq_ignore_ascii_case(scheme).then(|| &uri[scheme.len()..])
}

fn split_suffix<'a, T: std::str::FromStr>(
    rest: &'a str,
    default: T,
    uri: &str,
) -> Result<(&'a str, T)> {
    match rest.rsplit_once(':') {
        Some((head, tail)) => tail
            .parse()
            .map(|value| (head, value))
            .map_err(|_| Error::Parse(format!("invalid number '{}' in '{}'", tail, uri))),
        None => Ok((rest, default)),
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| Error::Connection(format!("cannot resolve {}: {}", host, e)))?
        .next()
        .ok_or_else(|| Error::Connection(format!("no address for {}", host)))
}

/// Per-unit settings applied to the link before each request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Station {
    pub slave: Option<u8>,
    pub timeout: Duration,
    pub debug: bool,
}

impl Default for Station {
    fn default() -> Self {
        Self {
            slave: None,
            timeout: DEFAULT_RESPONSE_TIMEOUT,
            debug: false,
        }
    }
}

struct Link {
    uri: Option<String>,
    endpoint: Option<Endpoint>,
    ctx: Option<Context>,
    /// Dropped after a failure; reopened by the next request. Only an
    /// explicit disconnect clears it.
    lost: bool,
    /// A serial reply may still be in flight from an abandoned request.
    stale: bool,
}

impl Link {
    fn describe(&self) -> &str {
        self.uri.as_deref().unwrap_or("<none>")
    }

    fn is_serial(&self) -> bool {
        self.endpoint.as_ref().is_some_and(Endpoint::is_exclusive)
    }

    async fn close(&mut self) {
        if let Some(mut ctx) = self.ctx.take() {
            if let Err(e) = ctx.disconnect().await {
                debug!(uri = %self.describe(), error = %e, "Error while closing link");
            }
        }
        self.stale = false;
    }

    async fn open(&mut self) -> Result<()> {
        let endpoint = self
            .endpoint
            .clone()
            .ok_or_else(|| Error::Connection("no uri configured".to_string()))?;
        self.ctx = Some(endpoint.open().await?);
        self.lost = false;
        self.stale = false;
        Ok(())
    }

    /// Close and reopen. On failure the link is left lost.
    async fn reconnect(&mut self) -> Result<()> {
        info!(uri = %self.describe(), "Reconnecting");
        self.close().await;
        self.lost = true;
        self.open().await.inspect_err(|e| {
            warn!(uri = %self.describe(), error = %e, "Reconnect failed");
        })
    }
}

/// A serial or TCP Modbus link shared by one or more units.
pub struct Transport {
    link: Mutex<Link>,
    shared: bool,
}

impl Transport {
    /// Create a closed transport. The uri is parsed eagerly so that a
    /// malformed one is reported at configuration time.
    pub fn new(uri: Option<&str>, shared: bool) -> Result<Self> {
        let endpoint = uri.map(Endpoint::parse).transpose()?;
        Ok(Self {
            link: Mutex::new(Link {
                uri: uri.map(str::to_string),
                endpoint,
                ctx: None,
                lost: false,
                stale: false,
            }),
            shared,
        })
    }

    /// True when requests must be strictly serialized on the medium: serial
    /// lines and transports shared across units.
    pub async fn is_exclusive(&self) -> bool {
        self.shared || self.link.lock().await.is_serial()
    }

    /// True when the transport is shared by several units.
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    pub async fn uri(&self) -> Option<String> {
        self.link.lock().await.uri.clone()
    }

    /// True while connected, including a lost link waiting to be reopened.
    pub async fn is_open(&self) -> bool {
        let link = self.link.lock().await;
        link.ctx.is_some() || link.lost
    }

    /// True when a connection handle is currently held.
    pub async fn is_attached(&self) -> bool {
        self.link.lock().await.ctx.is_some()
    }

    /// Open the configured endpoint.
    pub async fn connect(&self) -> Result<()> {
        let mut link = self.link.lock().await;
        if link.ctx.is_some() {
            return Err(Error::Connection(format!(
                "already connected to {}",
                link.describe()
            )));
        }
        link.open().await?;
        info!(uri = %link.describe(), "Connected");
        Ok(())
    }

    /// Replace the endpoint with `uri` and open it.
    pub async fn connect_to(&self, uri: &str) -> Result<()> {
        let endpoint = Endpoint::parse(uri)?;
        let mut link = self.link.lock().await;
        if link.ctx.is_some() {
            return Err(Error::Connection(format!(
                "already connected to {}",
                link.describe()
            )));
        }
        link.uri = Some(uri.to_string());
        link.endpoint = Some(endpoint);
        link.open().await?;
        info!(uri = %uri, "Connected");
        Ok(())
    }

    /// Release the connection handle. Requests fail with
    /// [`Error::NotConnected`] until the next connect.
    pub async fn disconnect(&self) {
        let mut link = self.link.lock().await;
        if link.ctx.is_some() || link.lost {
            link.close().await;
            link.lost = false;
            info!(uri = %link.describe(), "Disconnected");
        }
    }

    /// Take exclusive use of the link for one request.
    ///
    /// Fails with [`Error::NotConnected`] after a disconnect. A lost link is
    /// reopened first, and so is a serial link left stale by an abandoned
    /// request, so that a late reply cannot be read as the answer to the new
    /// request.
    pub async fn acquire(&self, station: Station) -> Result<TransportScope<'_>> {
        let link = self.link.lock().await;
        if link.ctx.is_none() && !link.lost {
            return Err(Error::NotConnected(link.describe().to_string()));
        }
        let mut scope = TransportScope { link, station };
        scope.flush().await?;
        scope.select();
        Ok(scope)
    }
}

/// Exclusive hold on a [`Transport`]; released when dropped.
pub struct TransportScope<'a> {
    link: MutexGuard<'a, Link>,
    station: Station,
}

impl TransportScope<'_> {
    async fn flush(&mut self) -> Result<()> {
        if self.link.ctx.is_none() {
            self.link.reconnect().await?;
        } else if self.link.stale {
            debug!(uri = %self.link.describe(), "Discarding stale serial link");
            self.link.reconnect().await?;
        }
        Ok(())
    }

    fn select(&mut self) {
        if let (Some(ctx), Some(slave)) = (self.link.ctx.as_mut(), self.station.slave) {
            ctx.set_slave(Slave(slave));
        }
    }

    /// Issue one request and wait for its reply.
    ///
    /// A connection-fatal I/O failure triggers one reconnect; the request
    /// itself is reported as failed. Timeouts and exceptions leave the link
    /// open.
    pub async fn call(&mut self, request: Request<'static>) -> Result<Response> {
        if self.station.debug {
            debug!(uri = %self.link.describe(), ?request, "Modbus request");
        } else {
            trace!(uri = %self.link.describe(), ?request, "Modbus request");
        }

        let result = self.attempt(request).await;

        if let Err(e) = &result {
            if e.is_fatal() {
                warn!(uri = %self.link.describe(), error = %e, "Link lost");
                if self.link.reconnect().await.is_ok() {
                    self.select();
                }
            }
        }
        result
    }

    async fn attempt(&mut self, request: Request<'static>) -> Result<Response> {
        let timeout = self.station.timeout;
        let Some(ctx) = self.link.ctx.as_mut() else {
            return Err(Error::NotConnected(self.link.describe().to_string()));
        };

        let outcome = tokio::time::timeout(timeout, ctx.call(request)).await;
        match outcome {
            Err(_) => {
                // TCP replies carry a transaction id; only serial framing can
                // pair a late reply with the next request.
                self.link.stale = self.link.is_serial();
                Err(Error::Timeout(timeout))
            }
            Ok(Err(e)) => Err(Error::from(e)),
            Ok(Ok(Err(code))) => Err(Error::Exception(code)),
            Ok(Ok(Ok(response))) => Ok(response),
        }
    }

    /// Probe the device with "report server id".
    ///
    /// A device that answers `IllegalFunction` does not implement the request
    /// but is reachable.
    pub async fn report_server_id(&mut self) -> Result<bool> {
        match self.call(Request::ReportServerId).await {
            Ok(Response::ReportServerId(..)) => Ok(true),
            Ok(other) => Err(Error::Connection(format!(
                "unexpected reply {:?}",
                other
            ))),
            Err(Error::Exception(ExceptionCode::IllegalFunction)) => Ok(true),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tty() {
        assert_eq!(
            Endpoint::parse("tty://dev/ttyUSB0:9600").unwrap(),
            Endpoint::Serial {
                device: "/dev/ttyUSB0".into(),
                baud: 9600
            }
        );
        assert_eq!(
            Endpoint::parse("TTY://dev/ttyS1").unwrap(),
            Endpoint::Serial {
                device: "/dev/ttyS1".into(),
                baud: DEFAULT_BAUD
            }
        );
    }

    #[test]
    fn test_parse_tcp() {
        assert_eq!(
            Endpoint::parse("tcp://192.168.1.10:5020").unwrap(),
            Endpoint::Tcp {
                host: "192.168.1.10".into(),
                port: 5020
            }
        );
        assert_eq!(
            Endpoint::parse("tcp://plc.local").unwrap(),
            Endpoint::Tcp {
                host: "plc.local".into(),
                port: DEFAULT_TCP_PORT
            }
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(Endpoint::parse("udp://h:1"), Err(Error::Parse(_))));
        assert!(matches!(Endpoint::parse("tcp://h:notaport"), Err(Error::Parse(_))));
        assert!(matches!(Endpoint::parse("tcp://:502"), Err(Error::Parse(_))));
        assert!(matches!(Endpoint::parse("tty://"), Err(Error::Parse(_))));
        assert!(matches!(Endpoint::parse("tty://dev/ttyUSB0:fast"), Err(Error::Parse(_))));
    }

    #[test]
    fn test_exclusive_medium() {
        assert!(Endpoint::parse("tty://dev/ttyUSB0").unwrap().is_exclusive());
        assert!(!Endpoint::parse("tcp://h").unwrap().is_exclusive());
    }

    #[tokio::test]
    async fn test_lost_link_is_retried_on_acquire() {
        let transport = Transport::new(Some("tcp://127.0.0.1:1"), false).unwrap();
        transport.link.lock().await.lost = true;
        assert!(transport.is_open().await);

        // Nothing listens on port 1: the reopen fails but the link stays lost.
        assert!(matches!(
            transport.acquire(Station::default()).await,
            Err(Error::Connection(_))
        ));
        assert!(transport.is_open().await);
        assert!(!transport.is_attached().await);

        transport.disconnect().await;
        assert!(matches!(
            transport.acquire(Station::default()).await,
            Err(Error::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_acquire_when_closed() {
        let transport = Transport::new(Some("tcp://127.0.0.1:1502"), false).unwrap();
        assert!(!transport.is_open().await);
        assert!(matches!(
            transport.acquire(Station::default()).await,
            Err(Error::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_shared_transport_is_exclusive() {
        let transport = Transport::new(Some("tcp://127.0.0.1:1502"), true).unwrap();
        assert!(transport.is_exclusive().await);
        assert_eq!(transport.uri().await.as_deref(), Some("tcp://127.0.0.1:1502"));
    }

    #[test]
    fn test_rejects_bad_uri_at_construction() {
        assert!(matches!(
            Transport::new(Some("serial:/dev/ttyUSB0"), false),
            Err(Error::Parse(_))
        ));
    }
}
