//! Transport glue: the duplex byte stream a scheduler owns.
//!
//! The core does not implement USB-HID or Bluetooth itself. Any
//! `AsyncRead + AsyncWrite` stream qualifies as a [`Transport`]; this
//! module ships the TCP dialer because it needs nothing beyond tokio.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::error::Ev3Error;

/// A duplex byte stream exclusively owned by one scheduler.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// The physical link a brick is reached over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Usb,
    Bluetooth,
    Tcp,
    Mock,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Usb => write!(f, "usb"),
            TransportKind::Bluetooth => write!(f, "bluetooth"),
            TransportKind::Tcp => write!(f, "tcp"),
            TransportKind::Mock => write!(f, "mock"),
        }
    }
}

// ── TCP ──────────────────────────────────────────────────────────

/// Default port of the brick's WiFi command server.
pub const DEFAULT_TCP_PORT: u16 = 5555;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpEndpoint {
    pub host: String,
    pub port: u16,
    /// Brick serial number; when set the WiFi unlock handshake is sent
    /// before any command traffic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
}

impl TcpEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            serial: None,
        }
    }

    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = Some(serial.into());
        self
    }

    /// Parse `host:port`, or a bare host using [`DEFAULT_TCP_PORT`].
    pub fn parse(s: &str) -> Result<Self, Ev3Error> {
        match s.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|e| Ev3Error::Other(format!("invalid port in {s:?}: {e}")))?;
                if host.is_empty() {
                    return Err(Ev3Error::Other(format!("missing host in {s:?}")));
                }
                Ok(Self::new(host, port))
            }
            None if !s.is_empty() => Ok(Self::new(s, DEFAULT_TCP_PORT)),
            None => Err(Ev3Error::Other("empty endpoint".into())),
        }
    }
}

impl fmt::Display for TcpEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Dial a brick over TCP, performing the unlock handshake when the
/// endpoint carries a serial number.
pub async fn connect_tcp(endpoint: &TcpEndpoint, timeout: Duration) -> Result<TcpStream, Ev3Error> {
    let addr = endpoint.to_string();
    debug!(%addr, "dialing brick");
    let mut stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| Ev3Error::Timeout(timeout))??;
    stream.set_nodelay(true)?;

    if let Some(serial) = &endpoint.serial {
        tokio::time::timeout(timeout, unlock(&mut stream, serial))
            .await
            .map_err(|_| Ev3Error::Timeout(timeout))??;
    }

    info!(%addr, "brick link established");
    Ok(stream)
}

async fn unlock(stream: &mut TcpStream, serial: &str) -> Result<(), Ev3Error> {
    let request = format!("GET /target?sn={serial} VMTP1.0\r\nProtocol: EV3\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    if !line.starts_with("Accept:") {
        return Err(Ev3Error::Transport(format!(
            "brick refused unlock: {:?}",
            line.trim_end()
        )));
    }
    // Drain the blank line terminating the response headers.
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 || line.trim().is_empty() {
            break;
        }
    }
    Ok(())
}
