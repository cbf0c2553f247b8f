//! Instrument access for the polling core.
//!
//! An [`InstrumentPort`] is the blocking request/response surface of one connected
//! multimeter. The scheduler never touches a port directly; it goes through a
//! [`Connection`], which owns the port behind a mutex and runs every call on
//! Tokio's blocking pool so a slow instrument never stalls an async task.
//!
//! ## Addresses
//!
//! [`connect`] understands the following address forms:
//!
//! - `sim://dmm` or `sim://open`: an in-process [`MockMultimeter`] (the `open`
//!   profile reports an open resistance input, i.e. overload)
//! - `TCPIP0::192.168.1.50::5025::SOCKET`: raw SCPI over TCP (LXI socket)
//! - `192.168.1.50:5025` or `192.168.1.50`: same, port 5025 when omitted
//! - `[fe80::1]:5025` or `[fe80::1]`: IPv6 literals must be bracketed

pub mod mock;
pub mod scpi;
pub mod socket;

pub use mock::MockMultimeter;
pub use scpi::{InputImpedance, ScpiMultimeter, ScpiTransport};
pub use socket::SocketTransport;

use crate::config::InstrumentSettings;
use crate::error::{ConnectError, ControlError, MeasurementError};
use crate::measurement::MeasurementKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Default TCP port of the SCPI raw socket service.
pub const SCPI_SOCKET_PORT: u16 = 5025;

/// Blocking request/response interface of a connected multimeter.
///
/// Implementations are driven from a single thread at a time; the [`Connection`]
/// guarantees exclusive access.
pub trait InstrumentPort: Send {
    /// Take one reading of the given function.
    fn measure(&mut self, kind: MeasurementKind) -> Result<f64, MeasurementError>;

    /// Send a raw SCPI command. Commands containing `?` are queries and return
    /// the instrument's response; anything else is written and returns `None`.
    fn send_raw(&mut self, command: &str) -> Result<Option<String>, MeasurementError> {
        Err(MeasurementError::Transport(format!(
            "raw command '{}' not supported by this instrument",
            command
        )))
    }

    /// Query `*IDN?` and parse the identity string.
    fn identify(&mut self) -> Result<InstrumentIdentity, MeasurementError> {
        let response = self
            .send_raw("*IDN?")?
            .ok_or_else(|| MeasurementError::MalformedResponse(String::new()))?;
        InstrumentIdentity::parse(&response)
    }

    /// Hand the front panel back to the operator after remote operation.
    fn return_to_local(&mut self) -> Result<(), MeasurementError> {
        Ok(())
    }

    /// Close the underlying transport. Further calls fail with `Transport`.
    fn disconnect(&mut self) -> Result<(), MeasurementError>;
}

/// Parsed `*IDN?` response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentIdentity {
    /// Manufacturer name
    pub manufacturer: String,
    /// Model number
    pub model: String,
    /// Serial number, `0` if not reported
    pub serial: String,
    /// Firmware revision string
    pub firmware: String,
}

impl InstrumentIdentity {
    /// Parse the four comma-separated IEEE 488.2 identity fields.
    pub fn parse(response: &str) -> Result<Self, MeasurementError> {
        let fields: Vec<&str> = response.trim().split(',').map(str::trim).collect();
        match fields.as_slice() {
            [manufacturer, model, serial, firmware] => Ok(Self {
                manufacturer: manufacturer.to_string(),
                model: model.to_string(),
                serial: serial.to_string(),
                firmware: firmware.to_string(),
            }),
            _ => Err(MeasurementError::MalformedResponse(response.trim().to_string())),
        }
    }
}

impl fmt::Display for InstrumentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} (serial {}, firmware {})",
            self.manufacturer, self.model, self.serial, self.firmware
        )
    }
}

struct ConnectionInner {
    address: String,
    port: Arc<Mutex<Box<dyn InstrumentPort>>>,
    usable: AtomicBool,
}

/// Shared handle to one connected instrument.
///
/// Cloning is cheap; all clones refer to the same port. A connection becomes
/// unusable when a polling session had to be abandoned while an instrument call
/// was still in flight, after which it must be replaced by a fresh [`connect`].
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Wrap an opened port. The connection starts out usable.
    pub fn new(address: impl Into<String>, port: Box<dyn InstrumentPort>) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                address: address.into(),
                port: Arc::new(Mutex::new(port)),
                usable: AtomicBool::new(true),
            }),
        }
    }

    /// Address the connection was opened with.
    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// False once a forced stop abandoned a call on this connection.
    pub fn is_usable(&self) -> bool {
        self.inner.usable.load(Ordering::Acquire)
    }

    /// Flag the connection as needing a reconnect.
    pub fn mark_unusable(&self) {
        if self.inner.usable.swap(false, Ordering::AcqRel) {
            warn!(
                "Connection to '{}' marked unusable; reconnect required",
                self.inner.address
            );
        }
    }

    /// Run `f` against the port on the blocking pool, waiting for exclusive access.
    pub(crate) async fn run_blocking<T, F>(&self, f: F) -> Result<T, MeasurementError>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn InstrumentPort) -> Result<T, MeasurementError> + Send + 'static,
    {
        let port = self.inner.port.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = port.blocking_lock();
            f(guard.as_mut())
        })
        .await
        .map_err(|e| MeasurementError::Transport(format!("instrument call panicked: {}", e)))?
    }

    /// Like [`run_blocking`](Self::run_blocking), but fails with `Busy` instead of
    /// waiting when another request holds the port.
    pub(crate) async fn try_run_blocking<T, F>(&self, f: F) -> Result<T, ControlError>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn InstrumentPort) -> Result<T, MeasurementError> + Send + 'static,
    {
        if !self.is_usable() {
            return Err(ControlError::NeedsReconnect);
        }
        let mut guard = self
            .inner
            .port
            .clone()
            .try_lock_owned()
            .map_err(|_| ControlError::Busy)?;
        let result = tokio::task::spawn_blocking(move || f(guard.as_mut()))
            .await
            .map_err(|e| MeasurementError::Transport(format!("instrument call panicked: {}", e)))?;
        Ok(result?)
    }

    /// Close the port if nothing else is using it.
    pub async fn disconnect(&self) -> Result<(), ControlError> {
        let address = self.inner.address.clone();
        self.try_run_blocking(|port| port.disconnect()).await?;
        info!("Disconnected from '{}'", address);
        Ok(())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.inner.address)
            .field("usable", &self.is_usable())
            .finish()
    }
}

/// Parsed form of an instrument address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InstrumentAddress {
    /// `sim://<profile>`
    Mock {
        /// Mock profile: `dmm`, `open` or `noisy`
        profile: String,
    },
    /// Raw SCPI socket
    Socket {
        /// Hostname or IP literal, IPv6 without brackets
        host: String,
        /// TCP port
        port: u16,
    },
}

impl InstrumentAddress {
    /// Parse any of the address forms listed in the module docs.
    pub fn parse(address: &str) -> Result<Self, ConnectError> {
        let trimmed = address.trim();
        let unsupported = || ConnectError::UnsupportedAddress(trimmed.to_string());

        if let Some(profile) = trimmed.strip_prefix("sim://") {
            let profile = if profile.is_empty() { "dmm" } else { profile };
            return Ok(InstrumentAddress::Mock {
                profile: profile.to_string(),
            });
        }

        if trimmed.to_ascii_uppercase().starts_with("TCPIP") {
            let parts: Vec<&str> = trimmed.split("::").collect();
            return match parts.as_slice() {
                [_, host, port, class] if class.eq_ignore_ascii_case("SOCKET") => {
                    let port = port.parse().map_err(|_| unsupported())?;
                    Ok(InstrumentAddress::Socket {
                        host: host.to_string(),
                        port,
                    })
                }
                _ => Err(unsupported()),
            };
        }

        if let Some(bracketed) = trimmed.strip_prefix('[') {
            let (host, rest) = bracketed.split_once(']').ok_or_else(unsupported)?;
            if host.parse::<Ipv6Addr>().is_err() {
                return Err(unsupported());
            }
            let port = match rest {
                "" => SCPI_SOCKET_PORT,
                _ => rest
                    .strip_prefix(':')
                    .and_then(|port| port.parse().ok())
                    .ok_or_else(unsupported)?,
            };
            return Ok(InstrumentAddress::Socket {
                host: host.to_string(),
                port,
            });
        }

        // A bare IPv6 literal cannot be told apart from a port suffix.
        if trimmed.is_empty() || trimmed.matches(':').count() > 1 {
            return Err(unsupported());
        }

        match trimmed.rsplit_once(':') {
            Some((host, port)) => Ok(InstrumentAddress::Socket {
                host: host.to_string(),
                port: port.parse().map_err(|_| unsupported())?,
            }),
            None => Ok(InstrumentAddress::Socket {
                host: trimmed.to_string(),
                port: SCPI_SOCKET_PORT,
            }),
        }
    }
}

/// Open a connection to the multimeter at `address`.
///
/// The instrument is identified with `*IDN?` and the integration aperture and
/// input impedance from `settings` are applied before the connection is returned.
///
/// ```
/// # tokio_test::block_on(async {
/// use dmm_daq::config::InstrumentSettings;
///
/// let connection = dmm_daq::instrument::connect("sim://dmm", &InstrumentSettings::default()).await?;
/// assert!(connection.is_usable());
/// # Ok::<(), dmm_daq::error::ConnectError>(())
/// # }).unwrap();
/// ```
pub async fn connect(
    address: &str,
    settings: &InstrumentSettings,
) -> Result<Connection, ConnectError> {
    let parsed = InstrumentAddress::parse(address)?;
    if let Some(nplc) = settings.nplc {
        if scpi::aperture_command(nplc).is_none() {
            return Err(ConnectError::InvalidSetting(format!(
                "integration time {} PLC is not supported",
                nplc
            )));
        }
    }
    info!("Connecting to multimeter at '{}'", address);

    let port: Box<dyn InstrumentPort> = match parsed {
        InstrumentAddress::Mock { profile } => Box::new(MockMultimeter::with_profile(&profile)),
        InstrumentAddress::Socket { host, port } => {
            let timeout = Duration::from_millis(settings.timeout_ms);
            let terminator = settings.line_terminator.clone();
            let nplc = settings.nplc;
            let impedance = settings.input_impedance;
            let address_owned = address.to_string();

            tokio::task::spawn_blocking(move || {
                let transport = SocketTransport::connect(&host, port, timeout, &terminator)
                    .map_err(|source| ConnectError::Io {
                        address: address_owned.clone(),
                        source,
                    })?;
                let mut meter = ScpiMultimeter::new(transport);
                meter
                    .apply_settings(nplc, impedance)
                    .map_err(|source| ConnectError::Handshake {
                        address: address_owned,
                        source,
                    })?;
                Ok::<Box<dyn InstrumentPort>, ConnectError>(Box::new(meter))
            })
            .await
            .map_err(|e| ConnectError::Io {
                address: address.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
            })??
        }
    };

    let connection = Connection::new(address, port);
    let identity = connection
        .run_blocking(|port| port.identify())
        .await
        .map_err(|source| ConnectError::Handshake {
            address: address.to_string(),
            source,
        })?;
    info!("Connected to {}", identity);
    debug!(?identity, "Instrument identity");
    Ok(connection)
}
