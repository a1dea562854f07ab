//! Handle for a single Tuya device.
//! Each command opens its own session, runs one request and closes it again.

use crate::error::Result;
use crate::protocol::{CommandType, Version};
use crate::session::{CommandResponse, Session};
use log::debug;
use serde_json::Value;
use std::time::Duration;

/// Default Tuya local TCP port.
pub const DEFAULT_PORT: u16 = 6668;
/// DPS index of the primary relay on plugs and switches.
pub const RELAY_DP: u32 = 1;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Identifies one physical device. Immutable once built.
#[derive(Clone)]
pub struct Device {
    id: String,
    address: String,
    local_key: Vec<u8>,
    version: Version,
    port: u16,
    connect_timeout: Duration,
    timeout: Duration,
}

impl Device {
    /// Create a device handle with the default port and timeouts.
    pub fn new<I, A, K>(id: I, address: A, local_key: K, version: Version) -> Self
    where
        I: Into<String>,
        A: Into<String>,
        K: Into<Vec<u8>>,
    {
        Self {
            id: id.into(),
            address: address.into(),
            local_key: local_key.into(),
            version,
            port: DEFAULT_PORT,
            connect_timeout: DEFAULT_TIMEOUT,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn builder<I, K>(id: I, local_key: K) -> DeviceBuilder
    where
        I: Into<String>,
        K: Into<Vec<u8>>,
    {
        DeviceBuilder::new(id, local_key)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn local_key(&self) -> &[u8] {
        &self.local_key
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Deadline for each reply from the device.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Open a session for several requests over one connection.
    pub async fn connect(&self) -> Result<Session> {
        Session::open(self).await
    }
}

// -------------------------------------------------------------------------
// Device Control API
// -------------------------------------------------------------------------
impl Device {
    /// Queries the current status of the device.
    ///
    /// The reply holds the full property map, e.g. `{"dps": {"1": true}}`.
    pub async fn status(&self) -> Result<CommandResponse> {
        self.request(CommandType::DpQuery, None).await
    }

    /// Switches the primary relay (DPS 1).
    ///
    /// Returns the device's acknowledgement, or its status echo if the
    /// acknowledgement carries one.
    pub async fn set_relay(&self, on: bool) -> Result<CommandResponse> {
        self.set_value(RELAY_DP, Value::Bool(on)).await
    }

    pub async fn turn_on(&self) -> Result<CommandResponse> {
        self.set_relay(true).await
    }

    pub async fn turn_off(&self) -> Result<CommandResponse> {
        self.set_relay(false).await
    }

    /// Sets a single Data Point (DP) value on the device.
    ///
    /// # Arguments
    /// * `index` - The ID of the Data Point (e.g., 1 for power).
    /// * `value` - The new value (e.g., `json!(true)`).
    pub async fn set_value(&self, index: u32, value: Value) -> Result<CommandResponse> {
        self.set_dps(serde_json::json!({ index.to_string(): value }))
            .await
    }

    /// Sets multiple Data Points (DPs) on the device.
    ///
    /// # Arguments
    /// * `dps` - A JSON object containing DP IDs and their target values.
    pub async fn set_dps(&self, dps: Value) -> Result<CommandResponse> {
        self.request(CommandType::Control, Some(dps)).await
    }

    /// Sends a single command over a fresh session.
    ///
    /// The session is closed afterwards whether or not the request succeeded.
    /// Nothing is retried.
    pub async fn request(
        &self,
        command: CommandType,
        data: Option<Value>,
    ) -> Result<CommandResponse> {
        debug!("request: device={}, cmd={:?}, data={:?}", self.id, command, data);
        let mut session = self.connect().await?;
        let result = session.request(command, data).await;
        session.close().await;
        result
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("local_key", &"<redacted>")
            .field("version", &self.version)
            .field("port", &self.port)
            .finish()
    }
}

/// Builder for [`Device`] handles.
#[derive(Clone)]
pub struct DeviceBuilder {
    id: String,
    address: String,
    local_key: Vec<u8>,
    version: Version,
    port: u16,
    connect_timeout: Duration,
    timeout: Duration,
}

impl DeviceBuilder {
    pub fn new<I, K>(id: I, local_key: K) -> Self
    where
        I: Into<String>,
        K: Into<Vec<u8>>,
    {
        Self {
            id: id.into(),
            address: String::new(),
            local_key: local_key.into(),
            version: Version::V3_4,
            port: DEFAULT_PORT,
            connect_timeout: DEFAULT_TIMEOUT,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn address<A: Into<String>>(mut self, address: A) -> Self {
        self.address = address.into();
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Deadline for each reply from the device.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> Device {
        Device {
            id: self.id,
            address: self.address,
            local_key: self.local_key,
            version: self.version,
            port: self.port,
            connect_timeout: self.connect_timeout,
            timeout: self.timeout,
        }
    }
}
