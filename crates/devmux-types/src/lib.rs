//! Shared types for devmux components.
//!
//! This crate provides the types used across devmux-transport, devmux-daemon
//! and devmux-cli: channel type codes, device descriptors and the JSON
//! envelopes exchanged on tracking channels.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Sentinel pid meaning "no control server running on the device".
pub const NO_PID: i32 = -1;

/// Message type names used on tracking channels.
pub mod message_type {
    pub const HOSTS: &str = "HOSTS";
    pub const ERROR: &str = "ERROR";
    pub const DEVICE_LIST: &str = "devicelist";
    pub const DEVICE: &str = "device";
}

/// Request id used for unsolicited server messages.
pub const UNSOLICITED_ID: i64 = -1;

// ============================================================================
// Channel type codes
// ============================================================================

/// Fixed 4-byte ASCII identifier naming the middleware kind of a channel.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelCode([u8; 4]);

impl ChannelCode {
    /// Host tracker
    pub const HSTS: Self = Self(*b"HSTS");
    /// Android device tracker
    pub const GTRC: Self = Self(*b"GTRC");
    /// iOS device tracker
    pub const ATRC: Self = Self(*b"ATRC");
    /// Remote shell
    pub const SHEL: Self = Self(*b"SHEL");
    /// File listing
    pub const FSLS: Self = Self(*b"FSLS");
    /// Dev tools
    pub const DVTL: Self = Self(*b"DVTL");
    /// WebDriverAgent proxy
    pub const WDAP: Self = Self(*b"WDAP");
    /// QuickTime video stream
    pub const QVHS: Self = Self(*b"QVHS");

    /// Build a code from raw bytes. Every byte must be printable ASCII.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 4]) -> Option<Self> {
        bytes
            .iter()
            .all(u8::is_ascii_graphic)
            .then_some(Self(bytes))
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        // Validated as ASCII on construction
        std::str::from_utf8(&self.0).unwrap_or("????")
    }
}

impl fmt::Display for ChannelCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for ChannelCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelCode({})", self.as_str())
    }
}

/// Error returned when parsing a [`ChannelCode`] from a string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidChannelCode(pub String);

impl fmt::Display for InvalidChannelCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid channel code: {:?}", self.0)
    }
}

impl std::error::Error for InvalidChannelCode {}

impl FromStr for ChannelCode {
    type Err = InvalidChannelCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes: [u8; 4] = s
            .as_bytes()
            .try_into()
            .map_err(|_| InvalidChannelCode(s.to_string()))?;
        Self::from_bytes(bytes).ok_or_else(|| InvalidChannelCode(s.to_string()))
    }
}

// ============================================================================
// Devices
// ============================================================================

/// Device platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    #[default]
    Android,
    Ios,
}

impl Platform {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Android => "android",
            Platform::Ios => "ios",
        }
    }
}

/// Connection state as reported by the debug bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    Device,
    Offline,
    Unauthorized,
    Connecting,
    Authorizing,
    Recovery,
    #[serde(other)]
    Unknown,
}

impl DeviceState {
    /// Parse the state column of `adb devices` output.
    #[must_use]
    pub fn from_bridge(value: &str) -> Self {
        match value {
            "device" => Self::Device,
            "offline" => Self::Offline,
            "unauthorized" => Self::Unauthorized,
            "connecting" => Self::Connecting,
            "authorizing" => Self::Authorizing,
            "recovery" => Self::Recovery,
            _ => Self::Unknown,
        }
    }
}

/// Whether a device has a control server running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Active,
    Inactive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetInterface {
    pub name: String,
    pub ipv4: String,
}

/// The registry's record of one tracked device.
///
/// Platform properties (`ro.product.model`, `ro.build.version.release`, ...)
/// are flattened into the top-level JSON object, matching the keys the
/// browser reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub udid: String,

    #[serde(default)]
    pub platform: Platform,

    pub state: DeviceState,

    pub pid: i32,

    #[serde(rename = "last.update.timestamp")]
    pub last_update: i64,

    #[serde(default)]
    pub interfaces: Vec<NetInterface>,

    #[serde(flatten)]
    pub properties: BTreeMap<String, String>,
}

impl DeviceDescriptor {
    #[must_use]
    pub fn new(udid: impl Into<String>, state: DeviceState) -> Self {
        Self {
            udid: udid.into(),
            platform: Platform::Android,
            state,
            pid: NO_PID,
            last_update: 0,
            interfaces: Vec::new(),
            properties: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn activity(&self) -> Activity {
        if self.pid == NO_PID {
            Activity::Inactive
        } else {
            Activity::Active
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.activity() == Activity::Active
    }

    #[must_use]
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// True when state, pid, interfaces or properties differ.
    /// The update timestamp alone is not a material change.
    #[must_use]
    pub fn differs_materially(&self, other: &Self) -> bool {
        self.state != other.state
            || self.pid != other.pid
            || self.interfaces != other.interfaces
            || self.properties != other.properties
    }
}

// ============================================================================
// Tracking channel envelopes
// ============================================================================

/// Generic `{id, type, data}` envelope carried on tracking channels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl Message {
    #[must_use]
    pub fn new(id: i64, kind: impl Into<String>, data: Value) -> Self {
        Self {
            id,
            kind: kind.into(),
            data,
        }
    }

    #[must_use]
    pub fn error(text: impl Into<String>) -> Self {
        Self::new(
            UNSOLICITED_ID,
            message_type::ERROR,
            Value::String(text.into()),
        )
    }

    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn hosts(data: &HostsData) -> serde_json::Result<Self> {
        Ok(Self::new(
            UNSOLICITED_ID,
            message_type::HOSTS,
            serde_json::to_value(data)?,
        ))
    }

    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn device_list(data: &DeviceListData) -> serde_json::Result<Self> {
        Ok(Self::new(
            UNSOLICITED_ID,
            message_type::DEVICE_LIST,
            serde_json::to_value(data)?,
        ))
    }

    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn device(data: &DeviceEventData) -> serde_json::Result<Self> {
        Ok(Self::new(
            UNSOLICITED_ID,
            message_type::DEVICE,
            serde_json::to_value(data)?,
        ))
    }

    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn command_result(
        id: i64,
        kind: impl Into<String>,
        result: &CommandResult,
    ) -> serde_json::Result<Self> {
        Ok(Self::new(id, kind, serde_json::to_value(result)?))
    }
}

/// Tracker type advertised by the host tracker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalHost {
    #[serde(rename = "type")]
    pub kind: String,
}

/// A remote host the browser may connect to directly
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteHost {
    #[serde(rename = "type")]
    pub kind: String,
    pub secure: bool,
    pub hostname: String,
    pub port: u16,
    #[serde(default)]
    pub pathname: String,
    #[serde(default)]
    pub use_proxy: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostsData {
    #[serde(default)]
    pub local: Vec<LocalHost>,
    #[serde(default)]
    pub remote: Vec<RemoteHost>,
}

/// Full snapshot sent to a freshly bound tracker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceListData {
    pub id: String,
    pub name: String,
    pub list: Vec<DeviceDescriptor>,
}

/// Incremental update for a single device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEventData {
    pub id: String,
    pub name: String,
    pub device: DeviceDescriptor,
}

// ============================================================================
// Commands
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddDeviceData {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdidData {
    pub udid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillServerData {
    pub udid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
}

/// Commands accepted on a device tracking channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerCommand {
    AddDevice(AddDeviceData),
    DeleteDevice(UdidData),
    StartServer(UdidData),
    KillServer(KillServerData),
    UpdateInterfaces(UdidData),
}

impl TrackerCommand {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            TrackerCommand::AddDevice(_) => "ADD_DEVICE",
            TrackerCommand::DeleteDevice(_) => "DELETE_DEVICE",
            TrackerCommand::StartServer(_) => "start_server",
            TrackerCommand::KillServer(_) => "kill_server",
            TrackerCommand::UpdateInterfaces(_) => "update_interfaces",
        }
    }

    /// Type name of the correlated result message.
    #[must_use]
    pub fn result_kind(&self) -> String {
        format!("{}_RESULT", self.kind().to_ascii_uppercase())
    }

    #[must_use]
    pub fn udid(&self) -> Option<&str> {
        match self {
            TrackerCommand::AddDevice(_) => None,
            TrackerCommand::DeleteDevice(d)
            | TrackerCommand::StartServer(d)
            | TrackerCommand::UpdateInterfaces(d) => Some(&d.udid),
            TrackerCommand::KillServer(d) => Some(&d.udid),
        }
    }

    fn data(&self) -> serde_json::Result<Value> {
        match self {
            TrackerCommand::AddDevice(d) => serde_json::to_value(d),
            TrackerCommand::DeleteDevice(d)
            | TrackerCommand::StartServer(d)
            | TrackerCommand::UpdateInterfaces(d) => serde_json::to_value(d),
            TrackerCommand::KillServer(d) => serde_json::to_value(d),
        }
    }
}

/// A command together with its caller-supplied correlation id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEnvelope {
    pub id: i64,
    pub command: TrackerCommand,
}

/// Outcome of decoding an inbound tracking channel message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedCommand {
    Known(CommandEnvelope),
    Unknown { id: i64, kind: String },
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(default)]
    id: Option<i64>,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

impl CommandEnvelope {
    #[must_use]
    pub fn new(id: i64, command: TrackerCommand) -> Self {
        Self { id, command }
    }

    /// Decode a JSON text message into a command.
    ///
    /// A missing id becomes [`UNSOLICITED_ID`]. Unknown `type` values decode to
    /// [`DecodedCommand::Unknown`] instead of failing.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a JSON envelope or the `data` of a
    /// known command does not match its shape.
    pub fn decode(text: &str) -> serde_json::Result<DecodedCommand> {
        let raw: RawEnvelope = serde_json::from_str(text)?;
        let id = raw.id.unwrap_or(UNSOLICITED_ID);

        let command = match raw.kind.as_str() {
            "ADD_DEVICE" => TrackerCommand::AddDevice(serde_json::from_value(raw.data)?),
            "DELETE_DEVICE" => TrackerCommand::DeleteDevice(serde_json::from_value(raw.data)?),
            "start_server" => TrackerCommand::StartServer(serde_json::from_value(raw.data)?),
            "kill_server" => TrackerCommand::KillServer(serde_json::from_value(raw.data)?),
            "update_interfaces" => {
                TrackerCommand::UpdateInterfaces(serde_json::from_value(raw.data)?)
            }
            _ => {
                return Ok(DecodedCommand::Unknown { id, kind: raw.kind });
            }
        };

        Ok(DecodedCommand::Known(CommandEnvelope { id, command }))
    }

    /// # Errors
    ///
    /// Returns an error if the command data cannot be serialized.
    pub fn to_message(&self) -> serde_json::Result<Message> {
        Ok(Message::new(self.id, self.command.kind(), self.command.data()?))
    }
}

/// Payload of a `<TYPE>_RESULT` message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CommandResult {
    #[must_use]
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_udid(mut self, udid: impl Into<String>) -> Self {
        self.udid = Some(udid.into());
        self
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Server-to-client tracking messages, decoded by clients
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerUpdate {
    Hosts(HostsData),
    Error(String),
    DeviceList(DeviceListData),
    Device(DeviceEventData),
    CommandResult {
        id: i64,
        kind: String,
        result: CommandResult,
    },
    Unknown(String),
}

impl TrackerUpdate {
    /// # Errors
    ///
    /// Returns an error if the `data` of a known message kind is malformed.
    pub fn from_message(message: Message) -> serde_json::Result<Self> {
        let update = match message.kind.as_str() {
            message_type::HOSTS => TrackerUpdate::Hosts(serde_json::from_value(message.data)?),
            message_type::ERROR => TrackerUpdate::Error(serde_json::from_value(message.data)?),
            message_type::DEVICE_LIST => {
                TrackerUpdate::DeviceList(serde_json::from_value(message.data)?)
            }
            message_type::DEVICE => TrackerUpdate::Device(serde_json::from_value(message.data)?),
            kind if kind.ends_with("_RESULT") => TrackerUpdate::CommandResult {
                id: message.id,
                kind: message.kind.clone(),
                result: serde_json::from_value(message.data)?,
            },
            _ => TrackerUpdate::Unknown(message.kind),
        };
        Ok(update)
    }
}

// ============================================================================
// Saved devices (REST API)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedDevice {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_connected: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuickConnectRequest {
    pub name: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickConnectResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
