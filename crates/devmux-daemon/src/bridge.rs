//! Debug-bridge client.
//!
//! [`Bridge`] is the seam between the registry and the device daemon. The
//! shipped implementation, [`AdbBridge`], spawns the `adb` binary for every
//! operation and parses its text output.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::LazyLock;

use async_trait::async_trait;
use devmux_types::{DeviceState, NetInterface};
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::error::BridgeError;

/// Properties copied from `getprop` into device descriptors
pub const TRACKED_PROPERTIES: &[&str] = &[
    "ro.product.manufacturer",
    "ro.product.model",
    "ro.build.version.release",
    "ro.build.version.sdk",
    "wifi.interface",
];

/// A device as listed by the bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeDevice {
    pub udid: String,
    pub state: DeviceState,
}

/// Operations the registry needs from the debug bridge
#[async_trait]
pub trait Bridge: Send + Sync + 'static {
    /// Connect a network device; returns its udid.
    async fn connect(&self, host: &str, port: u16) -> Result<String, BridgeError>;

    async fn disconnect(&self, udid: &str) -> Result<(), BridgeError>;

    async fn list_devices(&self) -> Result<Vec<BridgeDevice>, BridgeError>;

    async fn properties(&self, udid: &str) -> Result<BTreeMap<String, String>, BridgeError>;

    async fn interfaces(&self, udid: &str) -> Result<Vec<NetInterface>, BridgeError>;

    /// Launch the on-device control server; returns its pid.
    async fn start_server(&self, udid: &str) -> Result<i32, BridgeError>;

    async fn kill_server(&self, udid: &str, pid: i32) -> Result<(), BridgeError>;
}

/// [`Bridge`] backed by the `adb` command-line tool
#[derive(Debug, Clone)]
pub struct AdbBridge {
    binary: String,
    server_command: String,
}

impl AdbBridge {
    pub fn new(binary: impl Into<String>, server_command: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            server_command: server_command.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, BridgeError> {
        let command = format!("{} {}", self.binary, args.join(" "));
        trace!("Running {}", command);

        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = if stderr.trim().is_empty() {
                format!("exited with {}", output.status)
            } else {
                stderr.trim().to_string()
            };
            return Err(BridgeError::CommandFailed { command, message });
        }

        Ok(stdout)
    }

    async fn shell(&self, udid: &str, script: &str) -> Result<String, BridgeError> {
        self.run(&["-s", udid, "shell", script]).await
    }
}

#[async_trait]
impl Bridge for AdbBridge {
    async fn connect(&self, host: &str, port: u16) -> Result<String, BridgeError> {
        let address = format!("{host}:{port}");
        let output = self.run(&["connect", &address]).await?;

        // adb reports connection failures on stdout with a zero exit code
        if output.contains("connected to") {
            debug!("adb connect {}: {}", address, output.trim());
            Ok(address)
        } else {
            Err(BridgeError::CommandFailed {
                command: format!("{} connect {address}", self.binary),
                message: output.trim().to_string(),
            })
        }
    }

    async fn disconnect(&self, udid: &str) -> Result<(), BridgeError> {
        self.run(&["disconnect", udid]).await.map(|_| ())
    }

    async fn list_devices(&self) -> Result<Vec<BridgeDevice>, BridgeError> {
        let output = self.run(&["devices"]).await?;
        Ok(parse_devices(&output))
    }

    async fn properties(&self, udid: &str) -> Result<BTreeMap<String, String>, BridgeError> {
        let output = self.shell(udid, "getprop").await?;
        Ok(parse_properties(&output))
    }

    async fn interfaces(&self, udid: &str) -> Result<Vec<NetInterface>, BridgeError> {
        let output = self.shell(udid, "ip -4 -o addr").await?;
        Ok(parse_interfaces(&output))
    }

    async fn start_server(&self, udid: &str) -> Result<i32, BridgeError> {
        let script = format!("nohup {} >/dev/null 2>&1 & echo $!", self.server_command);
        let output = self.shell(udid, &script).await?;
        parse_pid(&output)
    }

    async fn kill_server(&self, udid: &str, pid: i32) -> Result<(), BridgeError> {
        self.shell(udid, &format!("kill {pid}")).await.map(|_| ())
    }
}

/// Parse `adb devices` output.
#[must_use]
pub fn parse_devices(output: &str) -> Vec<BridgeDevice> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("List of devices") && !line.starts_with('*'))
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let udid = parts.next()?;
            let state = parts.next()?;
            Some(BridgeDevice {
                udid: udid.to_string(),
                state: DeviceState::from_bridge(state),
            })
        })
        .collect()
}

static PROPERTY_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^\[([^\]]+)\]:\s*\[(.*)\]$").ok());

/// Parse `getprop` output, keeping only [`TRACKED_PROPERTIES`].
#[must_use]
pub fn parse_properties(output: &str) -> BTreeMap<String, String> {
    let Some(re) = PROPERTY_RE.as_ref() else {
        return BTreeMap::new();
    };

    output
        .lines()
        .filter_map(|line| {
            let caps = re.captures(line.trim())?;
            let key = caps.get(1)?.as_str();
            let value = caps.get(2)?.as_str();
            TRACKED_PROPERTIES
                .contains(&key)
                .then(|| (key.to_string(), value.to_string()))
        })
        .collect()
}

static INTERFACE_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^\d+:\s+(\S+)\s+inet\s+(\d{1,3}(?:\.\d{1,3}){3})").ok());

/// Parse `ip -4 -o addr` output, skipping loopback.
#[must_use]
pub fn parse_interfaces(output: &str) -> Vec<NetInterface> {
    let Some(re) = INTERFACE_RE.as_ref() else {
        return Vec::new();
    };

    output
        .lines()
        .filter_map(|line| {
            let caps = re.captures(line.trim())?;
            let name = caps.get(1)?.as_str();
            let ipv4 = caps.get(2)?.as_str();
            (name != "lo").then(|| NetInterface {
                name: name.to_string(),
                ipv4: ipv4.to_string(),
            })
        })
        .collect()
}

/// Parse the pid echoed after launching the control server.
///
/// # Errors
///
/// Returns `BridgeError::Parse` if the last output line is not a pid.
pub fn parse_pid(output: &str) -> Result<i32, BridgeError> {
    output
        .lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
        .and_then(|line| line.parse::<i32>().ok())
        .filter(|pid| *pid > 0)
        .ok_or_else(|| BridgeError::Parse(format!("expected a pid, got {:?}", output.trim())))
}

/// Scripted in-memory [`Bridge`] for unit tests
#[cfg(test)]
pub(crate) mod fake {
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use devmux_types::{DeviceState, NetInterface};

    use super::{Bridge, BridgeDevice};
    use crate::error::BridgeError;

    #[derive(Default)]
    pub struct FakeBridge {
        pub listed: Mutex<Vec<BridgeDevice>>,
        pub calls: Mutex<Vec<String>>,
        pub list_calls: AtomicUsize,
        pub fail_list: AtomicBool,
        pub fail_connect: AtomicBool,
        pub fail_kill: AtomicBool,
        pub fail_disconnect: AtomicBool,
        pub fail_start: AtomicBool,
        /// `list_devices` never returns
        pub hang_list: AtomicBool,
        /// `properties` and `interfaces` never return
        pub hang_queries: AtomicBool,
        pub slow: Option<Duration>,
    }

    impl FakeBridge {
        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        pub fn list(&self, devices: &[(&str, DeviceState)]) {
            *self.listed.lock().unwrap() = devices
                .iter()
                .map(|(udid, state)| BridgeDevice {
                    udid: (*udid).to_string(),
                    state: *state,
                })
                .collect();
        }

        fn failure(command: &str) -> BridgeError {
            BridgeError::CommandFailed {
                command: command.to_string(),
                message: "scripted failure".to_string(),
            }
        }
    }

    #[async_trait]
    impl Bridge for FakeBridge {
        async fn connect(&self, host: &str, port: u16) -> Result<String, BridgeError> {
            self.record(format!("connect {host}:{port}"));
            if let Some(delay) = self.slow {
                tokio::time::sleep(delay).await;
            }
            if self.fail_connect.load(Ordering::SeqCst) {
                return Err(BridgeError::CommandFailed {
                    command: "adb connect".to_string(),
                    message: format!("failed to connect to {host}:{port}"),
                });
            }
            Ok(format!("{host}:{port}"))
        }

        async fn disconnect(&self, udid: &str) -> Result<(), BridgeError> {
            self.record(format!("disconnect {udid}"));
            if self.fail_disconnect.load(Ordering::SeqCst) {
                return Err(Self::failure("disconnect"));
            }
            Ok(())
        }

        async fn list_devices(&self) -> Result<Vec<BridgeDevice>, BridgeError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            if self.hang_list.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if let Some(delay) = self.slow {
                tokio::time::sleep(delay).await;
            }
            if self.fail_list.load(Ordering::SeqCst) {
                return Err(Self::failure("devices"));
            }
            Ok(self.listed.lock().unwrap().clone())
        }

        async fn properties(&self, _udid: &str) -> Result<BTreeMap<String, String>, BridgeError> {
            if self.hang_queries.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            Ok(BTreeMap::from([(
                "ro.product.model".to_string(),
                "Pixel 7".to_string(),
            )]))
        }

        async fn interfaces(&self, _udid: &str) -> Result<Vec<NetInterface>, BridgeError> {
            if self.hang_queries.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            Ok(vec![NetInterface {
                name: "wlan0".to_string(),
                ipv4: "192.168.1.20".to_string(),
            }])
        }

        async fn start_server(&self, udid: &str) -> Result<i32, BridgeError> {
            self.record(format!("start {udid}"));
            if self.fail_start.load(Ordering::SeqCst) {
                return Err(Self::failure("start"));
            }
            Ok(4321)
        }

        async fn kill_server(&self, udid: &str, pid: i32) -> Result<(), BridgeError> {
            self.record(format!("kill {udid} {pid}"));
            if self.fail_kill.load(Ordering::SeqCst) {
                return Err(Self::failure("kill"));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_devices() {
        let output = "* daemon not running; starting now at tcp:5037\n\
                      * daemon started successfully\n\
                      List of devices attached\n\
                      emulator-5554\tdevice\n\
                      192.168.1.20:5555\toffline\n\
                      R58M123ABC\tunauthorized\n\n";
        let devices = parse_devices(output);
        assert_eq!(devices.len(), 3);
        assert_eq!(devices[0].udid, "emulator-5554");
        assert_eq!(devices[0].state, DeviceState::Device);
        assert_eq!(devices[1].udid, "192.168.1.20:5555");
        assert_eq!(devices[1].state, DeviceState::Offline);
        assert_eq!(devices[2].state, DeviceState::Unauthorized);
    }

    #[test]
    fn test_parse_devices_empty() {
        assert!(parse_devices("List of devices attached\n\n").is_empty());
    }

    #[test]
    fn test_parse_properties_keeps_tracked_keys() {
        let output = "[dalvik.vm.heapsize]: [512m]\n\
                      [ro.build.version.release]: [14]\n\
                      [ro.build.version.sdk]: [34]\n\
                      [ro.product.manufacturer]: [Google]\n\
                      [ro.product.model]: [Pixel 7]\n\
                      [wifi.interface]: [wlan0]\n";
        let props = parse_properties(output);
        assert_eq!(props.len(), 5);
        assert_eq!(props["ro.product.model"], "Pixel 7");
        assert_eq!(props["ro.build.version.sdk"], "34");
        assert!(!props.contains_key("dalvik.vm.heapsize"));
    }

    #[test]
    fn test_parse_interfaces() {
        let output = "1: lo    inet 127.0.0.1/8 scope host lo\\       valid_lft forever\n\
                      30: wlan0    inet 192.168.1.20/24 brd 192.168.1.255 scope global wlan0\n\
                      31: rmnet_data0    inet 10.12.0.5/30 scope global rmnet_data0\n";
        let interfaces = parse_interfaces(output);
        assert_eq!(
            interfaces,
            vec![
                NetInterface {
                    name: "wlan0".to_string(),
                    ipv4: "192.168.1.20".to_string()
                },
                NetInterface {
                    name: "rmnet_data0".to_string(),
                    ipv4: "10.12.0.5".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_parse_pid() {
        assert_eq!(parse_pid("4321\n").unwrap(), 4321);
        assert_eq!(parse_pid("[1] 99\n4321\n\n").unwrap(), 4321);
        assert!(matches!(parse_pid(""), Err(BridgeError::Parse(_))));
        assert!(matches!(parse_pid("not found"), Err(BridgeError::Parse(_))));
    }

    #[tokio::test]
    async fn test_missing_binary_is_io_error() {
        let bridge = AdbBridge::new("/nonexistent/devmux-adb", "true");
        let err = bridge.list_devices().await.unwrap_err();
        assert!(matches!(err, BridgeError::Io(_)));
    }
}
