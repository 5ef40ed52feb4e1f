//! devmux CLI
//!
//! Talks to a running devmux daemon:
//! - `watch`: follow hosts and devices, reconnecting when the daemon goes away
//! - `add`/`remove`/`start-server`/`kill-server`: tracker commands
//! - `devices`/`connect`: saved-device REST API

use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use devmux_transport::{
    ChannelCode, HostTrackerClient, Supervisor, SupervisorEvent, TrackerChannel, multiplex_url,
};
use devmux_types::{
    AddDeviceData, CommandResult, DeviceDescriptor, KillServerData, QuickConnectResponse,
    SavedDevice, TrackerCommand, TrackerUpdate, UdidData,
};
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// devmux client
#[derive(Parser)]
#[command(name = "devmux")]
#[command(about = "Track and control devices through a devmux daemon")]
#[command(version)]
#[command(after_help = "\
Examples:
  devmux                              Follow devices on the local daemon
  devmux --host 10.0.0.2 watch        Follow devices on another machine
  devmux add 192.168.1.20             Connect a network device (port 5555)
  devmux start-server emulator-5554   Launch the control server on a device
  devmux connect Pixel 192.168.1.20   Connect and save a device
  devmux devices                      List saved devices
")]
struct Cli {
    /// Daemon host
    #[arg(long, global = true, default_value = "127.0.0.1")]
    host: String,

    /// Daemon port
    #[arg(short, long, global = true, default_value_t = 8000)]
    port: u16,

    /// Delay before reconnecting after an abnormal close
    #[arg(long, global = true, default_value_t = 3000, value_name = "MS")]
    reconnect_delay_ms: u64,

    /// How long to wait for command results
    #[arg(long, global = true, default_value_t = 15, value_name = "SECS")]
    timeout: u64,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow hosts and device changes (default)
    Watch,

    /// Connect a network device through the daemon's bridge
    Add {
        /// Device address
        address: String,
        /// Device port
        #[arg(default_value_t = 5555)]
        device_port: u16,
    },

    /// Stop tracking a device (kills its control server first)
    Remove {
        udid: String,
    },

    /// Launch the on-device control server
    #[command(name = "start-server")]
    StartServer {
        udid: String,
    },

    /// Kill the on-device control server
    #[command(name = "kill-server")]
    KillServer {
        udid: String,
        /// Server pid, defaults to the one the daemon tracks
        #[arg(long)]
        pid: Option<i32>,
    },

    /// Refresh a device's network interfaces
    #[command(name = "update-interfaces")]
    UpdateInterfaces {
        udid: String,
    },

    /// List saved devices
    Devices,

    /// Connect a device and save it for auto-connect
    Connect {
        name: String,
        address: String,
        #[arg(default_value_t = 5555)]
        device_port: u16,
    },
}

fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("devmux=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging();

    let timeout = Duration::from_secs(cli.timeout);
    match cli.command {
        None | Some(Commands::Watch) => {
            run_watch(&cli.host, cli.port, Duration::from_millis(cli.reconnect_delay_ms)).await
        }
        Some(Commands::Add {
            address,
            device_port,
        }) => {
            let command = TrackerCommand::AddDevice(AddDeviceData {
                host: address,
                port: device_port,
            });
            run_command(&cli.host, cli.port, command, timeout).await
        }
        Some(Commands::Remove { udid }) => {
            let command = TrackerCommand::DeleteDevice(UdidData { udid });
            run_command(&cli.host, cli.port, command, timeout).await
        }
        Some(Commands::StartServer { udid }) => {
            let command = TrackerCommand::StartServer(UdidData { udid });
            run_command(&cli.host, cli.port, command, timeout).await
        }
        Some(Commands::KillServer { udid, pid }) => {
            let command = TrackerCommand::KillServer(KillServerData { udid, pid });
            run_command(&cli.host, cli.port, command, timeout).await
        }
        Some(Commands::UpdateInterfaces { udid }) => {
            let command = TrackerCommand::UpdateInterfaces(UdidData { udid });
            run_command(&cli.host, cli.port, command, timeout).await
        }
        Some(Commands::Devices) => run_devices(&cli.host, cli.port).await,
        Some(Commands::Connect {
            name,
            address,
            device_port,
        }) => run_connect(&cli.host, cli.port, name, address, device_port).await,
    }
}

fn describe(device: &DeviceDescriptor) -> String {
    let model = device.property("ro.product.model").unwrap_or("-");
    let release = device.property("ro.build.version.release").unwrap_or("-");
    let state = format!("{:?}", device.state).to_lowercase();
    let server = if device.is_active() {
        format!("pid {}", device.pid)
    } else {
        "no server".to_string()
    };
    format!(
        "{:<24} {:<14} {:<16} Android {:<6} {}",
        device.udid, state, model, release, server
    )
}

fn print_update(update: &TrackerUpdate) {
    match update {
        TrackerUpdate::Hosts(hosts) => {
            let kinds: Vec<&str> = hosts.local.iter().map(|h| h.kind.as_str()).collect();
            println!("hosts: {}", kinds.join(", "));
        }
        TrackerUpdate::DeviceList(list) => {
            println!("{} - {} device(s)", list.name, list.list.len());
            for device in &list.list {
                println!("  {}", describe(device));
            }
        }
        TrackerUpdate::Device(event) => println!("* {}", describe(&event.device)),
        TrackerUpdate::Error(message) => eprintln!("error: {message}"),
        TrackerUpdate::CommandResult { kind, result, .. } => {
            println!("{kind}: {}", format_result(result));
        }
        TrackerUpdate::Unknown(kind) => debug!("Ignoring {} message", kind),
    }
}

async fn run_watch(host: &str, port: u16, delay: Duration) -> Result<()> {
    let client = HostTrackerClient::new(multiplex_url(host, port));
    let (supervisor, mut events) = Supervisor::start(client, delay);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    SupervisorEvent::Connecting { attempt } if attempt > 1 => {
                        eprintln!("Reconnecting to {host}:{port} (attempt {attempt})...");
                    }
                    SupervisorEvent::Connecting { .. } => {}
                    SupervisorEvent::Open => eprintln!("Connected to {host}:{port}"),
                    SupervisorEvent::Update(update) => print_update(&update),
                    SupervisorEvent::Closed(close) if close.is_normal() => {
                        eprintln!("Daemon closed the connection");
                        break;
                    }
                    SupervisorEvent::Closed(close) => {
                        eprintln!(
                            "Connection lost ({} {}), retrying in {:?}",
                            close.code, close.reason, delay
                        );
                    }
                }
            }
        }
    }

    supervisor.destroy();
    Ok(())
}

fn format_result(result: &CommandResult) -> String {
    let mut parts = vec![if result.success { "ok" } else { "failed" }.to_string()];
    if let Some(udid) = &result.udid {
        parts.push(udid.clone());
    }
    if let Some(pid) = result.pid {
        parts.push(format!("pid {pid}"));
    }
    if let Some(message) = &result.message {
        parts.push(message.clone());
    }
    parts.join(" - ")
}

async fn run_command(host: &str, port: u16, command: TrackerCommand, timeout: Duration) -> Result<()> {
    let url = multiplex_url(host, port);
    let mut tracker = TrackerChannel::open(&url, ChannelCode::GTRC)
        .await
        .with_context(|| format!("Failed to connect to daemon at {host}:{port}. Is it running?"))?;

    let kind = command.kind();
    let result = tracker
        .command(command, timeout)
        .await
        .with_context(|| format!("{kind} got no result"))?;
    tracker.close().await;

    println!("{}", format_result(&result));
    if !result.success {
        bail!("{kind} failed");
    }
    Ok(())
}

async fn run_devices(host: &str, port: u16) -> Result<()> {
    let url = format!("http://{host}:{port}/api/devices");
    let devices: Vec<SavedDevice> = reqwest::get(&url)
        .await
        .with_context(|| format!("Failed to reach {url}"))?
        .error_for_status()?
        .json()
        .await?;

    if devices.is_empty() {
        println!("No saved devices");
        return Ok(());
    }
    for device in devices {
        println!(
            "{:<32} {:<20} {}:{}  {}",
            device.id,
            device.name,
            device.host,
            device.port,
            device.last_connected.as_deref().unwrap_or("never")
        );
    }
    Ok(())
}

async fn run_connect(host: &str, port: u16, name: String, address: String, device_port: u16) -> Result<()> {
    let url = format!("http://{host}:{port}/api/quick-connect");
    let body = serde_json::json!({"name": name, "host": address, "port": device_port});
    let response: QuickConnectResponse = reqwest::Client::new()
        .post(&url)
        .json(&body)
        .send()
        .await
        .with_context(|| format!("Failed to reach {url}"))?
        .json()
        .await?;

    if !response.success {
        bail!(
            "Connect failed: {}",
            response.error.as_deref().unwrap_or("unknown error")
        );
    }
    println!(
        "Connected {} ({}) as {}",
        name,
        response.udid.as_deref().unwrap_or("-"),
        response.device_id.as_deref().unwrap_or("unsaved")
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use devmux_types::DeviceState;

    #[test]
    fn test_cli_parses_commands() {
        let cli = Cli::parse_from(["devmux", "--port", "9000", "add", "10.0.0.1"]);
        assert_eq!(cli.port, 9000);
        assert!(matches!(
            cli.command,
            Some(Commands::Add { ref address, device_port: 5555 }) if address == "10.0.0.1"
        ));

        let cli = Cli::parse_from(["devmux"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.reconnect_delay_ms, 3000);

        let cli = Cli::parse_from(["devmux", "kill-server", "emulator-5554", "--pid", "42"]);
        assert!(matches!(cli.command, Some(Commands::KillServer { pid: Some(42), .. })));
    }

    #[test]
    fn test_format_result() {
        let result = CommandResult {
            pid: Some(42),
            ..CommandResult::ok().with_udid("emulator-5554")
        };
        assert_eq!(format_result(&result), "ok - emulator-5554 - pid 42");

        let result = CommandResult::failed("Device not found: X");
        assert_eq!(format_result(&result), "failed - Device not found: X");
    }

    #[test]
    fn test_describe_device() {
        let mut device = DeviceDescriptor::new("emulator-5554", DeviceState::Device);
        device
            .properties
            .insert("ro.product.model".to_string(), "Pixel 7".to_string());
        let line = describe(&device);
        assert!(line.contains("emulator-5554"));
        assert!(line.contains("Pixel 7"));
        assert!(line.contains("no server"));
    }
}
