//! Android device tracking channel (`GTRC`).
//!
//! On open the tracker initializes the registry, subscribes to device events
//! and sends the `devicelist` snapshot; afterwards every `device` event is
//! forwarded and every removal triggers a fresh snapshot. Inbound
//! `{id, type, data}` commands run against the registry as separate tasks and
//! answer with a correlated `<TYPE>_RESULT` message.

use std::sync::Arc;

use async_trait::async_trait;
use devmux_transport::{ChannelCode, ChannelSender, Payload};
use devmux_types::{
    AddDeviceData, CommandEnvelope, CommandResult, DecodedCommand, DeviceDescriptor,
    DeviceEventData, DeviceListData, KillServerData, Message, TrackerCommand, UdidData,
};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, trace, warn};

use super::{Middleware, MiddlewareFactory};
use crate::registry::{CommandOutcome, ControlCommand, DeviceEvent, DeviceRegistry, EventKind};

const NAME: &str = "DeviceTracker";

/// Tracker type advertised through the host tracker
pub const TRACKER_TYPE: &str = "android";

#[derive(Debug, Clone)]
pub struct DeviceTrackerFactory {
    registry: Arc<DeviceRegistry>,
}

impl DeviceTrackerFactory {
    #[must_use]
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self { registry }
    }
}

impl MiddlewareFactory for DeviceTrackerFactory {
    fn name(&self) -> &'static str {
        NAME
    }

    fn code(&self) -> ChannelCode {
        ChannelCode::GTRC
    }

    fn action(&self) -> Option<&'static str> {
        Some("devicelist")
    }

    fn create(&self, outlet: ChannelSender) -> Box<dyn Middleware> {
        Box::new(DeviceTracker {
            registry: self.registry.clone(),
            outlet,
            subscription: None,
            forwarder: None,
            commands: JoinSet::new(),
        })
    }
}

struct DeviceTracker {
    registry: Arc<DeviceRegistry>,
    outlet: ChannelSender,
    subscription: Option<u64>,
    forwarder: Option<JoinHandle<()>>,
    commands: JoinSet<()>,
}

fn device_list(registry: &DeviceRegistry, list: Vec<DeviceDescriptor>) -> serde_json::Result<Message> {
    Message::device_list(&DeviceListData {
        id: registry.id().to_string(),
        name: registry.name().to_string(),
        list,
    })
}

fn send(outlet: &ChannelSender, message: serde_json::Result<Message>) -> bool {
    match message {
        Ok(message) => outlet.send_json(&message).is_ok(),
        Err(e) => {
            warn!("[{}] Failed to encode message: {}", NAME, e);
            true
        }
    }
}

async fn forward(
    registry: Arc<DeviceRegistry>,
    outlet: ChannelSender,
    mut events: mpsc::UnboundedReceiver<DeviceEvent>,
) {
    while let Some(event) = events.recv().await {
        let message = match event {
            DeviceEvent::Device(device) => Message::device(&DeviceEventData {
                id: registry.id().to_string(),
                name: registry.name().to_string(),
                device,
            }),
            DeviceEvent::Removed(udid) => {
                trace!("[{}] {} removed, resending list", NAME, udid);
                device_list(&registry, registry.devices().await)
            }
        };
        if !send(&outlet, message) {
            trace!("[{}] Channel {} closed, stop forwarding", NAME, outlet.id());
            break;
        }
    }
}

async fn execute(registry: &DeviceRegistry, command: &TrackerCommand) -> CommandResult {
    match command {
        TrackerCommand::AddDevice(AddDeviceData { host, port }) => {
            let base = CommandResult {
                host: Some(host.clone()),
                port: Some(*port),
                ..CommandResult::default()
            };
            match registry.add_device(host, *port).await {
                Ok(udid) => CommandResult {
                    success: true,
                    udid: Some(udid),
                    message: Some(format!("Connected to {host}:{port}")),
                    ..base
                },
                Err(e) => CommandResult {
                    message: Some(e.to_string()),
                    ..base
                },
            }
        }
        TrackerCommand::DeleteDevice(UdidData { udid }) => match registry.remove_device(udid).await {
            Ok(()) => CommandResult::ok()
                .with_udid(udid)
                .with_message(format!("Device {udid} removed")),
            Err(e) => CommandResult::failed(e.to_string()).with_udid(udid),
        },
        TrackerCommand::StartServer(UdidData { udid }) => {
            control(registry, ControlCommand::StartServer { udid: udid.clone() }).await
        }
        TrackerCommand::KillServer(KillServerData { udid, pid }) => {
            control(
                registry,
                ControlCommand::KillServer {
                    udid: udid.clone(),
                    pid: *pid,
                },
            )
            .await
        }
        TrackerCommand::UpdateInterfaces(UdidData { udid }) => {
            control(registry, ControlCommand::UpdateInterfaces { udid: udid.clone() }).await
        }
    }
}

async fn control(registry: &DeviceRegistry, command: ControlCommand) -> CommandResult {
    let udid = command.udid().to_string();
    match registry.run_command(command).await {
        Ok(CommandOutcome::ServerStarted { pid }) => CommandResult {
            pid: Some(pid),
            ..CommandResult::ok().with_udid(udid)
        },
        Ok(CommandOutcome::ServerKilled) => CommandResult::ok().with_udid(udid),
        Ok(CommandOutcome::InterfacesUpdated(interfaces)) => CommandResult::ok()
            .with_udid(udid)
            .with_message(format!("{} interface(s)", interfaces.len())),
        Err(e) => CommandResult::failed(e.to_string()).with_udid(udid),
    }
}

#[async_trait]
impl Middleware for DeviceTracker {
    async fn on_open(&mut self) {
        if let Err(e) = self.registry.init().await {
            warn!("[{}] Registry unavailable: {}", NAME, e);
            if !send(&self.outlet, Ok(Message::error(e.to_string()))) {
                debug!("[{}] Channel {} closed before the error was sent", NAME, self.outlet.id());
            }
            return;
        }

        let subscription = self
            .registry
            .subscribe(&[EventKind::Device, EventKind::DeviceRemoved])
            .await;
        self.subscription = Some(subscription.id);
        debug!(
            "[{}] Channel {} subscribed with {} device(s)",
            NAME,
            self.outlet.id(),
            subscription.snapshot.len()
        );

        if !send(&self.outlet, device_list(&self.registry, subscription.snapshot)) {
            return;
        }

        self.forwarder = Some(tokio::spawn(forward(
            self.registry.clone(),
            self.outlet.clone(),
            subscription.events,
        )));
    }

    async fn on_message(&mut self, payload: Payload) {
        let Some(text) = payload.as_text() else {
            debug!("[{}] Ignoring binary message", NAME);
            return;
        };

        let envelope = match CommandEnvelope::decode(text) {
            Ok(DecodedCommand::Known(envelope)) => envelope,
            Ok(DecodedCommand::Unknown { id, kind }) => {
                warn!("[{}] Unknown command type {:?} (id {})", NAME, kind, id);
                return;
            }
            Err(e) => {
                warn!("[{}] Invalid message: {}", NAME, e);
                return;
            }
        };
        debug!("[{}] {} (id {})", NAME, envelope.command.kind(), envelope.id);

        while self.commands.try_join_next().is_some() {}

        let registry = self.registry.clone();
        let outlet = self.outlet.clone();
        self.commands.spawn(async move {
            let CommandEnvelope { id, command } = envelope;
            let result = execute(&registry, &command).await;
            if outlet.is_closed() {
                trace!("[{}] Dropping {} result for closed channel", NAME, command.kind());
                return;
            }
            send(
                &outlet,
                Message::command_result(id, command.result_kind(), &result),
            );
        });
    }

    async fn release(&mut self) {
        if let Some(id) = self.subscription.take() {
            self.registry.unsubscribe(id).await;
        }
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        // In-flight registry operations run to completion; their results are dropped
        self.commands.detach_all();
        trace!("[{}] Channel {} released", NAME, self.outlet.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::fake::FakeBridge;
    use crate::mw::drive;
    use crate::registry::RegistryConfig;
    use devmux_transport::{Channel, Frame, StandaloneLink};
    use devmux_types::TrackerUpdate;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn registry(bridge: Arc<FakeBridge>) -> Arc<DeviceRegistry> {
        let config = RegistryConfig {
            name: Some("test-host".to_string()),
            connect_timeout: Duration::from_secs(1),
            poll_interval: None,
        };
        Arc::new(DeviceRegistry::new(bridge, config))
    }

    fn open(registry: &Arc<DeviceRegistry>) -> (StandaloneLink, JoinHandle<()>) {
        let factory = DeviceTrackerFactory::new(registry.clone());
        let (channel, link) = Channel::standalone(ChannelCode::GTRC);
        let handler = factory.create(channel.sender());
        (link, tokio::spawn(drive(handler, channel)))
    }

    async fn next_update(link: &mut StandaloneLink) -> TrackerUpdate {
        let frame = link.outbound.recv().await.unwrap();
        let Frame::Data {
            payload: Payload::Text(text),
            ..
        } = frame
        else {
            panic!("expected text frame, got {frame:?}");
        };
        let message: Message = serde_json::from_str(&text).unwrap();
        TrackerUpdate::from_message(message).unwrap()
    }

    fn command(id: i64, command: TrackerCommand) -> Payload {
        let message = CommandEnvelope::new(id, command).to_message().unwrap();
        Payload::Text(serde_json::to_string(&message).unwrap())
    }

    #[tokio::test]
    async fn test_snapshot_then_device_events() {
        let registry = registry(Arc::new(FakeBridge::default()));
        registry.add_device("10.0.0.1", 5555).await.unwrap();

        let (mut link, _task) = open(&registry);
        let TrackerUpdate::DeviceList(list) = next_update(&mut link).await else {
            panic!("expected devicelist");
        };
        assert_eq!(list.name, "aDevice Tracker [test-host]");
        assert_eq!(list.list.len(), 1);

        registry.add_device("10.0.0.2", 5555).await.unwrap();
        let TrackerUpdate::Device(event) = next_update(&mut link).await else {
            panic!("expected device");
        };
        assert_eq!(event.device.udid, "10.0.0.2:5555");
        assert_eq!(event.id, registry.id());
    }

    #[tokio::test]
    async fn test_removal_resends_list() {
        let registry = registry(Arc::new(FakeBridge::default()));
        let udid = registry.add_device("10.0.0.1", 5555).await.unwrap();

        let (mut link, _task) = open(&registry);
        let _snapshot = next_update(&mut link).await;

        registry.remove_device(&udid).await.unwrap();
        let TrackerUpdate::DeviceList(list) = next_update(&mut link).await else {
            panic!("expected devicelist");
        };
        assert!(list.list.is_empty());
    }

    #[tokio::test]
    async fn test_init_failure_sends_error_and_stays_bound() {
        let bridge = Arc::new(FakeBridge::default());
        bridge.fail_list.store(true, Ordering::SeqCst);
        let registry = registry(bridge);

        let (mut link, task) = open(&registry);
        let TrackerUpdate::Error(text) = next_update(&mut link).await else {
            panic!("expected error");
        };
        assert!(text.contains("unavailable"));
        assert_eq!(registry.subscriber_count().await, 0);

        drop(link.inbound);
        task.await.unwrap();
        assert_eq!(registry.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn test_init_failure_on_closed_channel_sends_nothing() {
        let bridge = Arc::new(FakeBridge::default());
        bridge.fail_list.store(true, Ordering::SeqCst);
        let registry = registry(bridge);

        let factory = DeviceTrackerFactory::new(registry.clone());
        let (channel, mut link) = Channel::standalone(ChannelCode::GTRC);
        let mut handler = factory.create(channel.sender());
        link.hangup.hang_up();

        handler.on_open().await;
        handler.release().await;
        assert_eq!(registry.subscriber_count().await, 0);
        assert!(link.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_commands_answer_with_correlated_results() {
        let bridge = Arc::new(FakeBridge::default());
        let registry = registry(bridge.clone());
        let (mut link, _task) = open(&registry);
        let _snapshot = next_update(&mut link).await;

        link.inbound
            .send(command(
                7,
                TrackerCommand::AddDevice(AddDeviceData {
                    host: "10.0.0.3".to_string(),
                    port: 5555,
                }),
            ))
            .unwrap();

        // The device event and the result may arrive in either order
        let mut result = None;
        for _ in 0..2 {
            if let TrackerUpdate::CommandResult { id, kind, result: r } = next_update(&mut link).await {
                assert_eq!(id, 7);
                assert_eq!(kind, "ADD_DEVICE_RESULT");
                result = Some(r);
            }
        }
        let result = result.unwrap();
        assert!(result.success);
        assert_eq!(result.udid.as_deref(), Some("10.0.0.3:5555"));
        assert_eq!(result.port, Some(5555));

        link.inbound
            .send(command(
                8,
                TrackerCommand::DeleteDevice(UdidData {
                    udid: "missing".to_string(),
                }),
            ))
            .unwrap();
        let TrackerUpdate::CommandResult { id, kind, result } = next_update(&mut link).await else {
            panic!("expected result");
        };
        assert_eq!((id, kind.as_str()), (8, "DELETE_DEVICE_RESULT"));
        assert!(!result.success);
        assert_eq!(result.message.as_deref(), Some("Device not found: missing"));
    }

    /// The device event and the command result in whichever order they arrive
    async fn event_and_result(link: &mut StandaloneLink) -> (DeviceEventData, CommandResult) {
        let mut event = None;
        let mut result = None;
        for _ in 0..2 {
            match next_update(link).await {
                TrackerUpdate::Device(e) => event = Some(e),
                TrackerUpdate::CommandResult { result: r, .. } => result = Some(r),
                other => panic!("unexpected update {other:?}"),
            }
        }
        (event.unwrap(), result.unwrap())
    }

    #[tokio::test]
    async fn test_server_start_and_kill_broadcast_pid() {
        let registry = registry(Arc::new(FakeBridge::default()));
        let udid = registry.add_device("10.0.0.4", 5555).await.unwrap();
        let (mut link, _task) = open(&registry);
        let _snapshot = next_update(&mut link).await;

        link.inbound
            .send(command(
                1,
                TrackerCommand::StartServer(UdidData { udid: udid.clone() }),
            ))
            .unwrap();
        let (event, result) = event_and_result(&mut link).await;
        assert_eq!(event.device.udid, udid);
        assert_eq!(event.device.pid, 4321);
        assert!(event.device.is_active());
        assert_eq!(result.pid, Some(4321));

        link.inbound
            .send(command(
                2,
                TrackerCommand::KillServer(KillServerData {
                    udid: udid.clone(),
                    pid: None,
                }),
            ))
            .unwrap();
        let (event, result) = event_and_result(&mut link).await;
        assert_eq!(event.device.udid, udid);
        assert_eq!(event.device.pid, devmux_types::NO_PID);
        assert!(!event.device.is_active());
        assert!(result.success);
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_commands_are_dropped() {
        let registry = registry(Arc::new(FakeBridge::default()));
        let (mut link, _task) = open(&registry);
        let _snapshot = next_update(&mut link).await;

        link.inbound
            .send(Payload::Text(r#"{"id": 1, "type": "reboot", "data": {}}"#.to_string()))
            .unwrap();
        link.inbound.send(Payload::Text("not json".to_string())).unwrap();
        link.inbound
            .send(command(
                2,
                TrackerCommand::StartServer(UdidData {
                    udid: "missing".to_string(),
                }),
            ))
            .unwrap();

        let TrackerUpdate::CommandResult { id, kind, .. } = next_update(&mut link).await else {
            panic!("expected result");
        };
        assert_eq!(id, 2);
        assert_eq!(kind, "START_SERVER_RESULT");
    }

    #[tokio::test]
    async fn test_release_unsubscribes() {
        let registry = registry(Arc::new(FakeBridge::default()));
        let (mut link, task) = open(&registry);
        let _snapshot = next_update(&mut link).await;
        assert_eq!(registry.subscriber_count().await, 1);

        drop(link.inbound);
        task.await.unwrap();
        assert_eq!(registry.subscriber_count().await, 0);
        assert!(matches!(
            link.outbound.recv().await,
            Some(Frame::Close { code: 1000, .. })
        ));
    }
}
