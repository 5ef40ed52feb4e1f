//! Device registry and control plane.
//!
//! The registry is the single source of truth for tracked devices. It owns
//! the `udid -> descriptor` map, runs every mutation against the [`Bridge`]
//! under one operation lock, and fans events out to subscribers over
//! unbounded queues so a stalled subscriber never delays the others.
//!
//! A subscription's view is its snapshot plus the events that follow it:
//! both are taken under the same state lock, so no change is lost or seen
//! twice across the boundary.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use devmux_types::{DeviceDescriptor, DeviceState, NO_PID, NetInterface};
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use tokio::sync::{Mutex as AsyncMutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::bridge::{Bridge, BridgeDevice};
use crate::error::{BridgeError, RegistryError};

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Host part of the tracker name; the machine hostname when unset
    pub name: Option<String>,
    /// Upper bound for each bridge call made under the operation lock
    pub connect_timeout: Duration,
    /// Reconciliation poll interval; `None` disables polling
    pub poll_interval: Option<Duration>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            name: None,
            connect_timeout: Duration::from_secs(10),
            poll_interval: Some(Duration::from_secs(2)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Device,
    DeviceRemoved,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// A device was discovered or changed materially
    Device(DeviceDescriptor),
    /// A device was removed; carries its udid
    Removed(String),
}

impl DeviceEvent {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            DeviceEvent::Device(_) => EventKind::Device,
            DeviceEvent::Removed(_) => EventKind::DeviceRemoved,
        }
    }
}

#[derive(Debug)]
pub struct Subscription {
    pub id: u64,
    pub snapshot: Vec<DeviceDescriptor>,
    pub events: mpsc::UnboundedReceiver<DeviceEvent>,
}

/// Control commands run against a tracked device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    StartServer { udid: String },
    KillServer { udid: String, pid: Option<i32> },
    UpdateInterfaces { udid: String },
}

impl ControlCommand {
    #[must_use]
    pub fn udid(&self) -> &str {
        match self {
            ControlCommand::StartServer { udid }
            | ControlCommand::KillServer { udid, .. }
            | ControlCommand::UpdateInterfaces { udid } => udid,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    ServerStarted { pid: i32 },
    ServerKilled,
    InterfacesUpdated(Vec<NetInterface>),
}

struct Subscriber {
    kinds: HashSet<EventKind>,
    tx: mpsc::UnboundedSender<DeviceEvent>,
}

#[derive(Default)]
struct RegistryState {
    devices: HashMap<String, DeviceDescriptor>,
    order: Vec<String>,
    subscribers: HashMap<u64, Subscriber>,
}

impl RegistryState {
    fn snapshot(&self) -> Vec<DeviceDescriptor> {
        self.order
            .iter()
            .filter_map(|udid| self.devices.get(udid).cloned())
            .collect()
    }

    /// Insert or replace a descriptor. Publishes only new or materially
    /// changed devices.
    fn upsert(&mut self, device: DeviceDescriptor) -> bool {
        match self.devices.get(&device.udid) {
            Some(existing) if !existing.differs_materially(&device) => false,
            Some(_) => {
                self.devices.insert(device.udid.clone(), device.clone());
                self.publish(&DeviceEvent::Device(device));
                true
            }
            None => {
                self.order.push(device.udid.clone());
                self.devices.insert(device.udid.clone(), device.clone());
                self.publish(&DeviceEvent::Device(device));
                true
            }
        }
    }

    fn remove(&mut self, udid: &str) -> Option<DeviceDescriptor> {
        let device = self.devices.remove(udid)?;
        self.order.retain(|u| u != udid);
        self.publish(&DeviceEvent::Removed(udid.to_string()));
        Some(device)
    }

    fn publish(&mut self, event: &DeviceEvent) {
        let kind = event.kind();
        self.subscribers.retain(|id, subscriber| {
            if !subscriber.kinds.contains(&kind) {
                return true;
            }
            if subscriber.tx.send(event.clone()).is_ok() {
                true
            } else {
                trace!("Dropping closed subscriber {}", id);
                false
            }
        });
    }
}

type InitFuture = Shared<BoxFuture<'static, Result<(), RegistryError>>>;

enum InitState {
    Idle,
    Running { generation: u64, future: InitFuture },
    Ready,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn host_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|name| !name.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
        })
        .unwrap_or_else(|| "localhost".to_string())
}

fn command_failed(e: &BridgeError) -> RegistryError {
    RegistryError::CommandExecutionFailed(e.to_string())
}

async fn with_timeout<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, BridgeError>>,
) -> Result<T, BridgeError> {
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| BridgeError::Timeout(limit))?
}

pub struct DeviceRegistry {
    id: String,
    name: String,
    bridge: Arc<dyn Bridge>,
    config: RegistryConfig,
    state: RwLock<RegistryState>,
    ops: AsyncMutex<()>,
    init: Mutex<InitState>,
    generation: AtomicU64,
    next_subscriber: AtomicU64,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceRegistry {
    pub fn new(bridge: Arc<dyn Bridge>, config: RegistryConfig) -> Self {
        let host = config.name.clone().unwrap_or_else(host_name);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: format!("aDevice Tracker [{host}]"),
            bridge,
            config,
            state: RwLock::new(RegistryState::default()),
            ops: AsyncMutex::new(()),
            init: Mutex::new(InitState::Idle),
            generation: AtomicU64::new(0),
            next_subscriber: AtomicU64::new(1),
            poller: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn init_lock(&self) -> MutexGuard<'_, InitState> {
        self.init.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(*self.init_lock(), InitState::Ready)
    }

    /// Connect to the bridge and enumerate devices.
    ///
    /// Idempotent. Concurrent callers share one in-flight attempt and all
    /// observe its result. After a failure the next call starts a new attempt.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::DaemonUnavailable` if the bridge cannot list devices.
    pub async fn init(self: &Arc<Self>) -> Result<(), RegistryError> {
        let (generation, future) = {
            let mut init = self.init_lock();
            match &*init {
                InitState::Ready => return Ok(()),
                InitState::Running { generation, future } => (*generation, future.clone()),
                InitState::Idle => {
                    let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    let registry = Arc::clone(self);
                    let task = tokio::spawn(async move { registry.enumerate().await });
                    let future: InitFuture = async move {
                        task.await.unwrap_or_else(|e| {
                            Err(RegistryError::DaemonUnavailable(format!(
                                "initialization task failed: {e}"
                            )))
                        })
                    }
                    .boxed()
                    .shared();
                    *init = InitState::Running {
                        generation,
                        future: future.clone(),
                    };
                    (generation, future)
                }
            }
        };

        let result = future.await;

        let ready = {
            let mut init = self.init_lock();
            let settles =
                matches!(&*init, InitState::Running { generation: g, .. } if *g == generation);
            if settles {
                *init = if result.is_ok() {
                    InitState::Ready
                } else {
                    InitState::Idle
                };
            }
            settles && result.is_ok()
        };

        if ready {
            info!("[{}] Initialized", self.name);
            self.start_poller();
        }
        result
    }

    async fn enumerate(&self) -> Result<(), RegistryError> {
        let _op = self.ops.lock().await;
        let listed = self.bounded(self.bridge.list_devices()).await.map_err(|e| {
            warn!("Device bridge unavailable: {}", e);
            RegistryError::DaemonUnavailable(e.to_string())
        })?;

        debug!("Bridge reports {} device(s)", listed.len());
        for BridgeDevice { udid, state } in listed {
            let device = self.describe(&udid, state).await;
            self.state.write().await.upsert(device);
        }
        Ok(())
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, BridgeError>>,
    ) -> Result<T, BridgeError> {
        with_timeout(self.config.connect_timeout, call).await
    }

    /// Describe a device. Property and interface queries that fail or time
    /// out leave those fields empty.
    async fn describe(&self, udid: &str, state: DeviceState) -> DeviceDescriptor {
        let mut device = DeviceDescriptor::new(udid, state);
        device.last_update = now_ms();

        if state == DeviceState::Device {
            match self.bounded(self.bridge.properties(udid)).await {
                Ok(properties) => device.properties = properties,
                Err(e) => debug!("Failed to read properties of {}: {}", udid, e),
            }
            match self.bounded(self.bridge.interfaces(udid)).await {
                Ok(interfaces) => device.interfaces = interfaces,
                Err(e) => debug!("Failed to read interfaces of {}: {}", udid, e),
            }
        }
        device
    }

    fn start_poller(self: &Arc<Self>) {
        let Some(interval) = self.config.poll_interval else {
            return;
        };

        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(registry) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = registry.reconcile().await {
                    debug!("Device poll failed: {}", e);
                }
            }
        });

        let previous = self
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Apply the bridge's current device list: new devices, state changes
    /// and disappearances.
    ///
    /// # Errors
    ///
    /// Returns the bridge error if listing devices fails; nothing is changed.
    pub async fn reconcile(&self) -> Result<(), BridgeError> {
        let _op = self.ops.lock().await;
        let listed = self.bounded(self.bridge.list_devices()).await?;
        let known = self.state.read().await.devices.clone();

        for BridgeDevice { udid, state } in &listed {
            match known.get(udid) {
                Some(existing) if existing.state == *state => {}
                Some(existing) => {
                    debug!("Device {} changed state to {:?}", udid, state);
                    let mut device = self.describe(udid, *state).await;
                    device.pid = existing.pid;
                    self.state.write().await.upsert(device);
                }
                None => {
                    info!("Device {} appeared", udid);
                    let device = self.describe(udid, *state).await;
                    self.state.write().await.upsert(device);
                }
            }
        }

        let gone: Vec<&String> = known
            .keys()
            .filter(|udid| !listed.iter().any(|d| &d.udid == *udid))
            .collect();
        if !gone.is_empty() {
            let mut state = self.state.write().await;
            for udid in gone {
                info!("Device {} disappeared", udid);
                state.remove(udid);
            }
        }
        Ok(())
    }

    /// Current descriptors in discovery order.
    pub async fn devices(&self) -> Vec<DeviceDescriptor> {
        self.state.read().await.snapshot()
    }

    pub async fn device(&self, udid: &str) -> Option<DeviceDescriptor> {
        self.state.read().await.devices.get(udid).cloned()
    }

    /// Register for events of `kinds` and take a snapshot atomically.
    pub async fn subscribe(&self, kinds: &[EventKind]) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_subscriber.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.write().await;
        let snapshot = state.snapshot();
        state.subscribers.insert(
            id,
            Subscriber {
                kinds: kinds.iter().copied().collect(),
                tx,
            },
        );
        trace!("Subscriber {} registered ({} devices)", id, snapshot.len());

        Subscription {
            id,
            snapshot,
            events: rx,
        }
    }

    /// Returns false if `id` was not subscribed.
    pub async fn unsubscribe(&self, id: u64) -> bool {
        self.state.write().await.subscribers.remove(&id).is_some()
    }

    pub async fn subscriber_count(&self) -> usize {
        self.state.read().await.subscribers.len()
    }

    /// Connect a network device through the bridge.
    ///
    /// Returns the existing udid if the device is already tracked.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::ConnectionFailed` with the bridge's diagnostic
    /// if the connection fails or times out.
    pub async fn add_device(&self, host: &str, port: u16) -> Result<String, RegistryError> {
        let _op = self.ops.lock().await;

        let udid = match self.bounded(self.bridge.connect(host, port)).await {
            Ok(udid) => udid,
            Err(BridgeError::Timeout(limit)) => {
                warn!("Timed out connecting {}:{}", host, port);
                return Err(RegistryError::ConnectionFailed(format!(
                    "Timed out connecting to {host}:{port} after {limit:?}"
                )));
            }
            Err(e) => {
                warn!("Failed to connect {}:{}: {}", host, port, e);
                return Err(RegistryError::ConnectionFailed(e.to_string()));
            }
        };

        if self.state.read().await.devices.contains_key(&udid) {
            debug!("Device {} already tracked", udid);
            return Ok(udid);
        }

        let device = self.describe(&udid, DeviceState::Device).await;
        self.state.write().await.upsert(device);
        info!("Device {} added", udid);
        Ok(udid)
    }

    /// Stop tracking a device: kill its control server if one runs, then
    /// disconnect it from the bridge. Failures of either step are logged and
    /// do not block removal.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::DeviceNotFound` for unknown udids.
    pub async fn remove_device(&self, udid: &str) -> Result<(), RegistryError> {
        let _op = self.ops.lock().await;

        let Some(device) = self.device(udid).await else {
            return Err(RegistryError::DeviceNotFound(udid.to_string()));
        };

        if device.pid != NO_PID
            && let Err(e) = self.bounded(self.bridge.kill_server(udid, device.pid)).await
        {
            warn!("Failed to kill server {} on {}: {}", device.pid, udid, e);
        }

        if let Err(e) = self.bounded(self.bridge.disconnect(udid)).await {
            warn!("Failed to disconnect {}: {}", udid, e);
        }

        self.state.write().await.remove(udid);
        info!("Device {} removed", udid);
        Ok(())
    }

    /// Run a control command. The registry is only updated when the bridge
    /// operation succeeds.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::DeviceNotFound` for unknown udids and
    /// `RegistryError::CommandExecutionFailed` if the bridge fails.
    pub async fn run_command(&self, command: ControlCommand) -> Result<CommandOutcome, RegistryError> {
        let _op = self.ops.lock().await;

        let udid = command.udid().to_string();
        let Some(mut device) = self.device(&udid).await else {
            return Err(RegistryError::DeviceNotFound(udid));
        };

        let outcome = match command {
            ControlCommand::StartServer { .. } => {
                if device.is_active() {
                    debug!("Server already running on {} (pid {})", udid, device.pid);
                    return Ok(CommandOutcome::ServerStarted { pid: device.pid });
                }
                let pid = self
                    .bounded(self.bridge.start_server(&udid))
                    .await
                    .map_err(|e| command_failed(&e))?;
                info!("Started server on {} (pid {})", udid, pid);
                device.pid = pid;
                CommandOutcome::ServerStarted { pid }
            }
            ControlCommand::KillServer { pid, .. } => {
                let pid = pid.filter(|p| *p != NO_PID).unwrap_or(device.pid);
                if pid == NO_PID {
                    return Err(RegistryError::CommandExecutionFailed(format!(
                        "No server running on {udid}"
                    )));
                }
                self.bounded(self.bridge.kill_server(&udid, pid))
                    .await
                    .map_err(|e| command_failed(&e))?;
                info!("Killed server {} on {}", pid, udid);
                if device.pid == pid {
                    device.pid = NO_PID;
                }
                CommandOutcome::ServerKilled
            }
            ControlCommand::UpdateInterfaces { .. } => {
                let interfaces = self
                    .bounded(self.bridge.interfaces(&udid))
                    .await
                    .map_err(|e| command_failed(&e))?;
                device.interfaces.clone_from(&interfaces);
                CommandOutcome::InterfacesUpdated(interfaces)
            }
        };

        device.last_update = now_ms();
        self.state.write().await.upsert(device);
        Ok(outcome)
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        if let Some(handle) = self
            .poller
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
