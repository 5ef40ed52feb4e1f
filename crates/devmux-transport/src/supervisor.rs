//! Reconnection supervisor for client connections.
//!
//! The supervisor runs a [`Connector`] in a loop:
//! `Connecting -> Open -> Closed(code, reason)`. A close with code 1000 ends
//! the loop; any other code schedules exactly one reconnection after a fixed
//! delay. Connect failures count as abnormal closure (1006).
//!
//! [`Supervisor::destroy`] is synchronous: once it returns no further event is
//! delivered and no connection is attempted.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ClientError;
use crate::frame::{ABNORMAL_CLOSURE, NORMAL_CLOSURE};

/// Delay before reconnecting after an abnormal close
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn normal() -> Self {
        Self::new(NORMAL_CLOSURE, "")
    }

    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self::new(ABNORMAL_CLOSURE, reason)
    }

    #[must_use]
    pub fn is_normal(&self) -> bool {
        self.code == NORMAL_CLOSURE
    }
}

/// Events delivered to the supervisor's owner
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent<U> {
    Connecting { attempt: u32 },
    Open,
    Update(U),
    Closed(CloseInfo),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    Open,
    Closed,
    /// Stopped after a normal close or `destroy()`
    Stopped,
}

/// One connection attempt plus the session that runs on it
#[async_trait]
pub trait Connector: Send + 'static {
    type Conn: Send;
    type Update: Send + 'static;

    /// Establish the physical connection.
    async fn connect(&mut self) -> Result<Self::Conn, ClientError>;

    /// Run the session until the connection closes, reporting updates.
    async fn run(&mut self, conn: Self::Conn, updates: &UpdateSink<Self::Update>) -> CloseInfo;
}

struct Gate<U> {
    events: Mutex<Option<mpsc::UnboundedSender<SupervisorEvent<U>>>>,
}

impl<U> Gate<U> {
    fn lock(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<SupervisorEvent<U>>>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SupervisorEvent<U>) -> bool {
        match self.lock().as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    fn close(&self) {
        self.lock().take();
    }
}

/// Where a running session reports its updates
pub struct UpdateSink<U> {
    gate: Arc<Gate<U>>,
}

impl<U> UpdateSink<U> {
    /// Deliver an update. Returns false once the supervisor is destroyed.
    pub fn send(&self, update: U) -> bool {
        self.gate.emit(SupervisorEvent::Update(update))
    }
}

/// Handle to a running reconnection loop
pub struct Supervisor<U> {
    cancel: CancellationToken,
    gate: Arc<Gate<U>>,
    phase: watch::Receiver<Phase>,
    task: JoinHandle<()>,
}

impl<U: Send + 'static> Supervisor<U> {
    /// Start supervising `connector`. Events arrive on the returned receiver,
    /// which ends when the loop stops.
    pub fn start<C>(connector: C, delay: Duration) -> (Self, mpsc::UnboundedReceiver<SupervisorEvent<U>>)
    where
        C: Connector<Update = U>,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let gate = Arc::new(Gate {
            events: Mutex::new(Some(tx)),
        });
        let cancel = CancellationToken::new();
        let (phase_tx, phase_rx) = watch::channel(Phase::Connecting);

        let task = tokio::spawn(supervise(
            connector,
            delay,
            cancel.clone(),
            gate.clone(),
            phase_tx,
        ));

        let supervisor = Self {
            cancel,
            gate,
            phase: phase_rx,
            task,
        };
        (supervisor, rx)
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the loop and cancel any in-flight connect, session or delay.
    pub fn destroy(&self) {
        self.gate.close();
        self.cancel.cancel();
    }
}

impl<U> Drop for Supervisor<U> {
    fn drop(&mut self) {
        self.gate.close();
        self.cancel.cancel();
    }
}

async fn supervise<C: Connector>(
    mut connector: C,
    delay: Duration,
    cancel: CancellationToken,
    gate: Arc<Gate<C::Update>>,
    phase: watch::Sender<Phase>,
) {
    let sink = UpdateSink { gate: gate.clone() };
    let mut attempt: u32 = 0;

    loop {
        attempt = attempt.saturating_add(1);
        phase.send_replace(Phase::Connecting);
        if !gate.emit(SupervisorEvent::Connecting { attempt }) {
            break;
        }

        let connected = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            result = connector.connect() => result,
        };

        let close = match connected {
            Ok(conn) => {
                debug!("Connection attempt {} succeeded", attempt);
                phase.send_replace(Phase::Open);
                if !gate.emit(SupervisorEvent::Open) {
                    break;
                }
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    close = connector.run(conn, &sink) => close,
                }
            }
            Err(e) => {
                warn!("Connection attempt {} failed: {}", attempt, e);
                CloseInfo::abnormal(e.to_string())
            }
        };

        phase.send_replace(Phase::Closed);
        let normal = close.is_normal();
        if !gate.emit(SupervisorEvent::Closed(close)) {
            break;
        }
        if normal {
            info!("Connection closed normally, not reconnecting");
            break;
        }

        debug!("Reconnecting in {:?}", delay);
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }

    phase.send_replace(Phase::Stopped);
    gate.close();
}
