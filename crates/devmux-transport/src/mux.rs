//! Channel multiplexer over one physical connection.
//!
//! A [`Multiplexer`] owns the routing table of one connection. The physical
//! reader feeds it decoded frames through [`Multiplexer::handle_frame`] in
//! arrival order; outbound frames are queued on an unbounded channel that the
//! physical writer drains, so channels are usable before the connection is
//! fully established.
//!
//! Channel ids are split by role: clients allocate odd ids, servers even ids.
//! Ids from either side are strictly increasing and never reused while the
//! connection lives.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use devmux_types::ChannelCode;
use futures_util::future::BoxFuture;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::ChannelError;
use crate::frame::{Frame, FrameError, GOING_AWAY, NORMAL_CLOSURE, PROTOCOL_ERROR, Payload, UNSUPPORTED};

/// Which end of the connection this multiplexer sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    fn first_id(self) -> u32 {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }

    /// Whether ids of this parity are allocated by this role.
    fn allocates(self, id: u32) -> bool {
        match self {
            Role::Client => id % 2 == 1,
            Role::Server => id % 2 == 0,
        }
    }
}

/// Claims channels opened by the peer.
///
/// On success the returned future drives the channel until it closes and is
/// spawned on the multiplexer's task set. Returning the channel back rejects
/// it; the multiplexer then closes it.
pub trait ChannelAcceptor: Send + Sync {
    /// # Errors
    ///
    /// Returns the channel unchanged when no handler claims its type code.
    fn accept(&self, channel: Channel) -> Result<BoxFuture<'static, ()>, Channel>;
}

/// Closed state of one channel, shared by its route, senders and link
#[derive(Default)]
struct CloseState {
    closed: AtomicBool,
    token: CancellationToken,
}

impl CloseState {
    fn closed() -> Arc<Self> {
        let state = Arc::new(Self::default());
        state.close();
        state
    }

    /// Mark the channel closed. Returns true for the first caller only.
    fn close(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::SeqCst);
        self.token.cancel();
        first
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct Route {
    code: ChannelCode,
    inbound: mpsc::UnboundedSender<Payload>,
    closed: Arc<CloseState>,
}

struct MuxState {
    routes: HashMap<u32, Route>,
    next_local: u32,
    highest_remote: u32,
    torn_down: bool,
}

struct Shared {
    role: Role,
    outbound: mpsc::UnboundedSender<Frame>,
    state: Mutex<MuxState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, MuxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_local(self: &Arc<Self>, code: ChannelCode) -> Channel {
        let mut state = self.lock();
        if state.torn_down {
            return Channel::dead(code, self.outbound.clone());
        }

        let id = state.next_local;
        let Some(next) = id.checked_add(2) else {
            warn!("Channel ids exhausted, refusing to open {}", code);
            return Channel::dead(code, self.outbound.clone());
        };
        state.next_local = next;

        let (channel, route) = Channel::routed(id, code, self);
        state.routes.insert(id, route);

        // Queued under the lock so the open frame precedes any data frame
        let _ = self.outbound.send(Frame::Open { id, code });
        trace!("Opened local channel {} ({})", id, code);
        channel
    }

    fn close_local(&self, id: u32, code: u16, reason: &str) {
        let removed = self.lock().routes.remove(&id);
        if let Some(route) = removed {
            route.closed.close();
            debug!("Closing channel {} ({}): code={}", id, route.code, code);
            let _ = self.outbound.send(Frame::close(id, code, reason));
        }
    }

    fn close_remote(&self, id: u32) -> bool {
        let removed = self.lock().routes.remove(&id);
        match removed {
            Some(route) => {
                route.closed.close();
                debug!("Peer closed channel {} ({})", id, route.code);
                true
            }
            None => false,
        }
    }

    fn teardown(&self) -> usize {
        let mut state = self.lock();
        state.torn_down = true;
        let count = state.routes.len();
        for (_, route) in state.routes.drain() {
            route.closed.close();
        }
        count
    }
}

/// Cloneable outbound half of a channel
#[derive(Clone)]
pub struct ChannelSender {
    id: u32,
    code: ChannelCode,
    outbound: mpsc::UnboundedSender<Frame>,
    closed: Arc<CloseState>,
    shared: Option<Arc<Shared>>,
}

impl ChannelSender {
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn code(&self) -> ChannelCode {
        self.code
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }

    /// Resolves once the channel is closed by either side or its
    /// connection is torn down.
    pub async fn closed(&self) {
        self.closed.token.cancelled().await;
    }

    /// Queue a payload on the channel.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Closed`] if the channel or its connection is gone.
    pub fn send(&self, payload: Payload) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        self.outbound
            .send(Frame::Data {
                id: self.id,
                payload,
            })
            .map_err(|_| ChannelError::Closed)
    }

    /// # Errors
    ///
    /// Returns [`ChannelError::Closed`] if the channel or its connection is gone.
    pub fn send_text(&self, text: impl Into<String>) -> Result<(), ChannelError> {
        self.send(Payload::Text(text.into()))
    }

    /// # Errors
    ///
    /// Returns [`ChannelError::Closed`] if the channel or its connection is gone.
    pub fn send_binary(&self, bytes: impl Into<Bytes>) -> Result<(), ChannelError> {
        self.send(Payload::Binary(bytes.into()))
    }

    /// Serialize `value` as JSON and send it as a text payload.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails or the channel is closed.
    pub fn send_json<T: Serialize>(&self, value: &T) -> Result<(), ChannelError> {
        let text = serde_json::to_string(value)?;
        self.send_text(text)
    }

    /// Close the channel. Closing twice is a no-op.
    pub fn close_with(&self, code: u16, reason: &str) {
        match &self.shared {
            Some(shared) => shared.close_local(self.id, code, reason),
            None => {
                if self.closed.close() {
                    let _ = self.outbound.send(Frame::close(self.id, code, reason));
                }
            }
        }
    }

    pub fn close(&self) {
        self.close_with(NORMAL_CLOSURE, "");
    }
}

impl fmt::Debug for ChannelSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSender")
            .field("id", &self.id)
            .field("code", &self.code)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// A logical sub-stream: send, receive and close like a connection.
pub struct Channel {
    sender: ChannelSender,
    inbound: mpsc::UnboundedReceiver<Payload>,
}

impl Channel {
    fn routed(id: u32, code: ChannelCode, shared: &Arc<Shared>) -> (Self, Route) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(CloseState::default());
        let channel = Channel {
            sender: ChannelSender {
                id,
                code,
                outbound: shared.outbound.clone(),
                closed: closed.clone(),
                shared: Some(shared.clone()),
            },
            inbound: inbound_rx,
        };
        let route = Route {
            code,
            inbound: inbound_tx,
            closed,
        };
        (channel, route)
    }

    fn dead(code: ChannelCode, outbound: mpsc::UnboundedSender<Frame>) -> Self {
        let (_, inbound_rx) = mpsc::unbounded_channel();
        Channel {
            sender: ChannelSender {
                id: 0,
                code,
                outbound,
                closed: CloseState::closed(),
                shared: None,
            },
            inbound: inbound_rx,
        }
    }

    /// A channel bound to a whole non-multiplexed connection.
    ///
    /// The returned link is the connection side: push inbound payloads into
    /// `inbound` (dropping it ends the channel), drain outbound frames
    /// (data and close) from `outbound`, and fire `hangup` when the
    /// connection goes away.
    #[must_use]
    pub fn standalone(code: ChannelCode) -> (Self, StandaloneLink) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(CloseState::default());
        let channel = Channel {
            sender: ChannelSender {
                id: 0,
                code,
                outbound: outbound_tx,
                closed: closed.clone(),
                shared: None,
            },
            inbound: inbound_rx,
        };
        let link = StandaloneLink {
            inbound: inbound_tx,
            outbound: outbound_rx,
            hangup: Hangup(closed),
        };
        (channel, link)
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.sender.id
    }

    #[must_use]
    pub fn code(&self) -> ChannelCode {
        self.sender.code
    }

    #[must_use]
    pub fn sender(&self) -> ChannelSender {
        self.sender.clone()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Resolves once the channel is closed by either side or its
    /// connection is torn down.
    pub async fn closed(&self) {
        self.sender.closed().await;
    }

    /// Next inbound payload, or `None` once the channel is closed and drained.
    pub async fn recv(&mut self) -> Option<Payload> {
        self.inbound.recv().await
    }

    /// # Errors
    ///
    /// Returns [`ChannelError::Closed`] if the channel or its connection is gone.
    pub fn send(&self, payload: Payload) -> Result<(), ChannelError> {
        self.sender.send(payload)
    }

    /// # Errors
    ///
    /// Returns [`ChannelError::Closed`] if the channel or its connection is gone.
    pub fn send_text(&self, text: impl Into<String>) -> Result<(), ChannelError> {
        self.sender.send_text(text)
    }

    /// # Errors
    ///
    /// Returns an error if serialization fails or the channel is closed.
    pub fn send_json<T: Serialize>(&self, value: &T) -> Result<(), ChannelError> {
        self.sender.send_json(value)
    }

    pub fn close(&self) {
        self.sender.close();
    }

    pub fn close_with(&self, code: u16, reason: &str) {
        self.sender.close_with(code, reason);
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.sender.id)
            .field("code", &self.sender.code)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Connection side of a [`Channel::standalone`] channel
#[derive(Debug)]
pub struct StandaloneLink {
    pub inbound: mpsc::UnboundedSender<Payload>,
    pub outbound: mpsc::UnboundedReceiver<Frame>,
    pub hangup: Hangup,
}

/// Closes a standalone channel from the connection side without sending a
/// close frame.
#[derive(Clone)]
pub struct Hangup(Arc<CloseState>);

impl Hangup {
    pub fn hang_up(&self) {
        self.0.close();
    }
}

impl fmt::Debug for Hangup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hangup")
            .field("closed", &self.0.is_closed())
            .finish()
    }
}

/// Cloneable handle for opening channels from other tasks
#[derive(Clone)]
pub struct MuxHandle {
    shared: Arc<Shared>,
}

impl MuxHandle {
    /// Open a locally-initiated channel. On a torn-down connection the
    /// returned channel is already closed.
    #[must_use]
    pub fn open_channel(&self, code: ChannelCode) -> Channel {
        self.shared.open_local(code)
    }

    #[must_use]
    pub fn open_count(&self) -> usize {
        self.shared.lock().routes.len()
    }
}

impl fmt::Debug for MuxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MuxHandle")
            .field("role", &self.shared.role)
            .finish_non_exhaustive()
    }
}

/// Routing table and handler tasks of one physical connection.
///
/// Call [`Multiplexer::shutdown`] when the physical connection ends; dropping
/// the multiplexer instead aborts handler tasks without letting them release.
pub struct Multiplexer {
    shared: Arc<Shared>,
    acceptor: Option<Arc<dyn ChannelAcceptor>>,
    tasks: JoinSet<()>,
}

impl Multiplexer {
    /// Create a multiplexer and the queue of frames to write to the peer.
    ///
    /// Without an acceptor every peer-opened channel is rejected.
    #[must_use]
    pub fn new(
        role: Role,
        acceptor: Option<Arc<dyn ChannelAcceptor>>,
    ) -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            role,
            outbound: outbound_tx,
            state: Mutex::new(MuxState {
                routes: HashMap::new(),
                next_local: role.first_id(),
                highest_remote: 0,
                torn_down: false,
            }),
        });

        let mux = Self {
            shared,
            acceptor,
            tasks: JoinSet::new(),
        };
        (mux, outbound_rx)
    }

    #[must_use]
    pub fn handle(&self) -> MuxHandle {
        MuxHandle {
            shared: self.shared.clone(),
        }
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.shared.role
    }

    #[must_use]
    pub fn open_channel(&self, code: ChannelCode) -> Channel {
        self.shared.open_local(code)
    }

    #[must_use]
    pub fn open_count(&self) -> usize {
        self.shared.lock().routes.len()
    }

    /// Route one inbound frame.
    pub fn handle_frame(&mut self, frame: Frame) {
        while self.tasks.try_join_next().is_some() {}

        match frame {
            Frame::Open { id, code } => self.accept_remote(id, code),
            Frame::Data { id, payload } => self.route(id, payload),
            Frame::Close { id, code, reason } => {
                if self.shared.close_remote(id) {
                    trace!("Channel {} closed by peer: {} {}", id, code, reason);
                } else {
                    trace!("Close for unknown channel {}", id);
                }
            }
        }
    }

    /// Log a frame that failed to parse and close the channel it addressed.
    pub fn handle_malformed(&mut self, error: &FrameError) {
        warn!("Malformed frame: {}", error);

        let Some(id) = error.channel_id() else {
            return;
        };

        let known = self.shared.lock().routes.contains_key(&id);
        if known {
            self.shared.close_local(id, PROTOCOL_ERROR, &error.to_string());
        } else {
            let _ = self
                .shared
                .outbound
                .send(Frame::close(id, PROTOCOL_ERROR, error.to_string()));
        }
    }

    fn accept_remote(&mut self, id: u32, code: ChannelCode) {
        let channel = {
            let mut state = self.shared.lock();
            if state.torn_down {
                return;
            }
            if id == 0
                || self.shared.role.allocates(id)
                || id <= state.highest_remote
                || state.routes.contains_key(&id)
            {
                warn!(
                    "Rejecting open frame for channel {} ({}): id not allocatable by peer",
                    id, code
                );
                return;
            }
            state.highest_remote = id;

            let (channel, route) = Channel::routed(id, code, &self.shared);
            state.routes.insert(id, route);
            channel
        };

        let Some(acceptor) = &self.acceptor else {
            debug!("Peer opened channel {} ({}) but nothing accepts channels", id, code);
            channel.close_with(UNSUPPORTED, "Channels not accepted");
            return;
        };

        match acceptor.accept(channel) {
            Ok(task) => {
                debug!("Channel {} ({}) accepted", id, code);
                self.tasks.spawn(task);
            }
            Err(channel) => {
                debug!("No handler for channel {} ({})", id, code);
                channel.close_with(UNSUPPORTED, &format!("Unsupported channel type {code}"));
            }
        }
    }

    fn route(&mut self, id: u32, payload: Payload) {
        let delivered = {
            let state = self.shared.lock();
            let Some(route) = state.routes.get(&id) else {
                trace!("Dropping data for unknown channel {}", id);
                return;
            };
            route.inbound.send(payload).is_ok()
        };

        if !delivered {
            // Receiver was dropped without closing
            self.shared.close_local(id, GOING_AWAY, "");
        }
    }

    /// Tear down every channel and wait for all handler tasks to finish.
    ///
    /// Returns the number of channels that were still open.
    pub async fn shutdown(mut self) -> usize {
        let closed = self.shared.teardown();
        debug!("Connection closed with {} open channel(s)", closed);

        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result
                && e.is_panic()
            {
                warn!("Channel handler panicked: {}", e);
            }
        }

        closed
    }
}

impl fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("role", &self.shared.role)
            .field("open", &self.open_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Accepts every channel and counts how often a handler finished.
    struct CountingAcceptor {
        releases: Arc<AtomicUsize>,
        only: Option<ChannelCode>,
    }

    impl ChannelAcceptor for CountingAcceptor {
        fn accept(&self, mut channel: Channel) -> Result<BoxFuture<'static, ()>, Channel> {
            if self.only.is_some_and(|code| code != channel.code()) {
                return Err(channel);
            }
            let releases = self.releases.clone();
            Ok(Box::pin(async move {
                while let Some(payload) = channel.recv().await {
                    let _ = channel.send(payload);
                }
                releases.fetch_add(1, Ordering::SeqCst);
            }))
        }
    }

    fn server(only: Option<ChannelCode>) -> (Multiplexer, mpsc::UnboundedReceiver<Frame>, Arc<AtomicUsize>) {
        let releases = Arc::new(AtomicUsize::new(0));
        let acceptor = CountingAcceptor {
            releases: releases.clone(),
            only,
        };
        let (mux, rx) = Multiplexer::new(Role::Server, Some(Arc::new(acceptor)));
        (mux, rx, releases)
    }

    #[test]
    fn local_ids_follow_role_parity() {
        let (client, mut rx) = Multiplexer::new(Role::Client, None);
        let a = client.open_channel(ChannelCode::HSTS);
        let b = client.open_channel(ChannelCode::GTRC);
        assert_eq!((a.id(), b.id()), (1, 3));
        assert_eq!(
            rx.try_recv().unwrap(),
            Frame::Open {
                id: 1,
                code: ChannelCode::HSTS
            }
        );

        let (server, _rx) = Multiplexer::new(Role::Server, None);
        assert_eq!(server.open_channel(ChannelCode::SHEL).id(), 2);
    }

    #[test]
    fn closed_local_id_is_not_reused() {
        let (client, _rx) = Multiplexer::new(Role::Client, None);
        let a = client.open_channel(ChannelCode::HSTS);
        a.close();
        assert!(a.is_closed());
        let b = client.open_channel(ChannelCode::HSTS);
        assert_ne!(a.id(), b.id());
        assert_eq!(client.open_count(), 1);
    }

    #[tokio::test]
    async fn data_is_routed_and_echoed() {
        let (mut mux, mut rx, _) = server(None);
        mux.handle_frame(Frame::Open {
            id: 1,
            code: ChannelCode::GTRC,
        });
        mux.handle_frame(Frame::Data {
            id: 1,
            payload: Payload::from("ping"),
        });

        let echoed = rx.recv().await.unwrap();
        assert_eq!(
            echoed,
            Frame::Data {
                id: 1,
                payload: Payload::from("ping")
            }
        );
    }

    #[tokio::test]
    async fn unmatched_channel_is_closed_immediately() {
        let (mut mux, mut rx, releases) = server(Some(ChannelCode::GTRC));
        mux.handle_frame(Frame::Open {
            id: 1,
            code: ChannelCode::SHEL,
        });

        let frame = rx.recv().await.unwrap();
        assert!(matches!(frame, Frame::Close { id: 1, code: UNSUPPORTED, .. }));
        assert_eq!(mux.open_count(), 0);
        assert_eq!(mux.shutdown().await, 0);
        assert_eq!(releases.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn data_for_unknown_channel_is_dropped() {
        let (mut mux, mut rx, _) = server(None);
        mux.handle_frame(Frame::Data {
            id: 41,
            payload: Payload::from("late"),
        });
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn peer_cannot_reuse_or_rewind_ids() {
        let (mut mux, _rx, _) = server(None);
        mux.handle_frame(Frame::Open {
            id: 5,
            code: ChannelCode::GTRC,
        });
        mux.handle_frame(Frame::Close {
            id: 5,
            code: NORMAL_CLOSURE,
            reason: String::new(),
        });
        mux.handle_frame(Frame::Open {
            id: 5,
            code: ChannelCode::GTRC,
        });
        mux.handle_frame(Frame::Open {
            id: 3,
            code: ChannelCode::GTRC,
        });
        // Server-parity id from the client side
        mux.handle_frame(Frame::Open {
            id: 8,
            code: ChannelCode::GTRC,
        });
        assert_eq!(mux.open_count(), 0);
    }

    #[tokio::test]
    async fn peer_close_releases_handler_once() {
        let (mut mux, _rx, releases) = server(None);
        mux.handle_frame(Frame::Open {
            id: 1,
            code: ChannelCode::GTRC,
        });
        mux.handle_frame(Frame::close(1, NORMAL_CLOSURE, ""));
        mux.handle_frame(Frame::close(1, NORMAL_CLOSURE, ""));

        assert_eq!(mux.shutdown().await, 0);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn teardown_releases_every_open_channel() {
        let (mut mux, _rx, releases) = server(None);
        for id in [1, 3, 5, 7] {
            mux.handle_frame(Frame::Open {
                id,
                code: ChannelCode::GTRC,
            });
        }
        let local = mux.open_channel(ChannelCode::HSTS);

        assert_eq!(mux.shutdown().await, 5);
        assert_eq!(releases.load(Ordering::SeqCst), 4);
        assert!(local.is_closed());
    }

    #[tokio::test]
    async fn open_after_teardown_yields_closed_channel() {
        let (mux, _rx) = Multiplexer::new(Role::Client, None);
        let handle = mux.handle();
        mux.shutdown().await;

        let mut channel = handle.open_channel(ChannelCode::HSTS);
        assert!(channel.is_closed());
        assert!(channel.send_text("x").is_err());
        assert!(channel.recv().await.is_none());
    }

    #[tokio::test]
    async fn malformed_frame_closes_its_channel() {
        let (mut mux, mut rx, releases) = server(None);
        mux.handle_frame(Frame::Open {
            id: 1,
            code: ChannelCode::GTRC,
        });
        mux.handle_malformed(&FrameError::InvalidText { id: 1 });

        let frame = rx.recv().await.unwrap();
        assert!(matches!(frame, Frame::Close { id: 1, code: PROTOCOL_ERROR, .. }));
        assert_eq!(mux.shutdown().await, 0);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn standalone_channel_round_trip() {
        let (mut channel, mut link) = Channel::standalone(ChannelCode::GTRC);
        link.inbound.send(Payload::from("hello")).unwrap();
        assert_eq!(channel.recv().await, Some(Payload::from("hello")));

        channel.send_text("world").unwrap();
        channel.close();
        channel.close();
        assert_eq!(
            link.outbound.recv().await,
            Some(Frame::Data {
                id: 0,
                payload: Payload::from("world")
            })
        );
        assert!(matches!(
            link.outbound.recv().await,
            Some(Frame::Close { id: 0, .. })
        ));
        assert!(link.outbound.try_recv().is_err());

        drop(link);
        assert!(channel.recv().await.is_none());
    }

    /// Parks in a task until the channel closes, without reading it.
    struct ParkingAcceptor;

    impl ChannelAcceptor for ParkingAcceptor {
        fn accept(&self, channel: Channel) -> Result<BoxFuture<'static, ()>, Channel> {
            Ok(Box::pin(async move { channel.closed().await }))
        }
    }

    #[tokio::test]
    async fn closed_resolves_on_peer_close_and_teardown() {
        let (mut mux, _rx) = Multiplexer::new(Role::Server, Some(Arc::new(ParkingAcceptor)));
        mux.handle_frame(Frame::Open {
            id: 1,
            code: ChannelCode::GTRC,
        });
        mux.handle_frame(Frame::Open {
            id: 3,
            code: ChannelCode::GTRC,
        });
        let local = mux.open_channel(ChannelCode::HSTS);

        mux.handle_frame(Frame::close(1, NORMAL_CLOSURE, ""));
        let closed = tokio::time::timeout(std::time::Duration::from_secs(5), mux.shutdown()).await;
        assert_eq!(closed.unwrap(), 2);
        local.closed().await;
    }

    #[tokio::test]
    async fn standalone_hangup_closes_silently() {
        let (channel, mut link) = Channel::standalone(ChannelCode::GTRC);
        link.hangup.hang_up();
        channel.closed().await;
        assert!(channel.is_closed());

        channel.close();
        assert!(link.outbound.try_recv().is_err());
    }
}
