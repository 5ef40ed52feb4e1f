//! HTTP and WebSocket server for the devmux daemon.
//!
//! `GET /?action=multiplex` upgrades to a multiplexed connection served by a
//! server-side [`Multiplexer`] with the [`Dispatcher`] as channel acceptor.
//! Any other `action` binds one middleware to the whole connection; actions
//! no middleware serves are rejected with 400 before the upgrade.
//!
//! With `server.streamPort` set, the same multiplexed protocol is also served
//! over raw TCP, each frame behind a length prefix ([`FrameCodec`]).

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use axum::Router;
use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use devmux_transport::{
    Channel, ChannelAcceptor, Frame, FrameCodec, Multiplexer, Payload, Role, StandaloneLink,
};
use futures_util::{Sink, SinkExt, StreamExt};
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::api::{self, DeviceStore};
use crate::bridge::AdbBridge;
use crate::config::{Config, Directories};
use crate::error::{DispatchError, Result};
use crate::mw::device_tracker::TRACKER_TYPE;
use crate::mw::{DeviceTrackerFactory, Dispatcher, HostTrackerFactory, Middleware, MiddlewareFactory, drive};
use crate::registry::{DeviceRegistry, RegistryConfig};

/// `action` value selecting the multiplexed protocol
pub const MULTIPLEX_ACTION: &str = "multiplex";

/// Shared state handed to every request
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<DeviceRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub store: Arc<DeviceStore>,
}

impl AppState {
    /// State with the shipped middlewares: host tracker and Android device tracker.
    ///
    /// # Errors
    ///
    /// Returns a `DispatchError` if the middleware set is inconsistent.
    pub fn new(registry: Arc<DeviceRegistry>, store: Arc<DeviceStore>) -> std::result::Result<Self, DispatchError> {
        let factories: Vec<Arc<dyn MiddlewareFactory>> = vec![
            Arc::new(HostTrackerFactory::new([TRACKER_TYPE])),
            Arc::new(DeviceTrackerFactory::new(registry.clone())),
        ];
        Ok(Self {
            registry,
            dispatcher: Arc::new(Dispatcher::new(factories)?),
            store,
        })
    }
}

#[derive(Debug, Deserialize)]
struct EntryQuery {
    action: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(ws_entry))
        .nest("/api", api::router())
        .with_state(state)
}

async fn ws_entry(
    State(state): State<AppState>,
    Query(query): Query<EntryQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    match query.action.as_deref() {
        Some(MULTIPLEX_ACTION) => {
            let dispatcher = state.dispatcher.clone();
            ws.on_upgrade(move |socket| serve_multiplexed(socket, dispatcher))
        }
        Some(action) => match state.dispatcher.claim_request(action) {
            Ok((handler, channel, link)) => {
                debug!("Serving action {:?} on a dedicated connection", action);
                ws.on_upgrade(move |socket| serve_request(socket, handler, channel, link))
            }
            Err(e) => {
                debug!("Rejecting upgrade: {}", e);
                (StatusCode::BAD_REQUEST, e.to_string()).into_response()
            }
        },
        None => (StatusCode::BAD_REQUEST, "Missing action parameter").into_response(),
    }
}

/// Forward multiplexer output to `sink` until `stop` fires or the sink fails.
fn spawn_writer<K, T>(
    mut sink: K,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    stop: CancellationToken,
    wrap: fn(Frame) -> T,
) -> JoinHandle<()>
where
    K: Sink<T> + Unpin + Send + 'static,
    K::Error: Display,
    T: Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                () = stop.cancelled() => break,
                frame = outbound.recv() => {
                    let Some(frame) = frame else { break };
                    trace!("Sending frame for channel {}", frame.channel_id());
                    if let Err(e) = sink.send(wrap(frame)).await {
                        debug!("Connection write failed: {}", e);
                        break;
                    }
                }
            }
        }
        let _ = sink.close().await;
    })
}

async fn serve_multiplexed(socket: WebSocket, dispatcher: Arc<Dispatcher>) {
    let (sink, mut stream) = socket.split();
    let acceptor: Arc<dyn ChannelAcceptor> = dispatcher;
    let (mut mux, outbound) = Multiplexer::new(Role::Server, Some(acceptor));
    let stop = CancellationToken::new();
    let writer = spawn_writer(sink, outbound, stop.clone(), |frame| {
        WsMessage::Binary(frame.to_bytes())
    });

    debug!("Multiplexed connection opened");
    while let Some(message) = stream.next().await {
        match message {
            Ok(WsMessage::Binary(data)) => match Frame::decode(data) {
                Ok(frame) => mux.handle_frame(frame),
                Err(e) => mux.handle_malformed(&e),
            },
            Ok(WsMessage::Text(text)) => {
                warn!("Ignoring text message on multiplexed connection ({} bytes)", text.len());
            }
            Ok(WsMessage::Close(frame)) => {
                if let Some(frame) = frame {
                    debug!("Peer closed connection: {} {}", frame.code, frame.reason.as_str());
                }
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!("WebSocket read failed: {}", e);
                break;
            }
        }
    }

    let released = mux.shutdown().await;
    stop.cancel();
    let _ = writer.await;
    info!("Multiplexed connection closed ({} channel(s) released)", released);
}

/// Serve one multiplexed connection over a length-prefixed byte stream.
///
/// A frame body that fails to parse closes only the channel it named; an
/// oversized length prefix or a read error ends the connection.
pub async fn serve_stream<S>(io: S, dispatcher: Arc<Dispatcher>) -> usize
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, mut frames) = Framed::new(io, FrameCodec::new()).split();
    let acceptor: Arc<dyn ChannelAcceptor> = dispatcher;
    let (mut mux, outbound) = Multiplexer::new(Role::Server, Some(acceptor));
    let stop = CancellationToken::new();
    let writer = spawn_writer(sink, outbound, stop.clone(), |frame| frame);

    debug!("Stream connection opened");
    while let Some(item) = frames.next().await {
        match item {
            Ok(Ok(frame)) => mux.handle_frame(frame),
            Ok(Err(e)) => mux.handle_malformed(&e),
            Err(e) => {
                debug!("Stream read failed: {}", e);
                break;
            }
        }
    }

    let released = mux.shutdown().await;
    stop.cancel();
    let _ = writer.await;
    info!("Stream connection closed ({} channel(s) released)", released);
    released
}

/// Accept stream connections on `listener` until `shutdown` fires.
pub async fn serve_streams(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                debug!("Stream connection from {}", peer);
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Failed to disable Nagle for {}: {}", peer, e);
                }
                tokio::spawn(serve_stream(stream, dispatcher.clone()));
            }
            Err(e) => warn!("Failed to accept stream connection: {}", e),
        }
    }
}

fn to_ws(frame: Frame) -> Option<WsMessage> {
    match frame {
        Frame::Data {
            payload: Payload::Text(text),
            ..
        } => Some(WsMessage::Text(text.into())),
        Frame::Data {
            payload: Payload::Binary(bytes),
            ..
        } => Some(WsMessage::Binary(bytes)),
        Frame::Close { code, reason, .. } => Some(WsMessage::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        }))),
        Frame::Open { .. } => None,
    }
}

async fn serve_request(
    socket: WebSocket,
    handler: Box<dyn Middleware>,
    channel: Channel,
    link: StandaloneLink,
) {
    let StandaloneLink {
        inbound,
        mut outbound,
        hangup,
    } = link;
    let (mut sink, mut stream) = socket.split();

    let task = tokio::spawn(drive(handler, channel));
    let mut writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let closing = matches!(frame, Frame::Close { .. });
            if let Some(message) = to_ws(frame)
                && sink.send(message).await.is_err()
            {
                break;
            }
            if closing {
                break;
            }
        }
    });

    let mut writer_done = false;
    loop {
        tokio::select! {
            _ = &mut writer => {
                writer_done = true;
                break;
            }
            message = stream.next() => {
                let payload = match message {
                    Some(Ok(WsMessage::Text(text))) => Payload::Text(text.as_str().to_owned()),
                    Some(Ok(WsMessage::Binary(bytes))) => Payload::Binary(bytes),
                    Some(Ok(WsMessage::Close(_)) | Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                if inbound.send(payload).is_err() {
                    break;
                }
            }
        }
    }

    hangup.hang_up();
    drop(inbound);
    if let Err(e) = task.await {
        warn!("Request handler failed: {}", e);
    }
    if !writer_done {
        let _ = writer.await;
    }
    debug!("Dedicated connection closed");
}

/// Connect every saved device through the registry, stamping
/// `lastConnected` on success. Returns the number connected.
pub async fn auto_connect(registry: &DeviceRegistry, store: &DeviceStore) -> usize {
    let devices = store.list_or_empty().await;
    if devices.is_empty() {
        debug!("No saved devices, skipping auto-connect");
        return 0;
    }

    info!("Auto-connecting {} saved device(s)", devices.len());
    let mut connected = 0;
    for device in devices {
        match registry.add_device(&device.host, device.port).await {
            Ok(udid) => {
                info!("Connected to {} ({})", device.name, udid);
                connected += 1;
                if let Err(e) = store
                    .upsert(&device.name, &device.host, device.port, true)
                    .await
                {
                    warn!("Failed to update {}: {}", store.path().display(), e);
                }
            }
            Err(e) => warn!("Failed to connect to {}: {}", device.name, e),
        }
    }
    connected
}

/// Serve `state` on `listener` until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

/// Run the daemon with `config` until interrupted.
///
/// # Errors
///
/// Returns an error if the middleware set is inconsistent or the listener
/// cannot be bound.
pub async fn run(config: Config, dirs: &Directories) -> Result<()> {
    let bridge = Arc::new(AdbBridge::new(
        config.adb.binary.clone(),
        config.adb.server_command.clone(),
    ));
    let registry = Arc::new(DeviceRegistry::new(
        bridge,
        RegistryConfig {
            name: config.server.name.clone(),
            connect_timeout: config.adb.connect_timeout(),
            poll_interval: config.adb.poll_interval(),
        },
    ));
    let store = Arc::new(DeviceStore::new(config.devices_path(dirs)));
    let state = AppState::new(registry.clone(), store.clone())?;
    info!("{} ({})", registry.name(), registry.id());

    {
        let registry = registry.clone();
        let auto_connect_enabled = config.auto_connect;
        tokio::spawn(async move {
            if let Err(e) = registry.init().await {
                warn!("Initial device enumeration failed: {}", e);
            }
            if auto_connect_enabled {
                auto_connect(&registry, &store).await;
            }
        });
    }

    let listener = TcpListener::bind((config.server.host.as_str(), config.server.port)).await?;
    info!("Listening on {}", listener.local_addr()?);

    let stopping = CancellationToken::new();
    if let Some(port) = config.server.stream_port {
        let streams = TcpListener::bind((config.server.host.as_str(), port)).await?;
        info!("Accepting stream connections on {}", streams.local_addr()?);
        tokio::spawn(serve_streams(streams, state.dispatcher.clone(), stopping.clone()));
    }

    let shutdown = {
        let stopping = stopping.clone();
        async move {
            shutdown_signal().await;
            stopping.cancel();
        }
    };
    serve(listener, state, shutdown).await?;
    info!("Server stopped");
    Ok(())
}
