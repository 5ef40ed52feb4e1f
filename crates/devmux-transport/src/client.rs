//! WebSocket client for the devmux daemon.
//!
//! [`MuxConnection`] carries a client-side [`Multiplexer`] over one WebSocket.
//! [`HostTrackerClient`] plugs the host-tracking bootstrap into the
//! reconnection [`Supervisor`](crate::supervisor::Supervisor), and
//! [`TrackerChannel`] is a single tracking channel for one-shot commands.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use devmux_types::{
    ChannelCode, CommandEnvelope, CommandResult, Message as TrackerMessage, Platform,
    TrackerCommand, TrackerUpdate,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{ClientError, Result};
use crate::frame::{Frame, Payload};
use crate::mux::{Channel, MuxHandle, Multiplexer, Role};
use crate::supervisor::{CloseInfo, Connector, UpdateSink};

/// Close code reported when the peer closes without a status
const NO_STATUS_RECEIVED: u16 = 1005;

/// URL of the multiplexed endpoint on a daemon.
#[must_use]
pub fn multiplex_url(host: &str, port: u16) -> String {
    format!("ws://{host}:{port}/?action=multiplex")
}

/// A multiplexed WebSocket connection
pub struct MuxConnection {
    mux: MuxHandle,
    stop: CancellationToken,
    done: watch::Receiver<Option<CloseInfo>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl MuxConnection {
    /// Connect to `url` and start the reader and writer tasks.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::WebSocket` if the handshake fails.
    pub async fn connect(url: &str) -> Result<Self> {
        debug!("Connecting to {}", url);
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        let (mut mux, mut outbound) = Multiplexer::new(Role::Client, None);
        let handle = mux.handle();
        let stop = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(None);

        let writer_stop = stop.clone();
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = writer_stop.cancelled() => {
                        let close = CloseFrame {
                            code: CloseCode::Normal,
                            reason: "".into(),
                        };
                        let _ = write.send(Message::Close(Some(close))).await;
                        break;
                    }
                    frame = outbound.recv() => {
                        let Some(frame) = frame else { break };
                        trace!("Sending frame for channel {}", frame.channel_id());
                        if let Err(e) = write.send(Message::Binary(frame.to_bytes().to_vec())).await {
                            debug!("WebSocket write failed: {}", e);
                            break;
                        }
                    }
                }
            }
        });

        let reader_stop = stop.clone();
        let reader = tokio::spawn(async move {
            let close = loop {
                match read.next().await {
                    Some(Ok(Message::Binary(data))) => match Frame::decode(Bytes::from(data)) {
                        Ok(frame) => mux.handle_frame(frame),
                        Err(e) => mux.handle_malformed(&e),
                    },
                    Some(Ok(Message::Text(text))) => {
                        warn!("Ignoring text message on multiplexed connection ({} bytes)", text.len());
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map_or_else(
                            || CloseInfo::new(NO_STATUS_RECEIVED, ""),
                            |f| CloseInfo::new(u16::from(f.code), f.reason.to_string()),
                        );
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break CloseInfo::abnormal(e.to_string()),
                    None => break CloseInfo::abnormal("connection dropped"),
                }
            };

            debug!("Connection closed: {} {}", close.code, close.reason);
            mux.shutdown().await;
            reader_stop.cancel();
            let _ = done_tx.send(Some(close));
        });

        Ok(Self {
            mux: handle,
            stop,
            done: done_rx,
            reader,
            writer,
        })
    }

    #[must_use]
    pub fn handle(&self) -> MuxHandle {
        self.mux.clone()
    }

    #[must_use]
    pub fn open_channel(&self, code: ChannelCode) -> Channel {
        self.mux.open_channel(code)
    }

    /// Wait until the physical connection has closed.
    pub async fn closed(&mut self) -> CloseInfo {
        match self.done.wait_for(Option::is_some).await {
            Ok(info) => info
                .clone()
                .unwrap_or_else(|| CloseInfo::abnormal("connection task ended")),
            Err(_) => CloseInfo::abnormal("connection task ended"),
        }
    }

    /// Start a normal closure (1000) of the connection.
    pub fn close(&self) {
        self.stop.cancel();
    }
}

impl Drop for MuxConnection {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Decode a tracking channel payload.
///
/// # Errors
///
/// Returns an error if the payload is not a JSON tracking message.
pub fn decode_update(payload: &Payload) -> Result<TrackerUpdate> {
    let text = payload
        .as_text()
        .ok_or_else(|| ClientError::protocol("tracking message is not text"))?;
    let message: TrackerMessage = serde_json::from_str(text)?;
    Ok(TrackerUpdate::from_message(message)?)
}

/// Host-tracking bootstrap run by the reconnection supervisor.
///
/// Every session opens `HSTS`, waits for `HOSTS`, then opens a `GTRC`
/// channel per android tracker and forwards everything it receives.
#[derive(Debug, Clone)]
pub struct HostTrackerClient {
    url: String,
}

impl HostTrackerClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

async fn pump_tracker(mut channel: Channel, updates: mpsc::UnboundedSender<TrackerUpdate>) {
    while let Some(payload) = channel.recv().await {
        match decode_update(&payload) {
            Ok(update) => {
                if updates.send(update).is_err() {
                    break;
                }
            }
            Err(e) => warn!("Bad message on tracker channel {}: {}", channel.id(), e),
        }
    }
    channel.close();
}

#[async_trait]
impl Connector for HostTrackerClient {
    type Conn = MuxConnection;
    type Update = TrackerUpdate;

    async fn connect(&mut self) -> Result<MuxConnection> {
        MuxConnection::connect(&self.url).await
    }

    async fn run(&mut self, mut conn: MuxConnection, updates: &UpdateSink<TrackerUpdate>) -> CloseInfo {
        let mux = conn.handle();
        let mut hosts = mux.open_channel(ChannelCode::HSTS);
        let (tracker_tx, mut tracker_rx) = mpsc::unbounded_channel();
        let mut trackers = JoinSet::new();
        let mut hosts_open = true;

        loop {
            tokio::select! {
                close = conn.closed() => return close,
                payload = hosts.recv(), if hosts_open => {
                    let Some(payload) = payload else {
                        hosts_open = false;
                        continue;
                    };
                    match decode_update(&payload) {
                        Ok(TrackerUpdate::Hosts(data)) => {
                            for local in &data.local {
                                if local.kind == Platform::Android.as_str() {
                                    let channel = mux.open_channel(ChannelCode::GTRC);
                                    trackers.spawn(pump_tracker(channel, tracker_tx.clone()));
                                } else {
                                    debug!("Skipping unsupported tracker type {}", local.kind);
                                }
                            }
                            updates.send(TrackerUpdate::Hosts(data));
                        }
                        Ok(update) => {
                            updates.send(update);
                        }
                        Err(e) => warn!("Bad message on host tracker: {}", e),
                    }
                }
                Some(update) = tracker_rx.recv() => {
                    updates.send(update);
                }
            }
        }
    }
}

/// One tracking channel used for request/response style commands
pub struct TrackerChannel {
    conn: MuxConnection,
    channel: Channel,
    next_id: i64,
}

impl TrackerChannel {
    /// Connect to `url` and open a tracking channel of type `code`.
    ///
    /// # Errors
    ///
    /// Returns an error if the WebSocket connection fails.
    pub async fn open(url: &str, code: ChannelCode) -> Result<Self> {
        let conn = MuxConnection::connect(url).await?;
        let channel = conn.open_channel(code);
        Ok(Self {
            conn,
            channel,
            next_id: 1,
        })
    }

    /// Next update from the server.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::ConnectionClosed` once the channel is closed.
    pub async fn next_update(&mut self) -> Result<TrackerUpdate> {
        let payload = self
            .channel
            .recv()
            .await
            .ok_or(ClientError::ConnectionClosed)?;
        decode_update(&payload)
    }

    /// Send a command and wait for its correlated result, skipping other
    /// updates that arrive meanwhile.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Timeout` if no result arrives in time.
    pub async fn command(&mut self, command: TrackerCommand, timeout: Duration) -> Result<CommandResult> {
        let id = self.next_id;
        self.next_id += 1;

        let expected = command.result_kind();
        let envelope = CommandEnvelope::new(id, command);
        self.channel.send_json(&envelope.to_message()?)?;

        let wait = async {
            loop {
                if let TrackerUpdate::CommandResult {
                    id: result_id,
                    kind,
                    result,
                } = self.next_update().await?
                    && result_id == id
                    && kind == expected
                {
                    return Ok(result);
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ClientError::Timeout)?
    }

    /// Close the channel and the connection, waiting briefly for the peer.
    pub async fn close(mut self) -> CloseInfo {
        self.channel.close();
        self.conn.close();
        tokio::time::timeout(Duration::from_secs(2), self.conn.closed())
            .await
            .unwrap_or_else(|_| CloseInfo::abnormal("close timed out"))
    }
}
