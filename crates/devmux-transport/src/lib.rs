//! Channel multiplexing transport for devmux.
//!
//! One physical connection (a WebSocket, or any byte stream framed with
//! [`FrameCodec`]) carries many independent logical channels, each tagged
//! with a 4-byte type code.
//!
//! # Architecture
//!
//! - [`frame`]: binary frame model (open, data, close)
//! - [`codec`]: length-prefixed codec for byte streams
//! - [`mux`]: multiplexer, channels and the acceptor seam used by servers
//! - [`supervisor`]: client reconnection state machine
//! - [`client`]: WebSocket client, host-tracking bootstrap and command channel
//! - [`error`]: error types
//!
//! # Example
//!
//! ```no_run
//! use devmux_transport::{HostTrackerClient, Supervisor, SupervisorEvent, multiplex_url};
//! use devmux_transport::supervisor::DEFAULT_RECONNECT_DELAY;
//!
//! # async fn example() {
//! let client = HostTrackerClient::new(multiplex_url("127.0.0.1", 8000));
//! let (supervisor, mut events) = Supervisor::start(client, DEFAULT_RECONNECT_DELAY);
//!
//! while let Some(event) = events.recv().await {
//!     if let SupervisorEvent::Update(update) = event {
//!         println!("{update:?}");
//!     }
//! }
//! supervisor.destroy();
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod error;
pub mod frame;
pub mod mux;
pub mod supervisor;

pub use client::{HostTrackerClient, MuxConnection, TrackerChannel, decode_update, multiplex_url};
pub use codec::{CodecError, FrameCodec, MAX_FRAME_SIZE};
pub use error::{ChannelError, ClientError, Result};
pub use frame::{
    ABNORMAL_CLOSURE, Frame, FrameError, GOING_AWAY, NORMAL_CLOSURE, PROTOCOL_ERROR, Payload,
    UNSUPPORTED,
};
pub use mux::{
    Channel, ChannelAcceptor, ChannelSender, Hangup, MuxHandle, Multiplexer, Role,
    StandaloneLink,
};
pub use supervisor::{CloseInfo, Connector, Phase, Supervisor, SupervisorEvent, UpdateSink};

pub use devmux_types::ChannelCode;
