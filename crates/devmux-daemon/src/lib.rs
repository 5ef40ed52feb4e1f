//! devmux daemon library.
//!
//! Serves the multiplexed WebSocket endpoint and the saved-device REST API,
//! and owns the device registry that tracks devices through the debug bridge.
//!
//! - [`server`]: axum router, connection serving and start-up
//! - [`mw`]: middleware dispatcher, host tracker and device tracker
//! - [`registry`]: device registry and control plane
//! - [`bridge`]: debug-bridge client (`adb`)
//! - [`api`]: saved-device REST API and JSON store
//! - [`config`]: configuration and directories

pub mod api;
pub mod bridge;
pub mod config;
pub mod error;
pub mod mw;
pub mod registry;
pub mod server;

pub use api::DeviceStore;
pub use bridge::{AdbBridge, Bridge, BridgeDevice};
pub use config::{Config, Directories};
pub use error::{BridgeError, DaemonError, DispatchError, RegistryError, Result, StoreError};
pub use mw::{Dispatcher, Middleware, MiddlewareFactory};
pub use registry::{
    CommandOutcome, ControlCommand, DeviceEvent, DeviceRegistry, EventKind, RegistryConfig,
    Subscription,
};
pub use server::{AppState, auto_connect, router, run, serve, serve_stream, serve_streams};
