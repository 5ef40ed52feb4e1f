//! Middlewares and the dispatcher that binds them to channels.
//!
//! A [`MiddlewareFactory`] claims channels by type code (multiplexed path) or
//! by the `action` query parameter (one-shot WebSocket upgrades). The
//! [`Dispatcher`] holds the ordered factory list; the first factory that
//! claims a channel creates its handler, and [`drive`] runs that handler
//! until the channel closes.

pub mod device_tracker;
pub mod host_tracker;

use std::sync::Arc;

use async_trait::async_trait;
use devmux_transport::{Channel, ChannelAcceptor, ChannelCode, ChannelSender, Payload, StandaloneLink};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tracing::{debug, trace};

use crate::error::DispatchError;

pub use device_tracker::DeviceTrackerFactory;
pub use host_tracker::HostTrackerFactory;

/// Stateful handler bound to exactly one channel.
///
/// `release` runs exactly once, after the channel's inbound stream ends.
#[async_trait]
pub trait Middleware: Send {
    async fn on_open(&mut self) {}

    async fn on_message(&mut self, payload: Payload);

    async fn release(&mut self) {}
}

pub trait MiddlewareFactory: Send + Sync {
    fn name(&self) -> &'static str;

    fn code(&self) -> ChannelCode;

    /// `action` query value served on non-multiplexed connections
    fn action(&self) -> Option<&'static str> {
        None
    }

    fn create(&self, outlet: ChannelSender) -> Box<dyn Middleware>;

    fn try_claim(&self, code: ChannelCode, outlet: &ChannelSender) -> Option<Box<dyn Middleware>> {
        (code == self.code()).then(|| self.create(outlet.clone()))
    }

    fn try_claim_request(&self, action: &str, outlet: &ChannelSender) -> Option<Box<dyn Middleware>> {
        (self.action() == Some(action)).then(|| self.create(outlet.clone()))
    }
}

/// Ordered middleware registry
pub struct Dispatcher {
    factories: Vec<Arc<dyn MiddlewareFactory>>,
}

impl Dispatcher {
    /// # Errors
    ///
    /// Returns `DispatchError::DuplicateCode` or `DispatchError::DuplicateAction`
    /// if two factories claim the same type code or action.
    pub fn new(factories: Vec<Arc<dyn MiddlewareFactory>>) -> Result<Self, DispatchError> {
        for (i, factory) in factories.iter().enumerate() {
            for earlier in &factories[..i] {
                if earlier.code() == factory.code() {
                    return Err(DispatchError::DuplicateCode {
                        code: factory.code(),
                        first: earlier.name(),
                        second: factory.name(),
                    });
                }
                if let Some(action) = factory.action()
                    && earlier.action() == Some(action)
                {
                    return Err(DispatchError::DuplicateAction {
                        action,
                        first: earlier.name(),
                        second: factory.name(),
                    });
                }
            }
        }

        debug!(
            "Dispatcher ready: {}",
            factories
                .iter()
                .map(|f| format!("{} ({})", f.name(), f.code()))
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(Self { factories })
    }

    /// Create the handler for a peer-opened channel.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::UnknownChannelType` if no factory claims the code.
    pub fn claim(&self, outlet: &ChannelSender) -> Result<Box<dyn Middleware>, DispatchError> {
        let code = outlet.code();
        self.factories
            .iter()
            .find_map(|factory| factory.try_claim(code, outlet))
            .ok_or(DispatchError::UnknownChannelType(code))
    }

    #[must_use]
    pub fn handles_action(&self, action: &str) -> bool {
        self.factories.iter().any(|f| f.action() == Some(action))
    }

    /// Create the handler for a whole non-multiplexed connection.
    ///
    /// The returned channel is bound to the connection through the link.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::UnmatchedRequest` if no factory serves `action`.
    pub fn claim_request(
        &self,
        action: &str,
    ) -> Result<(Box<dyn Middleware>, Channel, StandaloneLink), DispatchError> {
        let factory = self
            .factories
            .iter()
            .find(|f| f.action() == Some(action))
            .ok_or_else(|| DispatchError::UnmatchedRequest(action.to_string()))?;

        let (channel, link) = Channel::standalone(factory.code());
        let handler = factory
            .try_claim_request(action, &channel.sender())
            .ok_or_else(|| DispatchError::UnmatchedRequest(action.to_string()))?;
        Ok((handler, channel, link))
    }
}

impl ChannelAcceptor for Dispatcher {
    fn accept(&self, channel: Channel) -> Result<BoxFuture<'static, ()>, Channel> {
        match self.claim(&channel.sender()) {
            Ok(handler) => Ok(drive(handler, channel).boxed()),
            Err(e) => {
                debug!("{}", e);
                Err(channel)
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.factories.iter().map(|factory| factory.name()))
            .finish()
    }
}

/// Run `handler` over `channel` until the channel's inbound stream ends, then
/// release it and close the channel.
///
/// Closing the channel cancels whatever `on_open` or `on_message` is still
/// awaiting; `release` runs in every case.
pub async fn drive(mut handler: Box<dyn Middleware>, mut channel: Channel) {
    let (id, code) = (channel.id(), channel.code());
    let outlet = channel.sender();
    trace!("Handler bound to channel {} ({})", id, code);

    let opened = tokio::select! {
        () = handler.on_open() => true,
        () = outlet.closed() => false,
    };
    if opened {
        while let Some(payload) = channel.recv().await {
            tokio::select! {
                () = handler.on_message(payload) => {}
                () = outlet.closed() => break,
            }
        }
    } else {
        debug!("Channel {} ({}) closed while opening", id, code);
    }
    handler.release().await;
    channel.close();

    trace!("Handler for channel {} ({}) released", id, code);
}
