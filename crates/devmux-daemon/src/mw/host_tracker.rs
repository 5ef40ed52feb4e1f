//! Host discovery channel (`HSTS`).

use async_trait::async_trait;
use devmux_transport::{ChannelCode, ChannelError, ChannelSender, Payload};
use devmux_types::{HostsData, LocalHost, Message};
use tracing::{debug, warn};

use super::{Middleware, MiddlewareFactory};

const NAME: &str = "HostTracker";

/// Advertises the tracker types this daemon serves
#[derive(Debug, Clone)]
pub struct HostTrackerFactory {
    local: Vec<String>,
}

impl HostTrackerFactory {
    pub fn new<I, S>(local: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            local: local.into_iter().map(Into::into).collect(),
        }
    }
}

impl MiddlewareFactory for HostTrackerFactory {
    fn name(&self) -> &'static str {
        NAME
    }

    fn code(&self) -> ChannelCode {
        ChannelCode::HSTS
    }

    fn action(&self) -> Option<&'static str> {
        Some("list-hosts")
    }

    fn create(&self, outlet: ChannelSender) -> Box<dyn Middleware> {
        Box::new(HostTracker {
            outlet,
            local: self.local.clone(),
        })
    }
}

struct HostTracker {
    outlet: ChannelSender,
    local: Vec<String>,
}

#[async_trait]
impl Middleware for HostTracker {
    async fn on_open(&mut self) {
        let data = HostsData {
            local: self
                .local
                .iter()
                .map(|kind| LocalHost { kind: kind.clone() })
                .collect(),
            remote: Vec::new(),
        };

        let sent = Message::hosts(&data)
            .map_err(ChannelError::from)
            .and_then(|message| self.outlet.send_json(&message));
        match sent {
            Ok(()) => debug!("[{}] Sent {} local host(s)", NAME, data.local.len()),
            Err(e) => warn!("[{}] Failed to send hosts: {}", NAME, e),
        }
    }

    async fn on_message(&mut self, payload: Payload) {
        let text = match payload.as_text() {
            Some(text) => text.to_string(),
            None => format!("<{} bytes>", payload.len()),
        };
        debug!("[{}] Unsupported message: {}", NAME, text);
        let _ = self
            .outlet
            .send_json(&Message::error(format!("Unsupported message: {text}")));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mw::drive;
    use devmux_transport::{Channel, Frame};
    use devmux_types::{TrackerUpdate, message_type};

    fn decode(frame: Frame) -> Message {
        let Frame::Data {
            payload: Payload::Text(text),
            ..
        } = frame
        else {
            panic!("expected text frame, got {frame:?}");
        };
        serde_json::from_str(&text).unwrap()
    }

    #[tokio::test]
    async fn test_sends_hosts_on_open() {
        let factory = HostTrackerFactory::new(["android"]);
        let (channel, mut link) = Channel::standalone(ChannelCode::HSTS);
        let handler = factory.create(channel.sender());
        let task = tokio::spawn(drive(handler, channel));

        let message = decode(link.outbound.recv().await.unwrap());
        assert_eq!(message.kind, message_type::HOSTS);
        let TrackerUpdate::Hosts(hosts) = TrackerUpdate::from_message(message).unwrap() else {
            panic!("expected hosts");
        };
        assert_eq!(hosts.local, vec![LocalHost { kind: "android".to_string() }]);
        assert!(hosts.remote.is_empty());

        drop(link.inbound);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_inbound_messages_are_unsupported() {
        let factory = HostTrackerFactory::new(["android"]);
        let (channel, mut link) = Channel::standalone(ChannelCode::HSTS);
        let handler = factory.create(channel.sender());
        tokio::spawn(drive(handler, channel));

        let _hosts = link.outbound.recv().await.unwrap();
        link.inbound.send(Payload::Text("hello".to_string())).unwrap();

        let message = decode(link.outbound.recv().await.unwrap());
        assert_eq!(message.kind, message_type::ERROR);
        assert_eq!(message.data, serde_json::json!("Unsupported message: hello"));
    }
}
