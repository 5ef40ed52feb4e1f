//! Client connection tests against an in-process WebSocket server.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use devmux_transport::{
    Channel, ChannelAcceptor, ChannelCode, Frame, MuxConnection, Multiplexer, NORMAL_CLOSURE,
    Payload, Role,
};
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

/// Echoes every payload on `SHEL` channels and rejects everything else.
struct Echo;

impl ChannelAcceptor for Echo {
    fn accept(&self, mut channel: Channel) -> Result<BoxFuture<'static, ()>, Channel> {
        if channel.code() != ChannelCode::SHEL {
            return Err(channel);
        }
        Ok(Box::pin(async move {
            while let Some(payload) = channel.recv().await {
                let _ = channel.send(payload);
            }
        }))
    }
}

async fn serve_one(listener: TcpListener) {
    let (stream, _) = listener.accept().await.unwrap();
    let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
    let (mut write, mut read) = ws.split();

    let (mut mux, mut outbound) = Multiplexer::new(Role::Server, Some(Arc::new(Echo)));
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if write
                .send(Message::Binary(frame.to_bytes().to_vec()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    while let Some(Ok(message)) = read.next().await {
        if let Message::Binary(data) = message {
            match Frame::decode(Bytes::from(data)) {
                Ok(frame) => mux.handle_frame(frame),
                Err(e) => mux.handle_malformed(&e),
            }
        }
    }

    mux.shutdown().await;
    writer.abort();
}

async fn start_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve_one(listener));
    format!("ws://{addr}/")
}

#[tokio::test]
async fn echo_over_multiplexed_channel() {
    let url = start_server().await;
    let mut conn = MuxConnection::connect(&url).await.unwrap();

    let mut first = conn.open_channel(ChannelCode::SHEL);
    let mut second = conn.open_channel(ChannelCode::SHEL);
    first.send_text("one").unwrap();
    second.send_text("two").unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(5), second.recv())
        .await
        .unwrap();
    assert_eq!(reply, Some(Payload::from("two")));
    let reply = tokio::time::timeout(Duration::from_secs(5), first.recv())
        .await
        .unwrap();
    assert_eq!(reply, Some(Payload::from("one")));

    conn.close();
    let close = tokio::time::timeout(Duration::from_secs(5), conn.closed())
        .await
        .unwrap();
    assert_eq!(close.code, NORMAL_CLOSURE);
    assert!(first.is_closed());
}

#[tokio::test]
async fn unsupported_channel_is_closed_by_server() {
    let url = start_server().await;
    let conn = MuxConnection::connect(&url).await.unwrap();

    let mut channel = conn.open_channel(ChannelCode::FSLS);
    let end = tokio::time::timeout(Duration::from_secs(5), channel.recv())
        .await
        .unwrap();
    assert_eq!(end, None);
    assert!(channel.is_closed());
}
