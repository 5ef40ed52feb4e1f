//! Property tests for channel id allocation.

use std::collections::HashSet;
use std::sync::Arc;

use devmux_transport::{Channel, ChannelAcceptor, ChannelCode, Frame, Multiplexer, Role};
use futures_util::future::BoxFuture;
use proptest::prelude::*;

/// Keeps every peer-opened channel alive until it is closed.
struct Holder;

impl ChannelAcceptor for Holder {
    fn accept(&self, mut channel: Channel) -> Result<BoxFuture<'static, ()>, Channel> {
        Ok(Box::pin(async move { while channel.recv().await.is_some() {} }))
    }
}

#[derive(Debug, Clone)]
enum Op {
    OpenLocal,
    OpenRemote,
    ReplayRemote(usize),
    CloseLocal(usize),
    CloseRemote(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::OpenLocal),
        Just(Op::OpenRemote),
        any::<usize>().prop_map(Op::ReplayRemote),
        any::<usize>().prop_map(Op::CloseLocal),
        any::<usize>().prop_map(Op::CloseRemote),
    ]
}

fn run_ops(ops: Vec<Op>) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    rt.block_on(async move {
        let (mut mux, _outbound) = Multiplexer::new(Role::Server, Some(Arc::new(Holder)));
        let mut seen = HashSet::new();
        let mut local: Vec<Channel> = Vec::new();
        let mut remote: Vec<u32> = Vec::new();
        let mut used_remote: Vec<u32> = Vec::new();
        let mut next_remote = 1u32;

        for op in ops {
            match op {
                Op::OpenLocal => {
                    let channel = mux.open_channel(ChannelCode::SHEL);
                    assert_eq!(channel.id() % 2, 0, "server ids are even");
                    assert!(seen.insert(channel.id()), "id {} reused", channel.id());
                    local.push(channel);
                }
                Op::OpenRemote => {
                    mux.handle_frame(Frame::Open {
                        id: next_remote,
                        code: ChannelCode::GTRC,
                    });
                    assert!(seen.insert(next_remote));
                    remote.push(next_remote);
                    used_remote.push(next_remote);
                    next_remote += 2;
                }
                Op::ReplayRemote(i) => {
                    if !used_remote.is_empty() {
                        let id = used_remote[i % used_remote.len()];
                        mux.handle_frame(Frame::Open {
                            id,
                            code: ChannelCode::GTRC,
                        });
                    }
                }
                Op::CloseLocal(i) => {
                    if !local.is_empty() {
                        let channel = local.remove(i % local.len());
                        channel.close();
                    }
                }
                Op::CloseRemote(i) => {
                    if !remote.is_empty() {
                        let id = remote.remove(i % remote.len());
                        mux.handle_frame(Frame::close(id, 1000, ""));
                    }
                }
            }

            assert_eq!(mux.open_count(), local.len() + remote.len());
        }

        let open = mux.shutdown().await;
        assert_eq!(open, local.len() + remote.len());
        assert!(local.iter().all(Channel::is_closed));
    });
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn channel_ids_are_unique_and_never_reused(ops in prop::collection::vec(op(), 1..64)) {
        run_ops(ops);
    }
}

#[test]
fn client_ids_are_odd_and_increasing() {
    let (mux, _outbound) = Multiplexer::new(Role::Client, None);
    let ids: Vec<u32> = (0..5)
        .map(|_| mux.open_channel(ChannelCode::HSTS).id())
        .collect();
    assert_eq!(ids, vec![1, 3, 5, 7, 9]);
}
