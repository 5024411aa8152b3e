//! UDP child adoption tests.

mod common;

use common::{make_ctx, stream_pair, Recording};
use conn_core::{AdoptError, CloseReason, SlotState, UdpChildOptions, Vhost};

#[test]
fn udp_child_without_bind_stays_unbound() {
    let handler = Recording::new();
    let vhost = Vhost::builder("default")
        .protocol("dgram", handler.clone())
        .build();
    let ctx = make_ctx(1, 64, 0);

    let id = ctx
        .create_udp_child(&vhost, 0, UdpChildOptions { bind: false }, None, None)
        .unwrap();

    let slot = ctx.slot(id).unwrap();
    assert!(slot.is_raw());
    assert_eq!(slot.state(), SlotState::Established);
    // no bind() happened, so the socket has no local port
    assert_eq!(slot.local_addr().unwrap().port(), 0);
    drop(slot);

    assert_eq!(handler.events(), vec!["created", "raw-adopted"]);
}

#[test]
fn udp_child_with_bind_gets_local_port() {
    let handler = Recording::new();
    let vhost = Vhost::builder("default").protocol("dgram", handler).build();
    let ctx = make_ctx(1, 64, 0);

    let id = ctx
        .create_udp_child(&vhost, 0, UdpChildOptions { bind: true }, None, None)
        .unwrap();

    let addr = ctx.slot(id).unwrap().local_addr().unwrap();
    assert_ne!(addr.port(), 0);
}

#[test]
fn udp_child_joins_parent_thread() {
    let handler = Recording::new();
    let vhost = Vhost::builder("default")
        .protocol("stream", handler.clone())
        .protocol("dgram", handler.clone())
        .build();
    // two threads so load balancing alone would split parent and child
    let ctx = make_ctx(2, 64, 0);

    let (_client, server) = stream_pair();
    let parent = ctx.adopt_stream(&vhost, server).unwrap();
    let parent_tsi = ctx.slot(parent).unwrap().thread();

    let child = ctx
        .create_udp_child(
            &vhost,
            0,
            UdpChildOptions { bind: true },
            Some("dgram"),
            Some(parent),
        )
        .unwrap();

    {
        let slot = ctx.slot(child).unwrap();
        assert_eq!(slot.thread(), parent_tsi);
        assert_eq!(slot.parent(), Some(parent));
        assert_eq!(slot.protocol_index(), 1);
    }
    assert_eq!(ctx.slot(parent).unwrap().children(), &[child]);
}

#[test]
fn closing_child_detaches_from_parent() {
    let handler = Recording::new();
    let vhost = Vhost::builder("default").protocol("any", handler).build();
    let ctx = make_ctx(1, 64, 0);

    let (_client, server) = stream_pair();
    let parent = ctx.adopt_stream(&vhost, server).unwrap();
    let child = ctx
        .create_udp_child(&vhost, 0, UdpChildOptions { bind: false }, None, Some(parent))
        .unwrap();

    ctx.close_and_free(child, CloseReason::Shutdown);
    assert!(ctx.slot(parent).unwrap().children().is_empty());
    assert_eq!(ctx.live_slots(), 1);
}

#[test]
fn closing_parent_orphans_children() {
    let handler = Recording::new();
    let vhost = Vhost::builder("default").protocol("any", handler).build();
    let ctx = make_ctx(1, 64, 0);

    let (_client, server) = stream_pair();
    let parent = ctx.adopt_stream(&vhost, server).unwrap();
    let child = ctx
        .create_udp_child(&vhost, 0, UdpChildOptions { bind: false }, None, Some(parent))
        .unwrap();

    ctx.close_and_free(parent, CloseReason::Shutdown);
    let slot = ctx.slot(child).unwrap();
    assert_eq!(slot.parent(), None);
    drop(slot);
    assert_eq!(ctx.live_slots(), 1);
}

#[test]
fn udp_child_with_unknown_protocol_fails() {
    let handler = Recording::new();
    let vhost = Vhost::builder("default").protocol("any", handler).build();
    let ctx = make_ctx(1, 64, 0);

    let err = ctx
        .create_udp_child(
            &vhost,
            0,
            UdpChildOptions { bind: false },
            Some("missing"),
            None,
        )
        .unwrap_err();

    assert!(matches!(err, AdoptError::UnknownProtocol(_)));
    assert_eq!(ctx.live_slots(), 0);
}
