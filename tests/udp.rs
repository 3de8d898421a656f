use std::{
    net::{IpAddr, SocketAddr, UdpSocket},
    time::Duration,
};

use dualsock::{
    DatagramPacket, DatagramSocket, NetworkInterface, OptionValue, SocketConfig, SocketContext,
    SocketError, SocketOption, SocketState, Strategy,
};

fn contexts() -> Vec<SocketContext> {
    vec![
        SocketContext::new(SocketConfig::default()),
        SocketContext::new(SocketConfig::default().with_force_two_descriptor(true)),
    ]
}

fn bound(ctx: &SocketContext, addr: &str) -> (DatagramSocket, SocketAddr) {
    let socket = ctx.datagram().unwrap();

    socket.bind(addr.parse().unwrap()).unwrap();

    let local = socket.local_addr().unwrap();

    (socket, local)
}

fn loopback_port(addr: SocketAddr) -> SocketAddr {
    SocketAddr::new("127.0.0.1".parse().unwrap(), addr.port())
}

#[test]
fn test_peek_then_receive() {
    _ = pretty_env_logger::try_init();

    for ctx in contexts() {
        // Wildcard bind spans both descriptors on the two-descriptor strategy.
        let (server, server_addr) = bound(&ctx, "0.0.0.0:0");

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();

        client
            .send_to(b"hello world", loopback_port(server_addr))
            .unwrap();

        let mut peeked = DatagramPacket::with_capacity(64);

        let port = server.peek(&mut peeked).unwrap();

        assert_eq!(port, client.local_addr().unwrap().port());

        let mut received = DatagramPacket::with_capacity(64);

        server.receive(&mut received).unwrap();

        assert_eq!(peeked.data(), b"hello world");
        assert_eq!(received.data(), peeked.data());
        assert_eq!(received.addr(), peeked.addr());
        assert_eq!(received.addr(), Some(client.local_addr().unwrap()));

        server
            .set_option(SocketOption::Timeout, OptionValue::Int(50))
            .unwrap();

        assert!(matches!(
            server.receive(&mut received),
            Err(SocketError::Timeout("receive"))
        ));
    }
}

#[test]
fn test_send_and_truncate() {
    _ = pretty_env_logger::try_init();

    for ctx in contexts() {
        let (server, server_addr) = bound(&ctx, "127.0.0.1:0");

        let client = ctx.datagram().unwrap();

        let sent = client
            .send(&DatagramPacket::new(&b"0123456789"[..], server_addr))
            .unwrap();

        assert_eq!(sent, 10);
        assert_eq!(client.state(), SocketState::Bound);

        let mut packet = DatagramPacket::with_capacity(4);

        server.receive(&mut packet).unwrap();

        assert_eq!(packet.data(), b"0123");
        assert_eq!(packet.addr().unwrap().port(), client.local_addr().unwrap().port());
    }
}

#[test]
fn test_association_filters_other_peers() {
    _ = pretty_env_logger::try_init();

    for ctx in contexts() {
        let (server, server_addr) = bound(&ctx, "127.0.0.1:0");

        let friend = UdpSocket::bind("127.0.0.1:0").unwrap();
        let stranger = UdpSocket::bind("127.0.0.1:0").unwrap();

        // Queued before the association, must still be filtered.
        stranger.send_to(b"stranger", server_addr).unwrap();

        server.connect(friend.local_addr().unwrap()).unwrap();

        assert_eq!(server.state(), SocketState::Connected);
        assert_eq!(server.peer_addr().unwrap(), Some(friend.local_addr().unwrap()));

        friend.send_to(b"friend", server_addr).unwrap();

        let mut packet = DatagramPacket::with_capacity(64);

        server.receive(&mut packet).unwrap();

        assert_eq!(packet.data(), b"friend");

        // Unaddressed sends go to the peer.
        server
            .send(&DatagramPacket::unaddressed(&b"reply"[..]))
            .unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = friend.recv_from(&mut buf).unwrap();

        assert_eq!(&buf[..n], b"reply");
        assert_eq!(from.port(), server_addr.port());

        assert!(matches!(
            server.send(&DatagramPacket::new(
                &b"x"[..],
                stranger.local_addr().unwrap()
            )),
            Err(SocketError::InvalidState(_))
        ));

        server.disconnect().unwrap();

        assert_eq!(server.state(), SocketState::Bound);
        assert_eq!(server.peer_addr().unwrap(), None);

        stranger.send_to(b"again", server_addr).unwrap();

        server.receive(&mut packet).unwrap();

        assert_eq!(packet.data(), b"again");
    }
}

#[test]
fn test_unreachable_on_associated_socket() {
    _ = pretty_env_logger::try_init();

    for ctx in contexts() {
        let gone = UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap();

        let socket = ctx.datagram().unwrap();

        socket.connect(gone).unwrap();

        socket
            .set_option(SocketOption::Timeout, OptionValue::Int(2000))
            .unwrap();

        socket
            .send(&DatagramPacket::unaddressed(&b"anyone?"[..]))
            .unwrap();

        let mut packet = DatagramPacket::with_capacity(16);

        assert!(matches!(
            socket.receive(&mut packet),
            Err(SocketError::Unreachable)
        ));

        // Advisory only; the socket stays open.
        assert_eq!(socket.state(), SocketState::Connected);
    }
}

#[test]
fn test_ttl_validated() {
    _ = pretty_env_logger::try_init();

    let socket = SocketContext::default().multicast().unwrap();

    for ttl in [-1, 256] {
        assert!(matches!(
            socket.set_ttl(ttl),
            Err(SocketError::InvalidOptionValue {
                option: SocketOption::MulticastTtl,
                ..
            })
        ));
    }

    socket.set_ttl(3).unwrap();

    assert_eq!(socket.ttl().unwrap(), 3);

    socket.set_ttl(0).unwrap();

    assert_eq!(socket.ttl().unwrap(), 0);
}

#[test]
fn test_multicast_on_dual_stack_not_supported() {
    _ = pretty_env_logger::try_init();

    let ctx = SocketContext::default();

    let socket = ctx.datagram().unwrap();

    if socket.strategy() == Strategy::DualStack {
        assert!(matches!(
            socket.set_ttl(1),
            Err(SocketError::NotSupportedByImplementation(_))
        ));
    }

    assert_eq!(ctx.multicast().unwrap().strategy(), Strategy::TwoDescriptor);
}

fn loopback_interface() -> NetworkInterface {
    NetworkInterface::all()
        .unwrap()
        .into_iter()
        .find(|iface| iface.is_loopback() && iface.first_v4().is_some())
        .expect("loopback interface with an IPv4 address")
}

#[test]
fn test_join_leave() {
    _ = pretty_env_logger::try_init();

    let lo = loopback_interface();

    let socket = SocketContext::default().multicast().unwrap();

    socket.bind("0.0.0.0:0".parse().unwrap()).unwrap();

    let group: IpAddr = "239.255.77.1".parse().unwrap();

    socket.join_group(group, Some(&lo)).unwrap();

    socket.leave_group(group, Some(&lo)).unwrap();

    assert!(matches!(
        socket.leave_group(group, Some(&lo)),
        Err(SocketError::InvalidState(_))
    ));

    // The outbound interface option stands in for an explicit interface.
    socket
        .set_option(SocketOption::MulticastInterface, OptionValue::Interface(lo.clone()))
        .unwrap();

    socket.join_group(group, None).unwrap();

    socket.leave_group(group, Some(&lo)).unwrap();
}

#[test]
fn test_no_delivery_after_leave() {
    _ = pretty_env_logger::try_init();

    let lo = loopback_interface();

    // Joins without an interface resolve to the configured default.
    let ctx = SocketContext::new(
        SocketConfig::default().with_multicast_interface(Some(lo.name().to_owned())),
    );

    let receiver = ctx.multicast().unwrap();

    receiver.bind("0.0.0.0:0".parse().unwrap()).unwrap();

    let port = receiver.local_addr().unwrap().port();

    let group: IpAddr = "239.255.77.2".parse().unwrap();

    receiver.join_group(group, None).unwrap();

    let sender = ctx.multicast().unwrap();

    sender
        .set_option(SocketOption::MulticastInterface, OptionValue::Interface(lo))
        .unwrap();

    sender
        .set_option(SocketOption::MulticastLoop, OptionValue::Bool(true))
        .unwrap();

    let target = SocketAddr::new(group, port);

    sender
        .send(&DatagramPacket::new(&b"joined"[..], target))
        .unwrap();

    receiver
        .set_option(SocketOption::Timeout, OptionValue::Int(1000))
        .unwrap();

    let mut packet = DatagramPacket::with_capacity(16);

    receiver.receive(&mut packet).unwrap();

    assert_eq!(packet.data(), b"joined");

    // Loopback may hand over a second copy; clear it before leaving.
    receiver
        .set_option(SocketOption::Timeout, OptionValue::Int(200))
        .unwrap();

    loop {
        match receiver.receive(&mut packet) {
            Ok(()) => assert_eq!(packet.data(), b"joined"),
            Err(err) => {
                assert!(err.is_timeout());
                break;
            }
        }
    }

    receiver.leave_group(group, None).unwrap();

    sender
        .send(&DatagramPacket::new(&b"left"[..], target))
        .unwrap();

    assert!(receiver.receive(&mut packet).unwrap_err().is_timeout());
}

#[test]
fn test_disconnect_keeps_local_port() {
    _ = pretty_env_logger::try_init();

    for ctx in contexts() {
        let (socket, local) = bound(&ctx, "127.0.0.1:0");

        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();

        socket.connect(peer.local_addr().unwrap()).unwrap();

        socket.disconnect().unwrap();

        assert_eq!(socket.local_addr().unwrap(), local);

        peer.send_to(b"still here", local).unwrap();

        socket
            .set_option(SocketOption::Timeout, OptionValue::Int(2000))
            .unwrap();

        let mut packet = DatagramPacket::with_capacity(16);

        socket.receive(&mut packet).unwrap();

        assert_eq!(packet.data(), b"still here");
    }
}

#[test]
fn test_failed_wildcard_bind_can_be_retried() {
    _ = pretty_env_logger::try_init();

    let Ok(blocker) = UdpSocket::bind("[::1]:0") else {
        return;
    };

    let port = blocker.local_addr().unwrap().port();

    let ctx = SocketContext::new(SocketConfig::default().with_force_two_descriptor(true));

    let socket = ctx.datagram().unwrap();

    let wildcard = SocketAddr::new("0.0.0.0".parse().unwrap(), port);

    for _ in 0..2 {
        assert!(matches!(socket.bind(wildcard), Err(SocketError::AddressInUse)));
        assert_eq!(socket.state(), SocketState::Unbound);
    }

    drop(blocker);

    socket.bind(wildcard).unwrap();

    assert_eq!(socket.local_addr().unwrap().port(), port);
}

#[test]
fn test_datagram_ledger_ceiling() {
    _ = pretty_env_logger::try_init();

    for ctx in [
        SocketContext::new(SocketConfig::default().with_max_datagram_sockets(Some(2))),
        SocketContext::new(
            SocketConfig::default()
                .with_max_datagram_sockets(Some(2))
                .with_force_two_descriptor(true),
        ),
    ] {
        let first = ctx.datagram().unwrap();
        let _second = ctx.multicast().unwrap();

        assert!(matches!(
            ctx.datagram(),
            Err(SocketError::TooManySockets { limit: 2, .. })
        ));

        first.close();

        assert_eq!(ctx.ledger().live(dualsock::ledger::LedgerKind::Datagram), 1);

        let _third = ctx.datagram().unwrap();

        assert!(ctx.datagram().is_err());
    }
}

#[test]
fn test_closed_socket_fails_fast() {
    _ = pretty_env_logger::try_init();

    let socket = SocketContext::default().datagram().unwrap();

    socket.close();
    socket.close();

    assert_eq!(socket.state(), SocketState::Closed);

    let mut packet = DatagramPacket::with_capacity(8);

    assert!(matches!(socket.receive(&mut packet), Err(SocketError::Closed)));
    assert!(matches!(socket.local_addr(), Err(SocketError::Closed)));
    assert!(matches!(
        socket.bind("127.0.0.1:0".parse().unwrap()),
        Err(SocketError::Closed)
    ));
}
