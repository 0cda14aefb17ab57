//! I/O over the Internet protocols: echo round-trips, orderly close, and
//! server port recovery, against self-hosted loopback servers.

mod common;

use netterm::{runtime, ConnectionType, Device, IpVersion, Socket};

/// Starts a TCP echo server on `addr`, connects a client to it, and checks
/// that sent bytes come back unchanged.
fn tcp_echo_roundtrip(addr: &'static str, expected_family: IpVersion) {
    common::init();
    runtime::block_on(async move {
        let mut server = Socket::ip_server();
        let bound = server
            .start_server(&Device::new(ConnectionType::Tcp, addr, 0))
            .expect("failed to start TCP server");
        assert_ne!(bound.port, 0);
        assert_eq!(bound.ip_version, expected_family);

        let echo = runtime::spawn(async move {
            let accepted = server.accept().await.expect("accept failed");
            let mut sock = accepted.socket;
            loop {
                let received = sock.recv(1024).await.expect("server recv failed");
                if received.closed {
                    break;
                }
                sock.send(&received.data).await.expect("server send failed");
            }
            accepted.device
        });

        let mut client = Socket::ip_client();
        client
            .connect(&Device::new(ConnectionType::Tcp, addr, bound.port))
            .await
            .expect("connect failed");

        let message = b"roundtrip payload over a stream socket";
        client.send(message).await.expect("client send failed");

        let mut got = Vec::new();
        while got.len() < message.len() {
            let received = client.recv(1024).await.expect("client recv failed");
            assert!(!received.closed, "peer closed before echoing everything");
            assert!(received.alert.is_none());
            got.extend(received.data);
        }
        assert_eq!(got, message);

        client.close();
        let peer = echo.await;
        assert_eq!(peer.conn_type, ConnectionType::Tcp);
        assert!(!peer.address.is_empty());
    });
}

/// Starts a UDP echo server on `addr` and round-trips one datagram.
fn udp_echo_roundtrip(addr: &'static str) {
    common::init();
    runtime::block_on(async move {
        let mut server = Socket::ip_server();
        let bound = server
            .start_server(&Device::new(ConnectionType::Udp, addr, 0))
            .expect("failed to start UDP server");
        assert_ne!(bound.port, 0);

        let echo = runtime::spawn(async move {
            let datagram = server.recv_from(1024).await.expect("recv_from failed");
            server
                .send_to(&datagram.from, &datagram.data)
                .await
                .expect("send_to failed");
            datagram.from
        });

        let mut client = Socket::ip_client();
        client
            .connect(&Device::new(ConnectionType::Udp, addr, bound.port))
            .await
            .expect("connect failed");

        let message = b"one datagram";
        client.send(message).await.expect("client send failed");

        let received = client.recv(1024).await.expect("client recv failed");
        assert_eq!(received.data, message);

        let peer = echo.await;
        assert_eq!(peer.conn_type, ConnectionType::Udp);
    });
}

#[test]
fn tcp_echo_v4() {
    tcp_echo_roundtrip("127.0.0.1", IpVersion::V4);
}

#[test]
fn tcp_echo_v6() {
    tcp_echo_roundtrip("::1", IpVersion::V6);
}

#[test]
fn udp_echo_v4() {
    udp_echo_roundtrip("127.0.0.1");
}

#[test]
fn udp_echo_v6() {
    udp_echo_roundtrip("::1");
}

#[test]
fn orderly_close_is_sticky() {
    common::init();
    runtime::block_on(async {
        let mut server = Socket::ip_server();
        let bound = server
            .start_server(&Device::new(ConnectionType::Tcp, "127.0.0.1", 0))
            .unwrap();

        let closer = runtime::spawn(async move {
            let accepted = server.accept().await.unwrap();
            let mut sock = accepted.socket;
            sock.close();
        });

        let mut client = Socket::ip_client();
        client
            .connect(&Device::new(ConnectionType::Tcp, "127.0.0.1", bound.port))
            .await
            .unwrap();
        closer.await;

        // The peer closed gracefully: one result with closed=true and no
        // data, and every subsequent recv reports the same.
        let first = client.recv(1024).await.unwrap();
        assert!(first.closed);
        assert!(first.data.is_empty());

        let second = client.recv(1024).await.unwrap();
        assert!(second.closed);
        assert!(second.data.is_empty());
    });
}

#[test]
fn server_port_is_recovered_and_reachable() {
    common::init();
    runtime::block_on(async {
        let mut server = Socket::ip_server();
        let bound = server
            .start_server(&Device::new(ConnectionType::Tcp, "127.0.0.1", 0))
            .unwrap();
        assert_ne!(bound.port, 0);

        let acceptor = runtime::spawn(async move {
            server.accept().await.is_ok()
        });

        let mut client = Socket::ip_client();
        client
            .connect(&Device::new(ConnectionType::Tcp, "127.0.0.1", bound.port))
            .await
            .expect("connect to recovered port failed");
        assert!(client.is_valid());

        assert!(acceptor.await);
    });
}
