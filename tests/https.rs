//! TLS client scenarios against public endpoints.
//!
//! These need Internet access; run them explicitly with
//! `cargo test -- --ignored`.

mod common;

use netterm::{runtime, ConnectionType, Device, Error, Socket};

fn tls_device(host: &str) -> Device {
    Device::new(ConnectionType::Tcp, host, 443)
}

#[test]
#[ignore = "requires Internet access"]
fn tls_check_howsmyssl() {
    common::init();
    runtime::block_on(async {
        let mut sock = Socket::tls_client();
        sock.connect(&tls_device("www.howsmyssl.com")).await.unwrap();

        sock.send(b"GET /a/check HTTP/1.1\r\nHost: www.howsmyssl.com\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();

        // Read the response until the peer's close alert arrives.
        let mut response = Vec::new();
        loop {
            let result = sock.recv(1024).await.unwrap();
            if result.complete {
                response.extend_from_slice(&result.data);
            }

            let Some(alert) = result.alert else { continue };
            assert_eq!(alert.desc, "close_notify");

            // Socket closure should immediately follow the close alert.
            let closed = sock.recv(1024).await.unwrap().closed;
            assert!(closed);
            break;
        }

        let response = String::from_utf8_lossy(&response);
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("\"tls_version\":\"TLS 1.3\""));
        assert!(response.contains("\"rating\":\"Probably Okay\""));
    });
}

#[test]
#[ignore = "requires Internet access"]
fn tls_rejects_self_signed_certificate() {
    common::init();
    runtime::block_on(async {
        let mut sock = Socket::tls_client();
        let err = sock
            .connect(&tls_device("self-signed.badssl.com"))
            .await
            .expect_err("self-signed certificate must not validate");

        match err {
            Error::Tls(e) => assert_eq!(
                e.0,
                "Certificate validation failure: Cannot establish trust"
            ),
            other => panic!("expected a TLS error, got {other:?}"),
        }
    });
}

#[test]
#[ignore = "requires Internet access"]
fn tls_rejects_expired_certificate() {
    common::init();
    runtime::block_on(async {
        let mut sock = Socket::tls_client();
        let err = sock
            .connect(&tls_device("expired.badssl.com"))
            .await
            .expect_err("expired certificate must not validate");

        match err {
            Error::Tls(e) => assert_eq!(
                e.0,
                "Certificate validation failure: Certificate has expired"
            ),
            other => panic!("expected a TLS error, got {other:?}"),
        }
    });
}

#[test]
#[ignore = "requires Internet access"]
fn tls_surfaces_handshake_failure_alert() {
    common::init();
    runtime::block_on(async {
        let mut sock = Socket::tls_client();
        sock.connect(&tls_device("rc4.badssl.com")).await.unwrap();

        // No data is actually received; the first recv carries the alert.
        let alert = sock
            .recv(1024)
            .await
            .unwrap()
            .alert
            .expect("handshake rejection should surface as an alert");
        assert!(alert.is_fatal);
        assert_eq!(alert.desc, "handshake_failure");
    });
}
