//! Cross-thread cancellation of in-flight operations.

mod common;

use std::time::{Duration, Instant};

use netterm::{runtime, ConnectionType, Device, Socket};

#[test]
fn cancel_from_another_thread_interrupts_recv() {
    common::init();

    let started = Instant::now();
    runtime::block_on(async {
        // A server that accepts and then stays silent, so the client's
        // recv stays in flight until it is canceled.
        let mut server = Socket::ip_server();
        let bound = server
            .start_server(&Device::new(ConnectionType::Tcp, "127.0.0.1", 0))
            .unwrap();
        let _holder = runtime::spawn(async move {
            let accepted = server.accept().await.unwrap();
            let mut sock = accepted.socket;
            let _ = sock.recv(4).await;
        });

        let mut client = Socket::ip_client();
        client
            .connect(&Device::new(ConnectionType::Tcp, "127.0.0.1", bound.port))
            .await
            .unwrap();

        // Briefly wait on a separate thread, then cancel I/O while recv()
        // is pending.
        let cancel = client.cancel_handle();
        let canceler = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            cancel.cancel();
        });

        let err = client
            .recv(4)
            .await
            .expect_err("recv should be interrupted by cancellation");
        assert!(err.is_canceled());

        let sys = err.as_system().expect("cancellation is a system error");
        assert!(sys.is_fatal());

        canceler.join().unwrap();
    });

    // The canceled operation must complete within a bounded time, not
    // hang until some unrelated traffic arrives.
    assert!(started.elapsed() < Duration::from_secs(5));
}
