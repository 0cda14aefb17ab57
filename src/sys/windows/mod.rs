//! Windows backend: Winsock 2 sockets over a shared I/O completion port.

use std::sync::Once;

use windows_sys::Win32::Networking::WinSock as ws;

pub(crate) mod bluetooth;
mod event_loop;
pub(crate) mod net;

pub(crate) use self::bluetooth as bt;
pub(crate) use self::event_loop::EventLoop;
pub(crate) use self::net::{new_socket, SockAddr};

/// Raw socket type (`SOCKET`).
pub(crate) type RawSocket = ws::SOCKET;

/// Sentinel for an absent socket.
pub(crate) const INVALID_SOCKET: RawSocket = ws::INVALID_SOCKET;

pub(crate) const AF_INET: i32 = ws::AF_INET as i32;
pub(crate) const AF_INET6: i32 = ws::AF_INET6 as i32;
pub(crate) const SOMAXCONN: i32 = ws::SOMAXCONN as i32;

/// Starts Winsock 2.2. Paired cleanup happens at process exit; the core
/// never tears Winsock down while sockets may still be open.
pub(crate) fn startup() {
    static START: Once = Once::new();
    START.call_once(|| unsafe {
        let mut data: ws::WSADATA = std::mem::zeroed();
        let rc = ws::WSAStartup(0x0202, &mut data);
        assert!(rc == 0, "WSAStartup failed: {rc}");
    });
}
