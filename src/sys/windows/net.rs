//! Winsock socket creation and address storage.

use std::fmt;
use std::mem;

use windows_sys::Win32::Networking::WinSock as ws;

use crate::error::SystemError;
use crate::sys::RawSocket;

/// An owned socket address of any family, sized for the largest one.
///
/// `SOCKADDR_STORAGE` holds every family this crate touches, including
/// `SOCKADDR_BTH` for RFCOMM endpoints.
pub(crate) struct SockAddr {
    storage: ws::SOCKADDR_STORAGE,
    len: i32,
}

impl SockAddr {
    pub(crate) fn zeroed() -> SockAddr {
        SockAddr {
            storage: unsafe { mem::zeroed() },
            len: mem::size_of::<ws::SOCKADDR_STORAGE>() as i32,
        }
    }

    /// Copies a raw address produced by the OS.
    ///
    /// # Safety
    ///
    /// `addr` must point to at least `len` valid bytes.
    pub(crate) unsafe fn from_raw(addr: *const ws::SOCKADDR, len: i32) -> SockAddr {
        let mut out = SockAddr::zeroed();
        let len = (len as usize).min(mem::size_of::<ws::SOCKADDR_STORAGE>());
        std::ptr::copy_nonoverlapping(addr as *const u8, &mut out.storage as *mut _ as *mut u8, len);
        out.len = len as i32;
        out
    }

    /// Wraps a concrete sockaddr struct by value.
    pub(crate) fn from_sockaddr<T>(addr: T) -> SockAddr {
        let mut out = SockAddr::zeroed();
        assert!(mem::size_of::<T>() <= mem::size_of::<ws::SOCKADDR_STORAGE>());
        unsafe {
            std::ptr::copy_nonoverlapping(
                &addr as *const T as *const u8,
                &mut out.storage as *mut _ as *mut u8,
                mem::size_of::<T>(),
            );
        }
        out.len = mem::size_of::<T>() as i32;
        out
    }

    pub(crate) fn as_ptr(&self) -> *const ws::SOCKADDR {
        &self.storage as *const _ as *const ws::SOCKADDR
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut ws::SOCKADDR {
        &mut self.storage as *mut _ as *mut ws::SOCKADDR
    }

    pub(crate) fn len(&self) -> i32 {
        self.len
    }

    pub(crate) fn set_len(&mut self, len: i32) {
        self.len = len;
    }

    pub(crate) fn family(&self) -> u16 {
        self.storage.ss_family
    }
}

impl Clone for SockAddr {
    fn clone(&self) -> SockAddr {
        SockAddr {
            storage: self.storage,
            len: self.len,
        }
    }
}

impl fmt::Debug for SockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SockAddr")
            .field("family", &self.family())
            .field("len", &self.len)
            .finish()
    }
}

unsafe impl Send for SockAddr {}
unsafe impl Sync for SockAddr {}

fn last_wsa_error() -> SystemError {
    SystemError::new(
        unsafe { ws::WSAGetLastError() } as u32,
        crate::error::ErrorKind::System,
    )
}

/// Creates an overlapped socket and associates it with the shared
/// completion port.
pub(crate) fn new_socket(family: i32, socktype: i32, protocol: i32) -> Result<RawSocket, SystemError> {
    let socket = unsafe {
        ws::WSASocketW(
            family,
            socktype,
            protocol,
            std::ptr::null(),
            0,
            ws::WSA_FLAG_OVERLAPPED,
        )
    };
    if socket == ws::INVALID_SOCKET {
        return Err(last_wsa_error());
    }

    if let Err(e) = super::event_loop::register(socket) {
        unsafe { ws::closesocket(socket) };
        return Err(e);
    }
    Ok(socket)
}

pub(crate) fn set_reuseaddr(socket: RawSocket) -> Result<(), SystemError> {
    setsockopt(socket, ws::SOL_SOCKET as i32, ws::SO_REUSEADDR as i32, 1i32)
}

/// Lets an IPv6 socket accept mapped v4 connections.
pub(crate) fn set_dual_stack(socket: RawSocket) -> Result<(), SystemError> {
    setsockopt(
        socket,
        ws::IPPROTO_IPV6,
        ws::IPV6_V6ONLY as i32,
        0i32,
    )
}

pub(crate) fn setsockopt<T>(
    socket: RawSocket,
    level: i32,
    name: i32,
    value: T,
) -> Result<(), SystemError> {
    let rc = unsafe {
        ws::setsockopt(
            socket,
            level,
            name,
            &value as *const T as *const u8,
            mem::size_of::<T>() as i32,
        )
    };
    if rc != 0 {
        return Err(last_wsa_error());
    }
    Ok(())
}

pub(crate) fn bind(socket: RawSocket, addr: &SockAddr) -> Result<(), SystemError> {
    // Bluetooth sockets reject a full SOCKADDR_STORAGE length.
    let rc = unsafe { ws::bind(socket, addr.as_ptr(), addr.len()) };
    if rc != 0 {
        return Err(last_wsa_error());
    }
    Ok(())
}

pub(crate) fn listen(socket: RawSocket, backlog: i32) -> Result<(), SystemError> {
    let rc = unsafe { ws::listen(socket, backlog) };
    if rc != 0 {
        return Err(last_wsa_error());
    }
    Ok(())
}

/// Synchronous connect, used for datagram sockets only (`ConnectEx` does
/// not support them and they complete immediately).
pub(crate) fn connect_sync(socket: RawSocket, addr: &SockAddr) -> Result<(), SystemError> {
    let rc = unsafe { ws::connect(socket, addr.as_ptr(), addr.len()) };
    if rc != 0 {
        return Err(last_wsa_error());
    }
    Ok(())
}

/// Makes a `ConnectEx`-connected socket behave like a regular one.
pub(crate) fn finalize_connect(socket: RawSocket) -> Result<(), SystemError> {
    let rc = unsafe {
        ws::setsockopt(
            socket,
            ws::SOL_SOCKET as i32,
            ws::SO_UPDATE_CONNECT_CONTEXT as i32,
            std::ptr::null(),
            0,
        )
    };
    if rc != 0 {
        return Err(last_wsa_error());
    }
    Ok(())
}

pub(crate) fn local_addr(socket: RawSocket) -> Result<SockAddr, SystemError> {
    let mut addr = SockAddr::zeroed();
    let mut len = addr.len();
    let rc = unsafe { ws::getsockname(socket, addr.as_mut_ptr(), &mut len) };
    if rc != 0 {
        return Err(last_wsa_error());
    }
    addr.set_len(len);
    Ok(addr)
}

/// Synchronous close for sockets not yet owned by a handle.
pub(crate) fn close_raw(socket: RawSocket) {
    unsafe { ws::closesocket(socket) };
}
