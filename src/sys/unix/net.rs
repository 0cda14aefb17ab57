//! Socket creation and address storage for Unix backends.

use std::fmt;
use std::mem;

use crate::error::SystemError;
use crate::sys::RawSocket;

use super::syscall;

/// An owned socket address of any family, sized for the largest one.
///
/// `sockaddr_storage` is valid for every address family this crate touches
/// (IPv4/IPv6 everywhere, RFCOMM/L2CAP on Linux), so one wrapper serves
/// resolution results, peer addresses, and Bluetooth endpoints alike.
pub(crate) struct SockAddr {
    storage: libc::sockaddr_storage,
    len: libc::socklen_t,
}

impl SockAddr {
    /// Storage ready to be filled in by the OS (accept, recvfrom).
    pub(crate) fn zeroed() -> SockAddr {
        SockAddr {
            storage: unsafe { mem::zeroed() },
            len: mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t,
        }
    }

    /// Copies a raw address produced by the OS.
    ///
    /// # Safety
    ///
    /// `addr` must point to at least `len` valid bytes.
    pub(crate) unsafe fn from_raw(addr: *const libc::sockaddr, len: libc::socklen_t) -> SockAddr {
        let mut out = SockAddr::zeroed();
        let len = (len as usize).min(mem::size_of::<libc::sockaddr_storage>());
        std::ptr::copy_nonoverlapping(addr as *const u8, &mut out.storage as *mut _ as *mut u8, len);
        out.len = len as libc::socklen_t;
        out
    }

    /// Wraps a concrete sockaddr struct by value.
    pub(crate) fn from_sockaddr<T>(addr: T) -> SockAddr {
        let mut out = SockAddr::zeroed();
        assert!(mem::size_of::<T>() <= mem::size_of::<libc::sockaddr_storage>());
        unsafe {
            std::ptr::copy_nonoverlapping(
                &addr as *const T as *const u8,
                &mut out.storage as *mut _ as *mut u8,
                mem::size_of::<T>(),
            );
        }
        out.len = mem::size_of::<T>() as libc::socklen_t;
        out
    }

    pub(crate) fn as_ptr(&self) -> *const libc::sockaddr {
        &self.storage as *const _ as *const libc::sockaddr
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut libc::sockaddr {
        &mut self.storage as *mut _ as *mut libc::sockaddr
    }

    pub(crate) fn len(&self) -> libc::socklen_t {
        self.len
    }

    pub(crate) fn len_mut(&mut self) -> *mut libc::socklen_t {
        &mut self.len
    }

    pub(crate) fn set_len(&mut self, len: libc::socklen_t) {
        self.len = len;
    }

    pub(crate) fn family(&self) -> libc::sa_family_t {
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
            .field("family", &self.storage.ss_family)
            .field("len", &self.len)
            .finish()
    }
}

// The storage is plain bytes.
unsafe impl Send for SockAddr {}
unsafe impl Sync for SockAddr {}

/// Creates a socket with close-on-exec set, ready for the platform's event
/// loop (non-blocking on macOS, where readiness drives the syscalls).
pub(crate) fn new_socket(
    family: libc::c_int,
    socktype: libc::c_int,
    protocol: libc::c_int,
) -> Result<RawSocket, SystemError> {
    #[cfg(target_os = "linux")]
    {
        syscall!(socket(family, socktype | libc::SOCK_CLOEXEC, protocol))
    }

    #[cfg(target_os = "macos")]
    {
        let fd = syscall!(socket(family, socktype, protocol))?;
        // No SOCK_CLOEXEC/SOCK_NONBLOCK on macOS; set both with fcntl.
        if let Err(e) = prepare_socket(fd) {
            let _ = syscall!(close(fd));
            return Err(e);
        }
        Ok(fd)
    }
}

/// Marks a descriptor close-on-exec and non-blocking for use with kqueue.
#[cfg(target_os = "macos")]
pub(crate) fn prepare_socket(fd: RawSocket) -> Result<(), SystemError> {
    syscall!(fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC))?;
    let flags = syscall!(fcntl(fd, libc::F_GETFL, 0))?;
    syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
    Ok(())
}

/// Reads a socket option, returning the value.
#[cfg(target_os = "macos")]
pub(crate) fn getsockopt<T: Copy>(
    fd: RawSocket,
    level: libc::c_int,
    name: libc::c_int,
) -> Result<T, SystemError> {
    let mut value: T = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<T>() as libc::socklen_t;
    syscall!(getsockopt(
        fd,
        level,
        name,
        &mut value as *mut T as *mut libc::c_void,
        &mut len,
    ))?;
    Ok(value)
}

/// Sets a socket option.
pub(crate) fn setsockopt<T>(
    fd: RawSocket,
    level: libc::c_int,
    name: libc::c_int,
    value: T,
) -> Result<(), SystemError> {
    syscall!(setsockopt(
        fd,
        level,
        name,
        &value as *const T as *const libc::c_void,
        mem::size_of::<T>() as libc::socklen_t,
    ))?;
    Ok(())
}

/// The local address a socket is bound to.
pub(crate) fn local_addr(fd: RawSocket) -> Result<SockAddr, SystemError> {
    let mut addr = SockAddr::zeroed();
    syscall!(getsockname(fd, addr.as_mut_ptr(), addr.len_mut()))?;
    Ok(addr)
}

pub(crate) fn set_reuseaddr(fd: RawSocket) -> Result<(), SystemError> {
    setsockopt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1 as libc::c_int)
}

/// Lets an IPv6 socket accept mapped v4 connections.
pub(crate) fn set_dual_stack(fd: RawSocket) -> Result<(), SystemError> {
    setsockopt(fd, libc::IPPROTO_IPV6, libc::IPV6_V6ONLY, 0 as libc::c_int)
}

pub(crate) fn bind(fd: RawSocket, addr: &SockAddr) -> Result<(), SystemError> {
    syscall!(bind(fd, addr.as_ptr(), addr.len()))?;
    Ok(())
}

/// Synchronous connect, used for datagram sockets only: they complete
/// immediately and the OS queues no completion for them.
pub(crate) fn connect_sync(fd: RawSocket, addr: &SockAddr) -> Result<(), SystemError> {
    syscall!(connect(fd, addr.as_ptr(), addr.len()))?;
    Ok(())
}

pub(crate) fn listen(fd: RawSocket, backlog: libc::c_int) -> Result<(), SystemError> {
    syscall!(listen(fd, backlog))?;
    Ok(())
}

/// Synchronous close for descriptors not yet owned by a handle.
pub(crate) fn close_raw(fd: RawSocket) {
    let _ = syscall!(close(fd));
}
