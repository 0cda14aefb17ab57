//! Address and service resolution over the platform resolver.

use std::ffi::CString;

use crate::device::{ConnectionType, Device, IpVersion};
use crate::error::{Error, ErrorKind, Result, SystemError};
use crate::sockets::handle::{Ip, SocketHandle};
use crate::sockets::ServerAddress;
use crate::sys::{self, SockAddr};

/// One result out of `getaddrinfo`, with everything needed to create and
/// connect a matching socket.
#[derive(Clone, Debug)]
pub(crate) struct ResolvedAddr {
    pub family: i32,
    pub socktype: i32,
    pub protocol: i32,
    pub addr: SockAddr,
}

/// Resolves a device's address and port.
///
/// With `use_dns` false the lookup is purely numeric (`AI_NUMERICHOST`).
/// Errors surface under the `AddrInfo` taxonomy.
pub(crate) fn resolve(device: &Device, use_dns: bool) -> Result<Vec<ResolvedAddr>> {
    let is_udp = device.conn_type == ConnectionType::Udp;
    let node = if device.address.is_empty() {
        None
    } else {
        Some(CString::new(device.address.as_str()).map_err(|_| bad_host())?)
    };
    let service = CString::new(device.port.to_string()).expect("port strings have no NUL");

    imp::getaddrinfo(node.as_deref(), &service, use_dns, is_udp)
}

fn bad_host() -> Error {
    Error::System(SystemError::new(imp::NONAME, ErrorKind::AddrInfo))
}

/// Builds a device out of a raw peer address via numeric reverse lookup.
pub(crate) fn from_addr(addr: &SockAddr, conn_type: ConnectionType) -> Result<Device> {
    let (host, service) = imp::getnameinfo(addr)?;
    let port = service.parse::<u16>().unwrap_or(0);
    Ok(Device::new(conn_type, host, port))
}

/// The port and IP family a bound socket ended up with.
///
/// Port 0 at bind time means "OS assigns"; this recovers the real one.
pub(crate) fn bound_address(handle: &SocketHandle<Ip>) -> Result<ServerAddress> {
    let addr = sys::net::local_addr(handle.raw())?;
    let (_, service) = imp::getnameinfo(&addr)?;
    let ip_version = match i32::from(addr.family()) {
        sys::AF_INET => IpVersion::V4,
        sys::AF_INET6 => IpVersion::V6,
        _ => IpVersion::None,
    };
    Ok(ServerAddress {
        port: service.parse::<u16>().unwrap_or(0),
        ip_version,
    })
}

/// Creates, binds, and (for TCP) starts listening on a server socket.
///
/// The wildcard resolves to IPv6 where available; v6 sockets accept mapped
/// v4 peers. Shared by the IP server delegate.
pub(crate) fn start_server(device: &Device, handle: &mut SocketHandle<Ip>) -> Result<ServerAddress> {
    let is_tcp = device.conn_type == ConnectionType::Tcp;
    let resolved = resolve(device, false)?;

    let mut last_err = None;
    for entry in resolved {
        // Only AF_INET/AF_INET6 are supported.
        if entry.family != sys::AF_INET && entry.family != sys::AF_INET6 {
            continue;
        }

        match bind_one(&entry, is_tcp) {
            Ok(fd) => {
                handle.reset(fd);
                return bound_address(handle);
            }
            Err(e) => last_err = Some(e),
        }
    }

    Err(last_err.map(Error::System).unwrap_or_else(bad_host))
}

fn bind_one(entry: &ResolvedAddr, is_tcp: bool) -> std::result::Result<sys::RawSocket, SystemError> {
    let fd = sys::new_socket(entry.family, entry.socktype, entry.protocol)?;

    let cleanup = |e: SystemError| {
        sys::net::close_raw(fd);
        e
    };

    sys::net::set_reuseaddr(fd).map_err(cleanup)?;
    if entry.family == sys::AF_INET6 {
        // Accept mapped v4 connections on the v6 socket.
        sys::net::set_dual_stack(fd).map_err(cleanup)?;
    }

    sys::net::bind(fd, &entry.addr).map_err(cleanup)?;
    if is_tcp {
        sys::net::listen(fd, sys::SOMAXCONN).map_err(cleanup)?;
    }

    Ok(fd)
}

#[cfg(unix)]
mod imp {
    use std::ffi::{CStr, CString};

    use crate::error::{Error, ErrorKind, Result, SystemError};
    use crate::sys::SockAddr;

    use super::ResolvedAddr;

    pub(super) const NONAME: i32 = libc::EAI_NONAME;

    pub(super) fn getaddrinfo(
        node: Option<&CStr>,
        service: &CString,
        use_dns: bool,
        is_udp: bool,
    ) -> Result<Vec<ResolvedAddr>> {
        let mut hints: libc::addrinfo = unsafe { std::mem::zeroed() };
        hints.ai_flags = if use_dns { 0 } else { libc::AI_NUMERICHOST };
        if node.is_none() {
            hints.ai_flags |= libc::AI_PASSIVE;
        }
        hints.ai_family = libc::AF_UNSPEC;
        hints.ai_socktype = if is_udp {
            libc::SOCK_DGRAM
        } else {
            libc::SOCK_STREAM
        };
        hints.ai_protocol = if is_udp {
            libc::IPPROTO_UDP
        } else {
            libc::IPPROTO_TCP
        };

        let mut list: *mut libc::addrinfo = std::ptr::null_mut();
        let rc = unsafe {
            libc::getaddrinfo(
                node.map_or(std::ptr::null(), |n| n.as_ptr()),
                service.as_ptr(),
                &hints,
                &mut list,
            )
        };
        if rc != 0 {
            return Err(Error::System(SystemError::new(rc, ErrorKind::AddrInfo)));
        }

        let mut out = Vec::new();
        let mut cursor = list;
        while !cursor.is_null() {
            let entry = unsafe { &*cursor };
            if !entry.ai_addr.is_null() {
                out.push(ResolvedAddr {
                    family: entry.ai_family,
                    socktype: entry.ai_socktype,
                    protocol: entry.ai_protocol,
                    addr: unsafe { SockAddr::from_raw(entry.ai_addr, entry.ai_addrlen) },
                });
            }
            cursor = entry.ai_next;
        }
        unsafe { libc::freeaddrinfo(list) };

        Ok(out)
    }

    // NI_MAXHOST/NI_MAXSERV from <netdb.h>; not exposed by libc on every
    // Unix flavor.
    const NI_MAXHOST: usize = 1025;
    const NI_MAXSERV: usize = 32;

    /// Numeric reverse lookup; returns host and service strings with
    /// trailing NULs stripped.
    pub(super) fn getnameinfo(addr: &SockAddr) -> Result<(String, String)> {
        let mut host = [0 as libc::c_char; NI_MAXHOST];
        let mut service = [0 as libc::c_char; NI_MAXSERV];

        let rc = unsafe {
            libc::getnameinfo(
                addr.as_ptr(),
                addr.len(),
                host.as_mut_ptr(),
                host.len() as libc::socklen_t,
                service.as_mut_ptr(),
                service.len() as libc::socklen_t,
                libc::NI_NUMERICHOST | libc::NI_NUMERICSERV,
            )
        };
        if rc != 0 {
            return Err(Error::System(SystemError::new(rc, ErrorKind::AddrInfo)));
        }

        let host = unsafe { CStr::from_ptr(host.as_ptr()) }
            .to_string_lossy()
            .into_owned();
        let service = unsafe { CStr::from_ptr(service.as_ptr()) }
            .to_string_lossy()
            .into_owned();
        Ok((host, service))
    }
}

#[cfg(windows)]
mod imp {
    // Winsock exposes the same ANSI resolver entry points.
    use std::ffi::{CStr, CString};

    use windows_sys::Win32::Networking::WinSock as ws;

    use crate::error::{Error, ErrorKind, Result, SystemError};
    use crate::sys::SockAddr;

    use super::ResolvedAddr;

    pub(super) const NONAME: u32 = ws::WSAHOST_NOT_FOUND as u32;

    pub(super) fn getaddrinfo(
        node: Option<&CStr>,
        service: &CString,
        use_dns: bool,
        is_udp: bool,
    ) -> Result<Vec<ResolvedAddr>> {
        let mut hints: ws::ADDRINFOA = unsafe { std::mem::zeroed() };
        hints.ai_flags = if use_dns { 0 } else { ws::AI_NUMERICHOST as i32 };
        if node.is_none() {
            hints.ai_flags |= ws::AI_PASSIVE as i32;
        }
        hints.ai_family = ws::AF_UNSPEC as i32;
        hints.ai_socktype = if is_udp { ws::SOCK_DGRAM } else { ws::SOCK_STREAM };
        hints.ai_protocol = if is_udp {
            ws::IPPROTO_UDP
        } else {
            ws::IPPROTO_TCP
        };

        let mut list: *mut ws::ADDRINFOA = std::ptr::null_mut();
        let rc = unsafe {
            ws::getaddrinfo(
                node.map_or(std::ptr::null(), |n| n.as_ptr() as *const u8),
                service.as_ptr() as *const u8,
                &hints,
                &mut list,
            )
        };
        if rc != 0 {
            return Err(Error::System(SystemError::new(
                rc as u32,
                ErrorKind::AddrInfo,
            )));
        }

        let mut out = Vec::new();
        let mut cursor = list;
        while !cursor.is_null() {
            let entry = unsafe { &*cursor };
            if !entry.ai_addr.is_null() {
                out.push(ResolvedAddr {
                    family: entry.ai_family,
                    socktype: entry.ai_socktype,
                    protocol: entry.ai_protocol,
                    addr: unsafe { SockAddr::from_raw(entry.ai_addr, entry.ai_addrlen as i32) },
                });
            }
            cursor = entry.ai_next;
        }
        unsafe { ws::freeaddrinfo(list) };

        Ok(out)
    }

    pub(super) fn getnameinfo(addr: &SockAddr) -> Result<(String, String)> {
        let mut host = [0i8; 1025];
        let mut service = [0i8; 32];

        let rc = unsafe {
            ws::getnameinfo(
                addr.as_ptr(),
                addr.len(),
                host.as_mut_ptr() as *mut u8,
                host.len() as u32,
                service.as_mut_ptr() as *mut u8,
                service.len() as u32,
                (ws::NI_NUMERICHOST | ws::NI_NUMERICSERV) as i32,
            )
        };
        if rc != 0 {
            return Err(Error::System(SystemError::new(
                unsafe { ws::WSAGetLastError() } as u32,
                ErrorKind::AddrInfo,
            )));
        }

        let host = unsafe { CStr::from_ptr(host.as_ptr()) }
            .to_string_lossy()
            .into_owned();
        let service = unsafe { CStr::from_ptr(service.as_ptr()) }
            .to_string_lossy()
            .into_owned();
        Ok((host, service))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn numeric_v4_resolves_without_dns() {
        let device = Device::new(ConnectionType::Tcp, "127.0.0.1", 8080);
        let addrs = resolve(&device, false).unwrap();
        assert!(!addrs.is_empty());
        assert_eq!(addrs[0].family, libc::AF_INET);
        assert_eq!(addrs[0].socktype, libc::SOCK_STREAM);
    }

    #[test]
    fn numeric_v6_resolves_without_dns() {
        let device = Device::new(ConnectionType::Udp, "::1", 9);
        let addrs = resolve(&device, false).unwrap();
        assert!(!addrs.is_empty());
        assert_eq!(addrs[0].family, libc::AF_INET6);
        assert_eq!(addrs[0].socktype, libc::SOCK_DGRAM);
    }

    #[test]
    fn hostname_is_rejected_when_numeric() {
        let device = Device::new(ConnectionType::Tcp, "definitely-not-an-ip.invalid", 80);
        let err = resolve(&device, false).unwrap_err();
        let sys = err.as_system().copied().unwrap();
        assert_eq!(sys.kind, ErrorKind::AddrInfo);
    }

    #[test]
    fn reverse_lookup_round_trips() {
        let device = Device::new(ConnectionType::Tcp, "127.0.0.1", 4321);
        let addrs = resolve(&device, false).unwrap();
        let back = from_addr(&addrs[0].addr, ConnectionType::Tcp).unwrap();
        assert_eq!(back.address, "127.0.0.1");
        assert_eq!(back.port, 4321);
        assert_eq!(back.conn_type, ConnectionType::Tcp);
    }
}
