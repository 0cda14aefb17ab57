//! Linux Bluetooth sockets and BlueZ paired-device enumeration.
//!
//! RFCOMM endpoints are stream sockets, L2CAP endpoints seqpacket sockets,
//! both in `AF_BLUETOOTH`. Paired devices come from BlueZ over the system
//! D-Bus (`ObjectManager.GetManagedObjects` filtered to `org.bluez.Device1`
//! with `Paired=true`).

use std::collections::HashMap;
use std::time::Duration;

use dbus::arg::{prop_cast, PropMap};
use dbus::blocking::Connection;
use libbluetooth::bluetooth::{bdaddr_t, BTPROTO_L2CAP, BTPROTO_RFCOMM};
use libbluetooth::rfcomm::sockaddr_rc;
use log::error;

use crate::device::{ConnectionType, Device};
use crate::error::{Error, ErrorKind, Result, SystemError};
use crate::sys::{RawSocket, SockAddr};

use super::syscall;

/// `sockaddr_l2` from BlueZ's `<bluetooth/l2cap.h>`. The PSM and CID are
/// stored in Bluetooth (little-endian) byte order.
#[repr(C)]
#[derive(Clone, Copy, Default)]
#[allow(non_camel_case_types)]
pub(crate) struct sockaddr_l2 {
    pub l2_family: libc::sa_family_t,
    pub l2_psm: u16,
    pub l2_bdaddr: bdaddr_t,
    pub l2_cid: u16,
    pub l2_bdaddr_type: u8,
}

/// Parses a colon-separated MAC string into BlueZ's byte order (the array
/// is little-endian: `b[0]` is the last printed octet).
pub(crate) fn parse_bdaddr(address: &str) -> Result<bdaddr_t> {
    let mut bytes = [0u8; 6];
    let mut count = 0;
    for (i, part) in address.split(':').enumerate() {
        if i >= 6 {
            return Err(invalid_address());
        }
        bytes[5 - i] = u8::from_str_radix(part, 16).map_err(|_| invalid_address())?;
        count += 1;
    }
    if count != 6 {
        return Err(invalid_address());
    }
    Ok(bdaddr_t { b: bytes })
}

/// Formats BlueZ's byte order back into a display MAC string.
pub(crate) fn format_bdaddr(addr: &bdaddr_t) -> String {
    let b = &addr.b;
    format!(
        "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        b[5], b[4], b[3], b[2], b[1], b[0]
    )
}

fn invalid_address() -> Error {
    SystemError::new(libc::EINVAL, ErrorKind::System).into()
}

/// Creates an RFCOMM stream socket and the address to connect/bind it to.
pub(crate) fn rfcomm_endpoint(address: &str, channel: u16) -> Result<(RawSocket, SockAddr)> {
    let bdaddr = parse_bdaddr(address)?;
    let fd = syscall!(socket(
        libc::AF_BLUETOOTH,
        libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
        BTPROTO_RFCOMM
    ))?;

    let mut addr = sockaddr_rc::default();
    addr.rc_family = libc::AF_BLUETOOTH as libc::sa_family_t;
    addr.rc_bdaddr = bdaddr;
    addr.rc_channel = channel as u8;
    Ok((fd, SockAddr::from_sockaddr(addr)))
}

/// Creates an L2CAP seqpacket socket and the address to connect/bind it to.
/// The PSM is stored in Bluetooth (little-endian) byte order.
pub(crate) fn l2cap_endpoint(address: &str, psm: u16) -> Result<(RawSocket, SockAddr)> {
    let bdaddr = parse_bdaddr(address)?;
    let fd = syscall!(socket(
        libc::AF_BLUETOOTH,
        libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC,
        BTPROTO_L2CAP
    ))?;

    let mut addr = sockaddr_l2::default();
    addr.l2_family = libc::AF_BLUETOOTH as libc::sa_family_t;
    addr.l2_psm = psm.to_le();
    addr.l2_bdaddr = bdaddr;
    Ok((fd, SockAddr::from_sockaddr(addr)))
}

/// Binds and listens a Bluetooth server socket. Channel/PSM 0 lets the
/// stack pick; the assigned one is read back from the bound address.
pub(crate) fn start_server(device: &Device) -> Result<(RawSocket, u16)> {
    let any = "00:00:00:00:00:00";
    let (fd, addr) = match device.conn_type {
        ConnectionType::Rfcomm => rfcomm_endpoint(any, device.port)?,
        ConnectionType::L2cap => l2cap_endpoint(any, device.port)?,
        _ => unreachable!("Bluetooth server with a non-Bluetooth device"),
    };

    let cleanup = |e: SystemError| {
        super::net::close_raw(fd);
        Error::from(e)
    };

    super::net::bind(fd, &addr).map_err(cleanup)?;
    super::net::listen(fd, libc::SOMAXCONN).map_err(cleanup)?;

    let local = super::net::local_addr(fd).map_err(cleanup)?;
    let assigned = device_from_addr(&local, device.conn_type)?.port;
    Ok((fd, assigned))
}

/// Builds a device out of a raw Bluetooth peer address.
pub(crate) fn device_from_addr(addr: &SockAddr, conn_type: ConnectionType) -> Result<Device> {
    match conn_type {
        ConnectionType::Rfcomm => {
            let rc: &sockaddr_rc = unsafe { &*(addr.as_ptr() as *const sockaddr_rc) };
            Ok(Device::new(
                conn_type,
                format_bdaddr(&rc.rc_bdaddr),
                u16::from(rc.rc_channel),
            ))
        }
        ConnectionType::L2cap => {
            let l2: &sockaddr_l2 = unsafe { &*(addr.as_ptr() as *const sockaddr_l2) };
            Ok(Device::new(
                conn_type,
                format_bdaddr(&l2.l2_bdaddr),
                u16::from_le(l2.l2_psm),
            ))
        }
        _ => unreachable!("Bluetooth address with a non-Bluetooth type"),
    }
}

type ManagedObjects = HashMap<dbus::Path<'static>, HashMap<String, PropMap>>;

/// BlueZ D-Bus failures carry no errno; log the message and surface a
/// generic I/O error to stay inside the error taxonomy.
fn dbus_error(e: dbus::Error) -> Error {
    error!("BlueZ D-Bus call failed: {e}");
    SystemError::new(libc::EIO, ErrorKind::System).into()
}

/// Enumerates devices paired with the local adapter.
///
/// The returned devices carry no connection type; the caller chooses
/// RFCOMM or L2CAP when connecting.
pub(crate) fn get_paired() -> Result<Vec<Device>> {
    let conn = Connection::new_system().map_err(dbus_error)?;
    let proxy = conn.with_proxy("org.bluez", "/", Duration::from_secs(5));

    let (objects,): (ManagedObjects,) = proxy
        .method_call("org.freedesktop.DBus.ObjectManager", "GetManagedObjects", ())
        .map_err(dbus_error)?;

    let mut devices = Vec::new();
    for (_path, interfaces) in objects {
        // Most returned interfaces (Introspectable, LEAdvertisingManager1,
        // ...) are not devices.
        let Some(props) = interfaces.get("org.bluez.Device1") else {
            continue;
        };
        if !prop_cast::<bool>(props, "Paired").copied().unwrap_or(false) {
            continue;
        }
        let Some(address) = prop_cast::<String>(props, "Address").cloned() else {
            continue;
        };
        let name = prop_cast::<String>(props, "Name").cloned().unwrap_or_default();

        devices.push(Device {
            conn_type: ConnectionType::None,
            name,
            address,
            port: 0,
        });
    }

    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bdaddr_round_trips() {
        let parsed = parse_bdaddr("FC:77:74:EB:C1:92").unwrap();
        assert_eq!(parsed.b, [0x92, 0xC1, 0xEB, 0x74, 0x77, 0xFC]);
        assert_eq!(format_bdaddr(&parsed), "FC:77:74:EB:C1:92");
    }

    #[test]
    fn malformed_addresses_are_rejected() {
        assert!(parse_bdaddr("").is_err());
        assert!(parse_bdaddr("FC:77:74:EB:C1").is_err());
        assert!(parse_bdaddr("FC:77:74:EB:C1:92:00").is_err());
        assert!(parse_bdaddr("GG:77:74:EB:C1:92").is_err());
    }
}
