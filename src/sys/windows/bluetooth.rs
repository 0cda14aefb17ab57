//! Windows Bluetooth: RFCOMM sockets, paired-device enumeration, and SDP
//! through the Winsock service lookup API.

use std::mem;

use log::warn;
use windows_sys::core::GUID;
use windows_sys::Win32::Devices::Bluetooth as bth;
use windows_sys::Win32::Foundation::{GetLastError, ERROR_NO_MORE_ITEMS, ERROR_SUCCESS, HANDLE};
use windows_sys::Win32::Networking::WinSock as ws;

use crate::btutils::{ProfileDesc, SdpResult};
use crate::device::{ConnectionType, Device};
use crate::error::{Error, ErrorKind, Result, SystemError};
use crate::sys::{RawSocket, SockAddr};
use crate::uuid::{uuid_from_base, Uuid128, L2CAP_PROTO_UUID, RFCOMM_PROTO_UUID};

fn last_error() -> SystemError {
    SystemError::new(unsafe { GetLastError() }, ErrorKind::System)
}

fn wsa_error() -> SystemError {
    SystemError::new(unsafe { ws::WSAGetLastError() } as u32, ErrorKind::System)
}

/// Parses a colon-separated MAC string into the 48-bit integer form the
/// Microsoft stack uses.
pub(crate) fn parse_bth_addr(address: &str) -> Result<u64> {
    let mut value = 0u64;
    let mut octets = 0;
    for part in address.split(':') {
        let octet =
            u8::from_str_radix(part, 16).map_err(|_| invalid_address())?;
        value = (value << 8) | u64::from(octet);
        octets += 1;
    }
    if octets != 6 {
        return Err(invalid_address());
    }
    Ok(value)
}

pub(crate) fn format_bth_addr(addr: u64) -> String {
    let b = addr.to_be_bytes();
    format!(
        "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        b[2], b[3], b[4], b[5], b[6], b[7]
    )
}

fn invalid_address() -> Error {
    SystemError::new(ws::WSAEFAULT as u32, ErrorKind::System).into()
}

/// Creates an RFCOMM socket and the address to connect/bind it to.
pub(crate) fn rfcomm_endpoint(address: &str, channel: u16) -> Result<(RawSocket, SockAddr)> {
    let bt_addr = parse_bth_addr(address)?;

    let socket = super::net::new_socket(
        bth::AF_BTH as i32,
        ws::SOCK_STREAM,
        bth::BTHPROTO_RFCOMM as i32,
    )?;

    let addr = bth::SOCKADDR_BTH {
        addressFamily: bth::AF_BTH,
        btAddr: bt_addr,
        serviceClassId: unsafe { mem::zeroed() },
        port: u32::from(channel),
    };
    Ok((socket, SockAddr::from_sockaddr(addr)))
}

/// Binds and listens an RFCOMM server socket. Port 0 maps to
/// `BT_PORT_ANY`; the assigned channel is read back with `getsockname`.
pub(crate) fn start_server(device: &Device) -> Result<(RawSocket, u16)> {
    if device.conn_type != ConnectionType::Rfcomm {
        return Err(SystemError::new(ws::WSAEPROTONOSUPPORT as u32, ErrorKind::System).into());
    }

    let socket = super::net::new_socket(
        bth::AF_BTH as i32,
        ws::SOCK_STREAM,
        bth::BTHPROTO_RFCOMM as i32,
    )?;
    let cleanup = |e: SystemError| {
        super::net::close_raw(socket);
        Error::from(e)
    };

    let port = if device.port == 0 {
        bth::BT_PORT_ANY as u32
    } else {
        u32::from(device.port)
    };
    let addr = bth::SOCKADDR_BTH {
        addressFamily: bth::AF_BTH,
        btAddr: 0,
        serviceClassId: unsafe { mem::zeroed() },
        port,
    };

    // Bluetooth sockets expect the exact SOCKADDR_BTH size, not a
    // SOCKADDR_STORAGE.
    let rc = unsafe {
        ws::bind(
            socket,
            &addr as *const _ as *const ws::SOCKADDR,
            mem::size_of::<bth::SOCKADDR_BTH>() as i32,
        )
    };
    if rc != 0 {
        return Err(cleanup(wsa_error()));
    }
    super::net::listen(socket, ws::SOMAXCONN as i32).map_err(cleanup)?;

    let mut bound: bth::SOCKADDR_BTH = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<bth::SOCKADDR_BTH>() as i32;
    let rc = unsafe {
        ws::getsockname(socket, &mut bound as *mut _ as *mut ws::SOCKADDR, &mut len)
    };
    if rc != 0 {
        return Err(cleanup(wsa_error()));
    }

    Ok((socket, bound.port as u16))
}

/// Builds a device out of a raw Bluetooth peer address, resolving the
/// device's display name when the radio knows it.
pub(crate) fn device_from_addr(addr: &SockAddr, conn_type: ConnectionType) -> Result<Device> {
    let bth_addr: &bth::SOCKADDR_BTH = unsafe { &*(addr.as_ptr() as *const bth::SOCKADDR_BTH) };

    let mut info: bth::BLUETOOTH_DEVICE_INFO = unsafe { mem::zeroed() };
    info.dwSize = mem::size_of::<bth::BLUETOOTH_DEVICE_INFO>() as u32;
    info.Address.Anonymous.ullLong = bth_addr.btAddr;

    let name = unsafe {
        if bth::BluetoothGetDeviceInfo(std::ptr::null_mut(), &mut info) == ERROR_SUCCESS {
            utf16_string(&info.szName)
        } else {
            String::new()
        }
    };

    Ok(Device {
        conn_type,
        name,
        address: format_bth_addr(bth_addr.btAddr),
        port: bth_addr.port as u16,
    })
}

fn utf16_string(buf: &[u16]) -> String {
    let end = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
    String::from_utf16_lossy(&buf[..end])
}

/// Enumerates remembered (paired) devices; no inquiry is issued.
pub(crate) fn get_paired() -> Result<Vec<Device>> {
    let search = bth::BLUETOOTH_DEVICE_SEARCH_PARAMS {
        dwSize: mem::size_of::<bth::BLUETOOTH_DEVICE_SEARCH_PARAMS>() as u32,
        fReturnAuthenticated: 0,
        fReturnRemembered: 1,
        fReturnUnknown: 0,
        fReturnConnected: 0,
        fIssueInquiry: 0,
        cTimeoutMultiplier: 0,
        hRadio: std::ptr::null_mut(),
    };

    let mut info: bth::BLUETOOTH_DEVICE_INFO = unsafe { mem::zeroed() };
    info.dwSize = mem::size_of::<bth::BLUETOOTH_DEVICE_INFO>() as u32;

    let find = unsafe { bth::BluetoothFindFirstDevice(&search, &mut info) };
    if find.is_null() {
        // No paired devices is a normal outcome.
        let code = unsafe { GetLastError() };
        if code == ERROR_NO_MORE_ITEMS {
            return Ok(Vec::new());
        }
        return Err(last_error().into());
    }

    let mut devices = Vec::new();
    loop {
        let address = unsafe { format_bth_addr(info.Address.Anonymous.ullLong) };
        devices.push(Device {
            conn_type: ConnectionType::None,
            name: utf16_string(&info.szName),
            address,
            port: 0,
        });

        if unsafe { bth::BluetoothFindNextDevice(find, &mut info) } == 0 {
            break;
        }
    }
    unsafe { bth::BluetoothFindDeviceClose(find) };

    Ok(devices)
}

fn guid_from_uuid(uuid: Uuid128) -> GUID {
    let b = uuid.0;
    GUID {
        data1: u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
        data2: u16::from_be_bytes([b[4], b[5]]),
        data3: u16::from_be_bytes([b[6], b[7]]),
        data4: [b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15]],
    }
}

fn uuid_from_guid(guid: &GUID) -> Uuid128 {
    let mut out = [0u8; 16];
    out[..4].copy_from_slice(&guid.data1.to_be_bytes());
    out[4..6].copy_from_slice(&guid.data2.to_be_bytes());
    out[6..8].copy_from_slice(&guid.data3.to_be_bytes());
    out[8..].copy_from_slice(&guid.data4);
    Uuid128(out)
}

/// The SDP container elements nested under one attribute of the record
/// blob.
unsafe fn container_elements(
    blob: &ws::BLOB,
    attribute: u16,
) -> Vec<bth::SDP_ELEMENT_DATA> {
    let mut element: bth::SDP_ELEMENT_DATA = mem::zeroed();
    if bth::BluetoothSdpGetAttributeValue(blob.pBlobData, blob.cbSize, attribute, &mut element)
        != ERROR_SUCCESS
    {
        return Vec::new();
    }
    sequence_elements(&element)
}

unsafe fn sequence_elements(element: &bth::SDP_ELEMENT_DATA) -> Vec<bth::SDP_ELEMENT_DATA> {
    let value = element.data.sequence.value;
    let length = element.data.sequence.length;

    let mut out = Vec::new();
    let mut iter: bth::HBLUETOOTH_CONTAINER_ELEMENT = std::ptr::null_mut();
    let mut item: bth::SDP_ELEMENT_DATA = mem::zeroed();
    while bth::BluetoothSdpGetContainerElementData(value, length, &mut iter, &mut item)
        == ERROR_SUCCESS
    {
        out.push(item);
    }
    out
}

/// Walks one protocol descriptor: UUIDs paired with the channel/PSM.
unsafe fn check_protocol_attributes(element: &bth::SDP_ELEMENT_DATA, result: &mut SdpResult) {
    let mut proto = 0u16;
    for item in sequence_elements(element) {
        match item.specificType {
            bth::SDP_ST_UUID16 => {
                proto = item.data.uuid16;
                result.proto_uuids.push(proto);
            }
            bth::SDP_ST_UINT8 => {
                if proto == RFCOMM_PROTO_UUID {
                    result.port = u16::from(item.data.uint8);
                }
            }
            bth::SDP_ST_UINT16 => {
                if proto == L2CAP_PROTO_UUID {
                    result.port = item.data.uint16;
                }
            }
            _ => {}
        }
    }
}

unsafe fn element_uuid(element: &bth::SDP_ELEMENT_DATA) -> Uuid128 {
    match element.specificType {
        bth::SDP_ST_UUID16 => uuid_from_base(u32::from(element.data.uuid16)),
        bth::SDP_ST_UUID32 => uuid_from_base(element.data.uuid32),
        bth::SDP_ST_UUID128 => uuid_from_guid(&element.data.uuid128),
        _ => Uuid128::default(),
    }
}

unsafe fn profile_descriptor(element: &bth::SDP_ELEMENT_DATA) -> ProfileDesc {
    let mut uuid = 0u16;
    let mut version = 0u16;
    for item in sequence_elements(element) {
        if item.specificType == bth::SDP_ST_UUID16 {
            uuid = item.data.uuid16;
        } else if item.specificType == bth::SDP_ST_UINT16 {
            version = item.data.uint16;
        }
    }
    ProfileDesc::from_parts(uuid, version)
}

/// Runs an SDP inquiry via `WSALookupService*`, parsing each returned
/// record blob.
pub(crate) fn sdp_lookup(address: &str, uuid: Uuid128, flush_cache: bool) -> Result<Vec<SdpResult>> {
    let addr_wide: Vec<u16> = address.encode_utf16().chain(std::iter::once(0)).collect();
    let mut guid = guid_from_uuid(uuid);

    let mut query: ws::WSAQUERYSETW = unsafe { mem::zeroed() };
    query.dwSize = mem::size_of::<ws::WSAQUERYSETW>() as u32;
    query.lpServiceClassId = &mut guid;
    query.dwNameSpace = ws::NS_BTH;
    query.lpszContext = addr_wide.as_ptr() as *mut u16;

    let mut flags = ws::LUP_RETURN_NAME
        | ws::LUP_RETURN_TYPE
        | ws::LUP_RETURN_ADDR
        | ws::LUP_RETURN_BLOB
        | ws::LUP_RETURN_COMMENT;
    if flush_cache {
        flags |= ws::LUP_FLUSHCACHE;
    }

    let mut lookup: HANDLE = std::ptr::null_mut();
    let rc = unsafe { ws::WSALookupServiceBeginW(&query, flags, &mut lookup) };
    if rc != 0 {
        let e = wsa_error();
        // No matching services is an empty list, not an error.
        if e.code == ws::WSASERVICE_NOT_FOUND as u32 {
            return Ok(Vec::new());
        }
        return Err(e.into());
    }

    let mut results = Vec::new();
    let mut buf = vec![0u8; 2048];

    loop {
        let mut size = buf.len() as u32;
        let response = buf.as_mut_ptr() as *mut ws::WSAQUERYSETW;
        unsafe {
            (*response).dwSize = mem::size_of::<ws::WSAQUERYSETW>() as u32;
            (*response).dwNameSpace = ws::NS_BTH;
        }

        let rc = unsafe { ws::WSALookupServiceNextW(lookup, flags, &mut size, response) };
        if rc != 0 {
            let e = wsa_error();
            if e.code == ws::WSAEFAULT as u32 && size as usize > buf.len() {
                // Result did not fit; grow and retry.
                buf.resize(size as usize, 0);
                continue;
            }
            if e.code != ws::WSA_E_NO_MORE as u32 && e.code != ws::WSAENOMORE as u32 {
                warn!("SDP lookup ended with {e}");
            }
            break;
        }

        unsafe {
            let response = &*response;
            let mut result = SdpResult::default();

            if !response.lpszServiceInstanceName.is_null() {
                result.name = utf16_from_ptr(response.lpszServiceInstanceName);
            }
            if !response.lpszComment.is_null() {
                result.desc = utf16_from_ptr(response.lpszComment);
            }

            let Some(blob) = response.lpBlob.as_ref() else {
                continue;
            };

            // The protocol descriptor list carries the port, which is
            // required for connecting.
            let protos =
                container_elements(blob, bth::SDP_ATTRIB_PROTOCOL_DESCRIPTOR_LIST as u16);
            if protos.is_empty() {
                continue;
            }
            for element in &protos {
                check_protocol_attributes(element, &mut result);
            }

            for element in container_elements(blob, bth::SDP_ATTRIB_CLASS_ID_LIST as u16) {
                result.service_uuids.push(element_uuid(&element));
            }

            for element in
                container_elements(blob, bth::SDP_ATTRIB_PROFILE_DESCRIPTOR_LIST as u16)
            {
                result.profile_descs.push(profile_descriptor(&element));
            }

            results.push(result);
        }
    }

    unsafe { ws::WSALookupServiceEnd(lookup) };
    Ok(results)
}

unsafe fn utf16_from_ptr(ptr: *const u16) -> String {
    let mut len = 0;
    while *ptr.add(len) != 0 {
        len += 1;
    }
    String::from_utf16_lossy(std::slice::from_raw_parts(ptr, len))
}
