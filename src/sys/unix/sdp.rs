//! Service Discovery Protocol inquiry through BlueZ's SDP client API.
//!
//! The entry points are declared here directly against `libbluetooth.so`;
//! the accessors that BlueZ only ships as static inlines
//! (`sdp_get_service_name` and friends) are replaced by their exported
//! backing function `sdp_get_string_attr`.

use std::ffi::{c_char, c_int, c_uint, c_void};
use std::ptr;

use libbluetooth::bluetooth::bdaddr_t;

use crate::btutils::{ProfileDesc, SdpResult};
use crate::error::{Result, SystemError};
use crate::uuid::{uuid_from_base, Uuid128, L2CAP_PROTO_UUID, RFCOMM_PROTO_UUID};

use super::bluez::parse_bdaddr;

// SDP data element type descriptors.
const SDP_UINT8: u8 = 0x08;
const SDP_UINT16: u8 = 0x09;
const SDP_UUID16: u8 = 0x19;
const SDP_UUID32: u8 = 0x1A;
const SDP_UUID128: u8 = 0x1C;

// Primary-language string attribute ids.
const SDP_ATTR_SVCNAME_PRIMARY: u16 = 0x0100;
const SDP_ATTR_SVCDESC_PRIMARY: u16 = 0x0101;

const SDP_RETRY_IF_BUSY: u32 = 0x01;
const SDP_ATTR_REQ_RANGE: c_uint = 2;

#[repr(C)]
#[derive(Copy, Clone)]
struct Uint128 {
    data: [u8; 16],
}

#[repr(C)]
#[derive(Copy, Clone)]
union UuidValue {
    uuid16: u16,
    uuid32: u32,
    uuid128: Uint128,
}

#[repr(C)]
#[derive(Copy, Clone)]
struct UuidT {
    type_: u8,
    value: UuidValue,
}

#[repr(C)]
struct SdpList {
    next: *mut SdpList,
    data: *mut c_void,
}

#[repr(C)]
#[derive(Copy, Clone)]
union SdpDataValue {
    int8: i8,
    int16: i16,
    int32: i32,
    int64: i64,
    int128: Uint128,
    uint8: u8,
    uint16: u16,
    uint32: u32,
    uint64: u64,
    uint128: Uint128,
    uuid: UuidT,
    str_: *mut c_char,
    dataseq: *mut SdpData,
}

#[repr(C)]
struct SdpData {
    dtd: u8,
    attr_id: u16,
    val: SdpDataValue,
    next: *mut SdpData,
    unit_size: c_int,
}

#[repr(C)]
struct SdpProfileDesc {
    uuid: UuidT,
    version: u16,
}

// Opaque BlueZ types.
#[repr(C)]
struct SdpSession {
    _private: [u8; 0],
}

#[repr(C)]
struct SdpRecord {
    _private: [u8; 0],
}

#[link(name = "bluetooth")]
extern "C" {
    fn sdp_connect(src: *const bdaddr_t, dst: *const bdaddr_t, flags: u32) -> *mut SdpSession;
    fn sdp_close(session: *mut SdpSession) -> c_int;

    fn sdp_list_append(list: *mut SdpList, data: *mut c_void) -> *mut SdpList;
    fn sdp_list_free(list: *mut SdpList, free_fn: Option<unsafe extern "C" fn(*mut c_void)>);

    fn sdp_uuid128_create(uuid: *mut UuidT, data: *const c_void) -> *mut UuidT;
    fn sdp_uuid_to_proto(uuid: *mut UuidT) -> c_int;

    fn sdp_service_search_attr_req(
        session: *mut SdpSession,
        search: *const SdpList,
        reqtype: c_uint,
        attrid_list: *const SdpList,
        rsp_list: *mut *mut SdpList,
    ) -> c_int;

    fn sdp_get_access_protos(rec: *const SdpRecord, protos: *mut *mut SdpList) -> c_int;
    fn sdp_get_service_classes(rec: *const SdpRecord, classes: *mut *mut SdpList) -> c_int;
    fn sdp_get_profile_descs(rec: *const SdpRecord, descs: *mut *mut SdpList) -> c_int;
    fn sdp_get_string_attr(
        rec: *const SdpRecord,
        attr_id: u16,
        value: *mut c_char,
        valuelen: c_int,
    ) -> c_int;
    fn sdp_record_free(rec: *mut SdpRecord);
}

struct Session(*mut SdpSession);

impl Drop for Session {
    fn drop(&mut self) {
        unsafe { sdp_close(self.0) };
    }
}

unsafe fn list_iter(head: *mut SdpList) -> impl Iterator<Item = &'static SdpList> {
    let mut cursor = head;
    std::iter::from_fn(move || {
        if cursor.is_null() {
            return None;
        }
        let item = unsafe { &*cursor };
        cursor = item.next;
        Some(item)
    })
}

/// Runs an SDP inquiry against a remote device, returning one result per
/// service record advertising a connectable port.
pub(crate) fn sdp_lookup(address: &str, uuid: Uuid128, _flush_cache: bool) -> Result<Vec<SdpResult>> {
    let target = parse_bdaddr(address)?;
    let any: bdaddr_t = bdaddr_t { b: [0; 6] };

    let session = unsafe { sdp_connect(&any, &target, SDP_RETRY_IF_BUSY) };
    if session.is_null() {
        return Err(SystemError::last_os().into());
    }
    let session = Session(session);

    // Search for the requested service UUID over the full attribute range.
    let mut service_uuid: UuidT = unsafe { std::mem::zeroed() };
    unsafe { sdp_uuid128_create(&mut service_uuid, uuid.0.as_ptr() as *const c_void) };
    let mut range: u32 = 0x0000_FFFF;

    let mut response: *mut SdpList = ptr::null_mut();
    let rc = unsafe {
        let search = sdp_list_append(ptr::null_mut(), &mut service_uuid as *mut _ as *mut c_void);
        let attrids = sdp_list_append(ptr::null_mut(), &mut range as *mut _ as *mut c_void);
        let rc = sdp_service_search_attr_req(
            session.0,
            search,
            SDP_ATTR_REQ_RANGE,
            attrids,
            &mut response,
        );
        sdp_list_free(search, None);
        sdp_list_free(attrids, None);
        rc
    };
    if rc < 0 {
        // A device with no matching services reports an empty list, not an
        // error; failures here are transport-level.
        return Err(SystemError::last_os().into());
    }

    let mut results = Vec::new();
    unsafe {
        for entry in list_iter(response) {
            let record = entry.data as *mut SdpRecord;
            if let Some(result) = walk_record(record) {
                results.push(result);
            }
            sdp_record_free(record);
        }
        sdp_list_free(response, None);
    }

    Ok(results)
}

/// Extracts one record's protocols, port, service classes, profiles, and
/// strings. Records without a protocol descriptor list yield `None`.
unsafe fn walk_record(record: *mut SdpRecord) -> Option<SdpResult> {
    let mut result = SdpResult::default();

    // Protocol descriptor list: inside each sub-list, integers paired with
    // the preceding protocol UUID carry the port (8-bit channel for RFCOMM,
    // 16-bit PSM for L2CAP).
    let mut protos: *mut SdpList = ptr::null_mut();
    if sdp_get_access_protos(record, &mut protos) < 0 {
        return None;
    }
    for sequence in list_iter(protos) {
        let inner = sequence.data as *mut SdpList;
        for descriptor in list_iter(inner) {
            let mut proto: u16 = 0;
            let mut data = descriptor.data as *mut SdpData;
            while !data.is_null() {
                let element = &mut *data;
                match element.dtd {
                    SDP_UUID16 | SDP_UUID32 | SDP_UUID128 => {
                        proto = sdp_uuid_to_proto(&mut element.val.uuid) as u16;
                        result.proto_uuids.push(proto);
                    }
                    SDP_UINT8 => {
                        if proto == RFCOMM_PROTO_UUID {
                            result.port = u16::from(element.val.uint8);
                        }
                    }
                    SDP_UINT16 => {
                        if proto == L2CAP_PROTO_UUID {
                            result.port = element.val.uint16;
                        }
                    }
                    _ => {}
                }
                data = element.next;
            }
        }
        sdp_list_free(inner, None);
    }
    sdp_list_free(protos, None);

    // Service class ID list, expanded to 128-bit form.
    let mut classes: *mut SdpList = ptr::null_mut();
    if sdp_get_service_classes(record, &mut classes) == 0 {
        for class in list_iter(classes) {
            let uuid = &*(class.data as *const UuidT);
            result.service_uuids.push(expand_uuid(uuid));
        }
        sdp_list_free(classes, None);
    }

    // Profile descriptor list: 16-bit UUID plus a split 16-bit version.
    let mut profiles: *mut SdpList = ptr::null_mut();
    if sdp_get_profile_descs(record, &mut profiles) == 0 {
        for profile in list_iter(profiles) {
            let desc = &*(profile.data as *const SdpProfileDesc);
            result
                .profile_descs
                .push(ProfileDesc::from_parts(desc.uuid.value.uuid16, desc.version));
        }
        sdp_list_free(profiles, None);
    }

    result.name = string_attr(record, SDP_ATTR_SVCNAME_PRIMARY);
    result.desc = string_attr(record, SDP_ATTR_SVCDESC_PRIMARY);

    Some(result)
}

unsafe fn string_attr(record: *const SdpRecord, attr_id: u16) -> String {
    let mut buf = vec![0u8; 1024];
    if sdp_get_string_attr(record, attr_id, buf.as_mut_ptr() as *mut c_char, buf.len() as c_int) < 0
    {
        return String::new();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    buf.truncate(end);
    String::from_utf8_lossy(&buf).into_owned()
}

unsafe fn expand_uuid(uuid: &UuidT) -> Uuid128 {
    match uuid.type_ {
        SDP_UUID16 => uuid_from_base(u32::from(uuid.value.uuid16)),
        SDP_UUID32 => uuid_from_base(uuid.value.uuid32),
        SDP_UUID128 => Uuid128(uuid.value.uuid128.data),
        _ => Uuid128::default(),
    }
}
