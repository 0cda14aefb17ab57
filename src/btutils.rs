//! Bluetooth device enumeration and SDP discovery.

use crate::device::Device;
use crate::error::Result;
use crate::uuid::Uuid128;

/// A Bluetooth profile descriptor.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ProfileDesc {
    /// 16-bit profile UUID.
    pub uuid: u16,
    pub version_major: u8,
    pub version_minor: u8,
}

impl ProfileDesc {
    /// Splits the 16-bit version word into major (high byte) and minor
    /// (low byte).
    pub(crate) fn from_parts(uuid: u16, version: u16) -> ProfileDesc {
        ProfileDesc {
            uuid,
            version_major: (version >> 8) as u8,
            version_minor: (version & 0xFF) as u8,
        }
    }
}

/// One service record returned from an SDP inquiry.
#[derive(Clone, Debug, Default)]
pub struct SdpResult {
    /// 16-bit protocol UUIDs found in the protocol descriptor list.
    pub proto_uuids: Vec<u16>,
    /// 128-bit service class UUIDs.
    pub service_uuids: Vec<Uuid128>,
    /// Profile descriptors.
    pub profile_descs: Vec<ProfileDesc>,
    /// Port advertised (RFCOMM channel or L2CAP PSM).
    pub port: u16,
    /// Service name.
    pub name: String,
    /// Service description (if any).
    pub desc: String,
}

/// Gets the Bluetooth devices paired with this computer.
///
/// The returned devices have no connection type set because the protocol to
/// use with them is indeterminate; the caller chooses RFCOMM or L2CAP when
/// connecting.
pub fn get_paired() -> Result<Vec<Device>> {
    crate::sys::bt::get_paired()
}

/// Runs a Service Discovery Protocol inquiry on a remote device.
///
/// `flush_cache` forces a fresh inquiry on platforms that cache SDP
/// responses (Windows); elsewhere it is accepted and ignored. An inquiry
/// finding no services is an empty list, not an error.
pub fn sdp_lookup(address: &str, uuid: Uuid128, flush_cache: bool) -> Result<Vec<SdpResult>> {
    #[cfg(target_os = "linux")]
    {
        crate::sys::sdp::sdp_lookup(address, uuid, flush_cache)
    }
    #[cfg(not(target_os = "linux"))]
    {
        crate::sys::bt::sdp_lookup(address, uuid, flush_cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_word_splits_into_major_minor() {
        let desc = ProfileDesc::from_parts(0x1101, 0x0103);
        assert_eq!(desc.uuid, 0x1101);
        assert_eq!(desc.version_major, 1);
        assert_eq!(desc.version_minor, 3);
    }
}
