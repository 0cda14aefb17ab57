//! 128-bit UUIDs in a platform-independent representation.

use std::fmt;

/// A 128-bit UUID stored as raw bytes in big-endian (network) order.
#[derive(Clone, Copy, Default, Eq, Hash, PartialEq)]
pub struct Uuid128(pub [u8; 16]);

/// 16-bit protocol UUID for RFCOMM in SDP protocol descriptor lists.
pub const RFCOMM_PROTO_UUID: u16 = 0x0003;

/// 16-bit protocol UUID for L2CAP in SDP protocol descriptor lists.
pub const L2CAP_PROTO_UUID: u16 = 0x0100;

impl Uuid128 {
    /// Packs the four numeric segments of a UUID into byte form.
    pub const fn from_segments(d1: u32, d2: u16, d3: u16, d4: u64) -> Uuid128 {
        let a = d1.to_be_bytes();
        let b = d2.to_be_bytes();
        let c = d3.to_be_bytes();
        let d = d4.to_be_bytes();
        Uuid128([
            a[0], a[1], a[2], a[3], b[0], b[1], c[0], c[1], d[0], d[1], d[2], d[3], d[4], d[5],
            d[6], d[7],
        ])
    }
}

impl fmt::Debug for Uuid128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Uuid128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}{:02X}{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7], b[8], b[9], b[10], b[11], b[12], b[13],
            b[14], b[15]
        )
    }
}

/// Constructs a 128-bit Bluetooth UUID given the short (16- or 32-bit) UUID.
///
/// The short value replaces the x's in `0000xxxx-0000-1000-8000-00805F9B34FB`
/// (the Bluetooth base UUID).
pub const fn uuid_from_base(uuid_short: u32) -> Uuid128 {
    Uuid128::from_segments(uuid_short, 0x0000, 0x1000, 0x8000_0080_5F9B_34FB)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_expansion_round_trip() {
        // Serial Port Profile (0x1101).
        let uuid = uuid_from_base(0x1101);
        assert_eq!(
            uuid.0,
            [
                0x00, 0x00, 0x11, 0x01, 0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0x80, 0x5F,
                0x9B, 0x34, 0xFB
            ]
        );
        assert_eq!(uuid.to_string(), "00001101-0000-1000-8000-00805F9B34FB");
    }

    #[test]
    fn thirty_two_bit_expansion() {
        let uuid = uuid_from_base(0xDEAD_BEEF);
        assert_eq!(&uuid.0[..4], &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(&uuid.0[4..], &uuid_from_base(0).0[4..]);
    }
}
