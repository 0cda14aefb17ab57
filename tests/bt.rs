//! Bluetooth discovery checks.
//!
//! These need a Bluetooth adapter (and for the SDP test, a paired device
//! in range); run them explicitly with `cargo test -- --ignored`.

mod common;

use netterm::btutils;
use netterm::uuid_from_base;

fn is_mac_string(s: &str) -> bool {
    let parts: Vec<&str> = s.split(':').collect();
    parts.len() == 6
        && parts.iter().all(|p| {
            p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase())
        })
}

#[test]
#[ignore = "requires a Bluetooth adapter"]
fn paired_devices_have_well_formed_addresses() {
    common::init();

    let devices = btutils::get_paired().expect("paired enumeration failed");
    for device in devices {
        assert_eq!(device.conn_type, netterm::ConnectionType::None);
        assert!(
            is_mac_string(&device.address),
            "malformed MAC: {}",
            device.address
        );
    }
}

#[test]
#[ignore = "requires a paired Bluetooth device in range"]
fn sdp_results_pair_protocols_with_ports() {
    common::init();

    let devices = btutils::get_paired().expect("paired enumeration failed");
    let device = devices.first().expect("no paired devices to query");

    // L2CAP (0x0100) is the base of every Bluetooth service; RFCOMM
    // (0x0003) narrows the port to an 8-bit channel.
    let results = btutils::sdp_lookup(&device.address, uuid_from_base(0x0100), true)
        .expect("SDP inquiry failed");

    for result in results {
        if result.proto_uuids.contains(&netterm::RFCOMM_PROTO_UUID) {
            assert!(result.port <= u16::from(u8::MAX));
        } else {
            assert!(result.proto_uuids.contains(&netterm::L2CAP_PROTO_UUID));
        }
    }
}
