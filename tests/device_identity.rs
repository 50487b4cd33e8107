// SPDX-License-Identifier: MIT OR Apache-2.0
//! Cross-module integration tests exercising the public API surface: identity parsing feeding into
//! the device database, and the CRC/error surfaces callers depend on. These cover spec §8's
//! end-to-end scenarios against literal fixture values rather than real hardware.

use libirecovery::db;
use libirecovery::error::{strerror, ErrorKind};
use libirecovery::identity::{encode_nonce, parse_iboot_string};

#[test]
fn scenario_1_then_2_parse_identity_and_look_it_up()
{
    let serial = "CPID:8015 CPRV:11 CPFM:03 SCEP:01 BDID:06 ECID:001122334455AABB IBFL:1C \
         SRNM:[ABCDE12345] IMEI:[012345678901234] SRTG:[iBoot-4000.0.0.1.16] NONC: 0102AABB SNON: DEADBEEF";

    let info = parse_iboot_string(serial).expect("well-formed identity string parses");
    assert_eq!(info.cpid, Some(0x8015));
    assert_eq!(info.bdid, Some(0x06));
    assert_eq!(info.ecid, Some(0x0011_2233_4455_AABB));

    let entry = db::lookup_by_client(info.cpid.unwrap(), info.bdid.unwrap(), false)
        .expect("iPhone10,3 row must exist for cpid=0x8015, bdid=0x06");
    assert_eq!(entry.product_type, "iPhone10,3");
    assert_eq!(entry.hardware_model, "d22ap");
    assert_eq!(entry.display_name, "iPhone X (Global)");
}

#[test]
fn scenario_6_port_dfu_identity_resolves_via_repacked_bdid()
{
    // mode=0x1881 (Port-DFU), bdid=0x15060301 packs to cpid=0x1506, bdid=0x03 (Apple Watch Series 6).
    let entry = db::lookup_by_client(0, 0x1506_0301, true).expect("row must exist for repacked Port-DFU identity");
    assert_eq!(entry.chip_id, 0x1506);
    assert_eq!(entry.board_id, 0x03);
}

#[test]
fn nonce_extraction_round_trips_to_normalised_hex()
{
    let serial = "CPID:8010 NONC: deadbeefcafe SNON: 00112233";
    let info = parse_iboot_string(serial).unwrap();

    assert_eq!(encode_nonce(info.ap_nonce.as_ref().unwrap()), "DEADBEEFCAFE");
    assert_eq!(encode_nonce(info.sep_nonce.as_ref().unwrap()), "00112233");
}

#[test]
fn unrecognised_identity_has_no_database_row()
{
    let info = parse_iboot_string("CPID:FFFF BDID:FF").unwrap();
    assert!(db::lookup_by_client(info.cpid.unwrap(), info.bdid.unwrap(), false).is_none());
}

#[test]
fn strerror_matches_error_kind_for_every_taxonomy_member()
{
    let kinds: &[(ErrorKind, &str)] = &[
        (ErrorKind::NoDevice, "no device found"),
        (ErrorKind::UnableToConnect, "unable to connect to device"),
        (ErrorKind::OutOfMemory, "out of memory"),
        (ErrorKind::UsbUpload, "unable to upload data to device"),
        (ErrorKind::Timeout, "transfer timed out"),
        (ErrorKind::Unsupported, "operation not supported"),
    ];

    for (kind, expected) in kinds {
        assert_eq!(strerror(kind.code()), *expected);
    }
}
