// SPDX-License-Identifier: MIT OR Apache-2.0
//! Parses device identity out of the iBoot serial string and the KIS info response (spec §4.3).
//!
//! Field extraction is hand-rolled byte scanning rather than a regex crate — the grammar is a
//! flat space-delimited tag list and every tag has a fixed, small shape, so a scanner reads more
//! directly than a pattern compiled at runtime.

use crate::error::{Error, ErrorKind};

/// Device-info record filled in by [`parse_iboot_string`] / [`parse_kis_info_response`].
///
/// Every field is independently present-or-absent, matching spec §3's device-info record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo
{
    pub cpid: Option<u32>,
    pub cprv: Option<u32>,
    pub cpfm: Option<u32>,
    pub scep: Option<u32>,
    pub bdid: Option<u32>,
    pub ibfl: Option<u32>,
    pub ecid: Option<u64>,
    pub pid: Option<u32>,
    pub srnm: Option<String>,
    pub imei: Option<String>,
    pub srtg: Option<String>,
    pub serial_string: Option<String>,
    pub ap_nonce: Option<Vec<u8>>,
    pub sep_nonce: Option<Vec<u8>>,
}

/// Parses an iBoot serial string (`"CPID:8010 CPRV:11 ... SRNM:[ABCDE12345] ... NONC:0102AABB"`)
/// into a [`DeviceInfo`]. Absent tags simply leave their destination `None` — this never errors on
/// missing fields, only on a tag whose value fails to parse as the shape that tag requires.
pub fn parse_iboot_string(serial: &str) -> Result<DeviceInfo, Error>
{
    let mut info = DeviceInfo { serial_string: Some(serial.to_string()), ..Default::default() };

    for field in serial.split(' ') {
        let Some((tag, value)) = field.split_once(':') else { continue };
        let value = value.strip_prefix('[').and_then(|v| v.strip_suffix(']')).unwrap_or(value);
        if value.is_empty() {
            continue;
        }

        match tag {
            "CPID" => info.cpid = Some(parse_hex_u32(value, tag)?),
            "CPRV" => info.cprv = Some(parse_hex_u32(value, tag)?),
            "CPFM" => info.cpfm = Some(parse_hex_u32(value, tag)?),
            "SCEP" => info.scep = Some(parse_hex_u32(value, tag)?),
            "BDID" => info.bdid = Some(parse_hex_u32(value, tag)?),
            "IBFL" => info.ibfl = Some(parse_hex_u32(value, tag)?),
            "ECID" => {
                info.ecid = Some(
                    u64::from_str_radix(value, 16)
                        .map_err(|_| ErrorKind::DeviceSeemsInvalid(format!("ECID tag {value:?}")).error())?,
                )
            }
            "SRNM" => info.srnm = Some(value.to_string()),
            "IMEI" => info.imei = Some(value.to_string()),
            "SRTG" => info.srtg = Some(value.to_string()),
            _ => {}
        }
    }

    info.ap_nonce = find_nonce(serial, "NONC");
    info.sep_nonce = find_nonce(serial, "SNON");

    Ok(info)
}

fn parse_hex_u32(value: &str, tag: &str) -> Result<u32, Error>
{
    u32::from_str_radix(value, 16)
        .map_err(|_| ErrorKind::DeviceSeemsInvalid(format!("{tag} tag {value:?}")).error())
}

/// Locates `tag` immediately preceding a colon in `haystack`, requiring the character before the
/// tag to be a space (or the tag to start the string) so that e.g. `"XNONC:..."` does not match
/// `NONC`. Reads hex digit pairs from just after the colon (skipping one optional leading space,
/// as the wire format emits `"NONC: 0102"`) until the next space or end of string.
fn find_nonce(haystack: &str, tag: &str) -> Option<Vec<u8>>
{
    let needle = format!("{tag}:");
    let mut search_from = 0;

    while let Some(rel) = haystack[search_from..].find(&needle) {
        let start = search_from + rel;
        let preceded_by_space_or_start = start == 0 || haystack.as_bytes()[start - 1] == b' ';

        if preceded_by_space_or_start {
            let after_colon = start + needle.len();
            let rest = haystack[after_colon..].trim_start_matches(' ');
            let hex = rest.split(' ').next().unwrap_or("");
            return decode_hex_pairs(hex);
        }

        search_from = start + 1;
    }

    None
}

fn decode_hex_pairs(hex: &str) -> Option<Vec<u8>>
{
    if hex.is_empty() || hex.len() % 2 != 0 {
        return None;
    }

    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

/// Serializes a nonce buffer back to the upper-case hex-pair form the wire format uses, the
/// inverse of [`find_nonce`] (spec §8's round-trip law).
pub fn encode_nonce(nonce: &[u8]) -> String
{
    nonce.iter().map(|byte| format!("{byte:02X}")).collect()
}

/// Reads a 16-bit length-prefixed UTF-16LE string at `offset` in `buf`, as the KIS info response
/// embeds manufacturer/product/serial USB string descriptors.
fn read_length_prefixed_utf16(buf: &[u8], offset: usize) -> Result<String, Error>
{
    let bad = || ErrorKind::DeviceSeemsInvalid("KIS info descriptor string".to_string()).error();

    let len = *buf.get(offset).ok_or_else(bad)? as usize;
    let bytes = buf.get(offset + 1..offset + 1 + len).ok_or_else(bad)?;

    let units: Vec<u16> = bytes.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
    Ok(String::from_utf16_lossy(&units))
}

/// Offsets of the manufacturer, product, and serial string descriptors within a KIS info reply,
/// and the offset of the embedded nonce blob rendered as an iBoot-style tag string.
struct KisInfoLayout
{
    manufacturer_offset: usize,
    product_offset: usize,
    serial_offset: usize,
    nonce_text_offset: usize,
}

const KIS_INFO_LAYOUT: KisInfoLayout =
    KisInfoLayout { manufacturer_offset: 0, product_offset: 64, serial_offset: 128, nonce_text_offset: 192 };

/// Parses a KIS-mode info response: reads the embedded manufacturer/product/serial USB
/// descriptor strings, feeds the serial into [`parse_iboot_string`], then extracts nonces from the
/// trailing tag-string region using the same nonce scanner.
pub fn parse_kis_info_response(buf: &[u8]) -> Result<DeviceInfo, Error>
{
    let _manufacturer = read_length_prefixed_utf16(buf, KIS_INFO_LAYOUT.manufacturer_offset)?;
    let _product = read_length_prefixed_utf16(buf, KIS_INFO_LAYOUT.product_offset)?;
    let serial = read_length_prefixed_utf16(buf, KIS_INFO_LAYOUT.serial_offset)?;

    let mut info = parse_iboot_string(&serial)?;

    let nonce_text = String::from_utf8_lossy(buf.get(KIS_INFO_LAYOUT.nonce_text_offset..).unwrap_or(&[]));
    info.ap_nonce = find_nonce(&nonce_text, "NONC").or(info.ap_nonce);
    info.sep_nonce = find_nonce(&nonce_text, "SNON").or(info.sep_nonce);

    Ok(info)
}

#[cfg(test)]
mod tests
{
    use super::*;

    const SAMPLE: &str = "CPID:8010 CPRV:11 CPFM:03 SCEP:01 BDID:0E ECID:001122334455AABB IBFL:1C \
         SRNM:[ABCDE12345] IMEI:[012345678901234] SRTG:[iBoot-3401.0.0.1.16] NONC: 0102AABB SNON: DEADBEEF";

    #[test]
    fn scenario_1_parses_every_field()
    {
        let info = parse_iboot_string(SAMPLE).unwrap();
        assert_eq!(info.cpid, Some(0x8010));
        assert_eq!(info.cprv, Some(0x11));
        assert_eq!(info.cpfm, Some(0x03));
        assert_eq!(info.scep, Some(0x01));
        assert_eq!(info.bdid, Some(0x0E));
        assert_eq!(info.ecid, Some(0x0011_2233_4455_AABB));
        assert_eq!(info.ibfl, Some(0x1C));
        assert_eq!(info.srnm.as_deref(), Some("ABCDE12345"));
        assert_eq!(info.imei.as_deref(), Some("012345678901234"));
        assert_eq!(info.srtg.as_deref(), Some("iBoot-3401.0.0.1.16"));
        assert_eq!(info.ap_nonce, Some(vec![0x01, 0x02, 0xAA, 0xBB]));
        assert_eq!(info.sep_nonce, Some(vec![0xDE, 0xAD, 0xBE, 0xEF]));
    }

    #[test]
    fn absent_tags_leave_destination_empty()
    {
        let info = parse_iboot_string("CPID:8010 BDID:0E").unwrap();
        assert_eq!(info.cpid, Some(0x8010));
        assert_eq!(info.ecid, None);
        assert_eq!(info.srnm, None);
        assert_eq!(info.ap_nonce, None);
    }

    #[test]
    fn nonce_tag_requires_preceding_space()
    {
        // "XNONC:AABB" must not be mistaken for a NONC match.
        assert_eq!(find_nonce("XNONC:AABB", "NONC"), None);
        assert_eq!(find_nonce("FOO NONC:AABB", "NONC"), Some(vec![0xAA, 0xBB]));
    }

    #[test]
    fn nonce_round_trips_through_encode()
    {
        let original = find_nonce("NONC: deadbeef", "NONC").unwrap();
        assert_eq!(encode_nonce(&original), "DEADBEEF");
    }

    #[test]
    fn malformed_hex_int_tag_is_device_seems_invalid()
    {
        let err = parse_iboot_string("CPID:zzzz").unwrap_err();
        assert_eq!(err.code(), ErrorKind::DeviceSeemsInvalid(String::new()).code());
    }
}
