//! DMR identifier arithmetic.
//!
//! A DMR ID is a seven-digit decimal integer. A node ID extends it with an
//! optional two-digit ESSID suffix so one operator can run several hotspots:
//! `3200132` is a plain DMR ID, `320013201` is the same ID with ESSID 01.
//! A slot ID is a node ID with bit 31 set for physical slot 2, which keeps
//! both timeslots of a hotspot addressable in a single 32-bit word.

/// Lowest acceptable DMR ID, not including the ESSID suffix.
pub const LOW_DMRID: u32 = 1_000_000;

/// First DMR ID past the acceptable range.
pub const HIGH_DMRID: u32 = 8_000_000;

const SLOT_BIT: u32 = 0x8000_0000;

/// Strips the slot bit off a slot ID, leaving the node ID.
pub fn node_of(slotid: u32) -> u32 {
    slotid & !SLOT_BIT
}

/// Slot index (0 or 1) encoded in a slot ID.
pub fn slot_index(slotid: u32) -> usize {
    ((slotid & SLOT_BIT) != 0) as usize
}

/// Builds a slot ID from a node ID and a slot index.
pub fn slot_id(nodeid: u32, slot: usize) -> u32 {
    if slot == 1 {
        nodeid | SLOT_BIT
    } else {
        nodeid
    }
}

/// Splits a node ID into `(dmrid, essid)`.
///
/// Values that fit in 24 bits carry no ESSID; larger values are the DMR ID
/// scaled by 100 plus a two-digit ESSID.
pub fn split(nodeid: u32) -> (u32, u32) {
    if nodeid > 0xFF_FFFF {
        (nodeid / 100, nodeid % 100)
    } else {
        (nodeid, 0)
    }
}

/// Whether a DMR ID falls in `[LOW_DMRID, HIGH_DMRID)`.
pub fn dmrid_in_range(dmrid: u32) -> bool {
    (LOW_DMRID..HIGH_DMRID).contains(&dmrid)
}

/// Log-friendly `nodeid:slot` form, slots shown as 1 and 2.
pub fn display(slotid: u32) -> String {
    format!("{}:{}", node_of(slotid), slot_index(slotid) + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slotid_round_trip() {
        for nodeid in [3_200_132u32, 320_013_299, LOW_DMRID, HIGH_DMRID - 1] {
            for slot in 0..2 {
                let slotid = slot_id(nodeid, slot);
                assert_eq!(node_of(slotid), nodeid);
                assert_eq!(slot_index(slotid), slot);
            }
        }
    }

    #[test]
    fn test_slot_bit() {
        assert_eq!(slot_id(3_200_132, 0), 3_200_132);
        assert_eq!(slot_id(3_200_132, 1), 3_200_132 | 0x8000_0000);
        assert_eq!(slot_index(3_200_132), 0);
        assert_eq!(slot_index(3_200_132 | 0x8000_0000), 1);
    }

    #[test]
    fn test_split_without_essid() {
        assert_eq!(split(3_200_132), (3_200_132, 0));
        assert_eq!(split(LOW_DMRID), (LOW_DMRID, 0));
        assert_eq!(split(HIGH_DMRID - 1), (HIGH_DMRID - 1, 0));
    }

    #[test]
    fn test_split_with_essid() {
        assert_eq!(split(320_013_201), (3_200_132, 1));
        assert_eq!(split(320_013_299), (3_200_132, 99));
        // ESSID 100 cannot be encoded: it rolls into the next DMR ID
        assert_eq!(split(3_200_132 * 100 + 100), (3_200_133, 0));
    }

    #[test]
    fn test_dmrid_bounds() {
        assert!(!dmrid_in_range(LOW_DMRID - 1));
        assert!(dmrid_in_range(LOW_DMRID));
        assert!(dmrid_in_range(HIGH_DMRID - 1));
        assert!(!dmrid_in_range(HIGH_DMRID));
    }

    #[test]
    fn test_display() {
        assert_eq!(display(3_200_132), "3200132:1");
        assert_eq!(display(3_200_132 | 0x8000_0000), "3200132:2");
    }
}
