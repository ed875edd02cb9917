// MIT License - Copyright (c) 2026 Peter Wright
// LCN bus addresses

use std::fmt;

use serde::Serialize;

/// Segment id used on the wire for "the segment the gateway is attached to".
pub const LOCAL_SEGMENT: u8 = 0;

/// Physical segment id tagged onto status messages from the local segment.
pub const STATUS_SEGMENT: u8 = 4;

/// Highest segment id a segment coupler may report.
pub const MAX_SEGMENT_ID: u8 = 128;

/// Address of a module or group on the LCN bus.
///
/// Equality and hashing are structural. Segment 0 denotes the local segment;
/// module ids and group ids are distinguished by `is_group`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct LcnAddr {
    pub seg_id: u8,
    pub addr_id: u8,
    pub is_group: bool,
}

impl LcnAddr {
    pub const fn module(seg_id: u8, addr_id: u8) -> Self {
        Self {
            seg_id,
            addr_id,
            is_group: false,
        }
    }

    pub const fn group(seg_id: u8, addr_id: u8) -> Self {
        Self {
            seg_id,
            addr_id,
            is_group: true,
        }
    }

    /// Module ids span 1-254, group ids 3-254 (3 is the broadcast group).
    pub fn is_valid(&self) -> bool {
        if self.seg_id > MAX_SEGMENT_ID {
            return false;
        }
        if self.is_group {
            (3..=254).contains(&self.addr_id)
        } else {
            (1..=254).contains(&self.addr_id)
        }
    }

    /// Segment id as it must appear on the wire: the local segment becomes 0.
    pub fn physical_seg_id(&self, local_seg_id: u8) -> u8 {
        if self.seg_id == local_seg_id {
            LOCAL_SEGMENT
        } else {
            self.seg_id
        }
    }

    pub fn to_physical(self, local_seg_id: u8) -> Self {
        Self {
            seg_id: self.physical_seg_id(local_seg_id),
            ..self
        }
    }

    /// Map an address received from the bus back to its logical segment.
    pub fn from_physical(self, local_seg_id: u8) -> Self {
        let seg_id = match self.seg_id {
            LOCAL_SEGMENT | STATUS_SEGMENT => local_seg_id,
            other => other,
        };
        Self { seg_id, ..self }
    }

    /// Registry key: local segment aliases collapse onto segment 0.
    pub(crate) fn canonical(self, local_seg_id: u8) -> Self {
        if self.seg_id == STATUS_SEGMENT {
            return Self {
                seg_id: LOCAL_SEGMENT,
                ..self
            };
        }
        self.to_physical(local_seg_id)
    }
}

impl fmt::Display for LcnAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{:03}{:03}",
            if self.is_group { 'G' } else { 'M' },
            self.seg_id,
            self.addr_id
        )
    }
}
