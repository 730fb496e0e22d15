//! Device number decoding from the embedded pointer words

use crate::archive::makedev;
use crate::fs::InodeRecord;

/// Which embedded word carried the device number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEncoding {
    /// 8-bit major and minor in the first word
    Old,
    /// 12-bit major, 20-bit minor in the second word
    New,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceNumber {
    pub major: u32,
    pub minor: u32,
    pub encoding: DeviceEncoding,
}

impl DeviceNumber {
    pub fn from_inode(record: &InodeRecord) -> Self {
        let old = record.block[0];
        let new = record.block[1];

        if new != 0 {
            DeviceNumber {
                major: (new & 0x000f_ff00) >> 8,
                minor: (new & 0x0000_00ff) | ((new >> 12) & 0x000f_ff00),
                encoding: DeviceEncoding::New,
            }
        } else {
            DeviceNumber {
                major: (old >> 8) & 0xff,
                minor: old & 0xff,
                encoding: DeviceEncoding::Old,
            }
        }
    }

    /// Packed with the glibc `makedev` layout
    pub fn rdev(&self) -> u64 {
        makedev(self.major, self.minor)
    }
}
