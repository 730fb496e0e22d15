//! ext2/3/4 superblock and block group descriptors

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use std::io::Cursor;

use crate::fs::FsError;

/// Byte offset of the primary superblock
pub const SUPERBLOCK_OFFSET: u64 = 1024;
pub const SUPERBLOCK_SIZE: usize = 1024;

pub const EXT_MAGIC: u16 = 0xEF53;

// s_feature_compat
pub const COMPAT_HAS_JOURNAL: u32 = 0x0004;

// s_feature_incompat
pub const INCOMPAT_FILETYPE: u32 = 0x0002;
pub const INCOMPAT_RECOVER: u32 = 0x0004;
pub const INCOMPAT_JOURNAL_DEV: u32 = 0x0008;
pub const INCOMPAT_META_BG: u32 = 0x0010;
pub const INCOMPAT_EXTENTS: u32 = 0x0040;
pub const INCOMPAT_64BIT: u32 = 0x0080;
pub const INCOMPAT_FLEX_BG: u32 = 0x0200;
pub const INCOMPAT_INLINE_DATA: u32 = 0x8000;

// s_feature_ro_compat
pub const RO_COMPAT_GDT_CSUM: u32 = 0x0010;
pub const RO_COMPAT_METADATA_CSUM: u32 = 0x0400;

// bg_flags
pub const BG_INODE_UNINIT: u16 = 0x0001;

const GOOD_OLD_INODE_SIZE: u16 = 128;
const GOOD_OLD_FIRST_INO: u32 = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtVersion {
    Ext2,
    Ext3,
    Ext4,
}

impl std::fmt::Display for ExtVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtVersion::Ext2 => write!(f, "ext2"),
            ExtVersion::Ext3 => write!(f, "ext3"),
            ExtVersion::Ext4 => write!(f, "ext4"),
        }
    }
}

/// Parsed superblock fields the reader relies on
#[derive(Debug, Clone)]
pub struct Superblock {
    pub inodes_count: u32,
    pub blocks_count: u64,
    pub first_data_block: u32,
    pub block_size: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub rev_level: u32,
    pub first_ino: u32,
    pub inode_size: u16,
    pub feature_compat: u32,
    pub feature_incompat: u32,
    pub feature_ro_compat: u32,
    pub uuid: [u8; 16],
    pub volume_name: String,
    pub desc_size: u16,
}

impl Superblock {
    /// Parse the superblock from its 1024 raw bytes
    pub fn parse(data: &[u8]) -> Result<Self, FsError> {
        if data.len() < SUPERBLOCK_SIZE {
            return Err(FsError::Format("insufficient data for ext superblock".into()));
        }

        let magic = LittleEndian::read_u16(&data[0x38..]);
        if magic != EXT_MAGIC {
            return Err(FsError::Format(format!(
                "invalid ext magic number: 0x{magic:04X}"
            )));
        }

        let mut cursor = Cursor::new(data);
        let inodes_count = cursor.read_u32::<LittleEndian>()?;
        let blocks_count_lo = cursor.read_u32::<LittleEndian>()?;

        cursor.set_position(0x14);
        let first_data_block = cursor.read_u32::<LittleEndian>()?;
        let log_block_size = cursor.read_u32::<LittleEndian>()?;

        cursor.set_position(0x20);
        let blocks_per_group = cursor.read_u32::<LittleEndian>()?;
        cursor.set_position(0x28);
        let inodes_per_group = cursor.read_u32::<LittleEndian>()?;

        cursor.set_position(0x4C);
        let rev_level = cursor.read_u32::<LittleEndian>()?;

        cursor.set_position(0x54);
        let first_ino = cursor.read_u32::<LittleEndian>()?;
        let inode_size = cursor.read_u16::<LittleEndian>()?;

        cursor.set_position(0x5C);
        let feature_compat = cursor.read_u32::<LittleEndian>()?;
        let feature_incompat = cursor.read_u32::<LittleEndian>()?;
        let feature_ro_compat = cursor.read_u32::<LittleEndian>()?;

        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&data[0x68..0x78]);

        let label = &data[0x78..0x88];
        let label_end = label.iter().position(|&b| b == 0).unwrap_or(label.len());
        let volume_name = String::from_utf8_lossy(&label[..label_end]).trim().to_string();

        let desc_size_raw = LittleEndian::read_u16(&data[0xFE..]);
        let is_64bit = feature_incompat & INCOMPAT_64BIT != 0;
        let desc_size = if is_64bit { desc_size_raw.max(64) } else { 32 };

        let blocks_count = if is_64bit {
            let hi = LittleEndian::read_u32(&data[0x150..]) as u64;
            (hi << 32) | blocks_count_lo as u64
        } else {
            blocks_count_lo as u64
        };

        if log_block_size > 6 {
            return Err(FsError::Format(format!(
                "invalid block size exponent {log_block_size}"
            )));
        }
        let block_size = 1024u32 << log_block_size;

        // Revision 0 filesystems have fixed inode geometry
        let (first_ino, inode_size) = if rev_level == 0 {
            (GOOD_OLD_FIRST_INO, GOOD_OLD_INODE_SIZE)
        } else {
            (first_ino, inode_size)
        };

        if blocks_per_group == 0 || inodes_per_group == 0 || inodes_count == 0 {
            return Err(FsError::Format("zero group geometry".into()));
        }
        if inode_size < GOOD_OLD_INODE_SIZE
            || !inode_size.is_power_of_two()
            || inode_size as u32 > block_size
        {
            return Err(FsError::Format(format!("invalid inode size {inode_size}")));
        }
        if (first_data_block as u64) >= blocks_count {
            return Err(FsError::Format("first data block beyond block count".into()));
        }

        Ok(Superblock {
            inodes_count,
            blocks_count,
            first_data_block,
            block_size,
            blocks_per_group,
            inodes_per_group,
            rev_level,
            first_ino,
            inode_size,
            feature_compat,
            feature_incompat,
            feature_ro_compat,
            uuid,
            volume_name,
            desc_size,
        })
    }

    pub fn group_count(&self) -> u32 {
        let data_blocks = self.blocks_count - self.first_data_block as u64;
        data_blocks.div_ceil(self.blocks_per_group as u64) as u32
    }

    pub fn has_incompat(&self, flag: u32) -> bool {
        self.feature_incompat & flag != 0
    }

    pub fn has_ro_compat(&self, flag: u32) -> bool {
        self.feature_ro_compat & flag != 0
    }

    /// Group descriptors carry checksums and honour the uninit flags
    pub fn has_group_checksums(&self) -> bool {
        self.has_ro_compat(RO_COMPAT_GDT_CSUM | RO_COMPAT_METADATA_CSUM)
    }

    pub fn version(&self) -> ExtVersion {
        if self.has_incompat(INCOMPAT_EXTENTS | INCOMPAT_64BIT | INCOMPAT_FLEX_BG) {
            ExtVersion::Ext4
        } else if self.feature_compat & COMPAT_HAS_JOURNAL != 0 {
            ExtVersion::Ext3
        } else {
            ExtVersion::Ext2
        }
    }

    /// Block holding the first group descriptor
    pub fn descriptor_table_block(&self) -> u64 {
        self.first_data_block as u64 + 1
    }

    pub fn uuid_string(&self) -> String {
        let u = &self.uuid;
        format!(
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            u[0], u[1], u[2], u[3], u[4], u[5], u[6], u[7],
            u[8], u[9], u[10], u[11], u[12], u[13], u[14], u[15]
        )
    }
}

/// Block group descriptor
#[derive(Debug, Clone)]
pub struct GroupDescriptor {
    pub block_bitmap: u64,
    pub inode_bitmap: u64,
    pub inode_table: u64,
    pub flags: u16,
    pub itable_unused: u32,
}

impl GroupDescriptor {
    /// Parse one descriptor of `desc_size` bytes
    pub fn parse(d: &[u8], desc_size: u16) -> Result<Self, FsError> {
        if d.len() < desc_size as usize || d.len() < 32 {
            return Err(FsError::Format("truncated group descriptor".into()));
        }

        let mut block_bitmap = LittleEndian::read_u32(&d[0x00..]) as u64;
        let mut inode_bitmap = LittleEndian::read_u32(&d[0x04..]) as u64;
        let mut inode_table = LittleEndian::read_u32(&d[0x08..]) as u64;
        let flags = LittleEndian::read_u16(&d[0x12..]);
        let mut itable_unused = LittleEndian::read_u16(&d[0x1C..]) as u32;

        if desc_size >= 64 {
            block_bitmap |= (LittleEndian::read_u32(&d[0x20..]) as u64) << 32;
            inode_bitmap |= (LittleEndian::read_u32(&d[0x24..]) as u64) << 32;
            inode_table |= (LittleEndian::read_u32(&d[0x28..]) as u64) << 32;
            itable_unused |= (LittleEndian::read_u16(&d[0x32..]) as u32) << 16;
        }

        Ok(GroupDescriptor {
            block_bitmap,
            inode_bitmap,
            inode_table,
            flags,
            itable_unused,
        })
    }
}
