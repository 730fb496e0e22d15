//! On-disk inode decoding

use byteorder::{ByteOrder, LittleEndian};

use crate::fs::{FileKind, FsError, InodeRecord, EMBEDDED_WORDS};

// i_flags
pub const EXT4_EXTENTS_FL: u32 = 0x0008_0000;
pub const EXT4_INLINE_DATA_FL: u32 = 0x1000_0000;

const GOOD_OLD_INODE_SIZE: usize = 128;

/// Decode a raw inode slot
pub fn parse_inode(buf: &[u8]) -> Result<InodeRecord, FsError> {
    if buf.len() < GOOD_OLD_INODE_SIZE {
        return Err(FsError::Format(format!(
            "inode slot too small: {} bytes",
            buf.len()
        )));
    }

    let mode = LittleEndian::read_u16(&buf[0x00..]);
    let uid_lo = LittleEndian::read_u16(&buf[0x02..]) as u32;
    let size_lo = LittleEndian::read_u32(&buf[0x04..]) as u64;
    let atime = LittleEndian::read_i32(&buf[0x08..]);
    let ctime = LittleEndian::read_i32(&buf[0x0C..]);
    let mtime = LittleEndian::read_i32(&buf[0x10..]);
    let dtime = LittleEndian::read_u32(&buf[0x14..]);
    let gid_lo = LittleEndian::read_u16(&buf[0x18..]) as u32;
    let links_count = LittleEndian::read_u16(&buf[0x1A..]);
    let blocks_lo = LittleEndian::read_u32(&buf[0x1C..]) as u64;
    let flags = LittleEndian::read_u32(&buf[0x20..]);

    let mut block = [0u32; EMBEDDED_WORDS];
    LittleEndian::read_u32_into(&buf[0x28..0x64], &mut block);

    let file_acl_lo = LittleEndian::read_u32(&buf[0x68..]) as u64;
    let size_hi = LittleEndian::read_u32(&buf[0x6C..]) as u64;
    let blocks_hi = LittleEndian::read_u16(&buf[0x74..]) as u64;
    let file_acl_hi = LittleEndian::read_u16(&buf[0x76..]) as u64;
    let uid_hi = LittleEndian::read_u16(&buf[0x78..]) as u32;
    let gid_hi = LittleEndian::read_u16(&buf[0x7A..]) as u32;

    // i_size_high doubles as i_dir_acl on old directories
    let size = if FileKind::from_mode(mode) == Some(FileKind::RegularFile) {
        (size_hi << 32) | size_lo
    } else {
        size_lo
    };

    let extra = ExtraTimes::parse(buf);

    Ok(InodeRecord {
        mode,
        uid: (uid_hi << 16) | uid_lo,
        gid: (gid_hi << 16) | gid_lo,
        size,
        links_count,
        atime: extend_time(atime, extra.atime),
        ctime: extend_time(ctime, extra.ctime),
        mtime: extend_time(mtime, extra.mtime),
        dtime,
        flags,
        sectors: (blocks_hi << 32) | blocks_lo,
        file_acl: (file_acl_hi << 32) | file_acl_lo,
        block,
    })
}

/// Offset of the in-inode extended attribute area, if the slot has one
pub fn inline_xattr_offset(buf: &[u8]) -> Option<usize> {
    if buf.len() <= GOOD_OLD_INODE_SIZE + 4 {
        return None;
    }
    let extra_isize = LittleEndian::read_u16(&buf[0x80..]) as usize;
    let offset = GOOD_OLD_INODE_SIZE + extra_isize;
    if extra_isize % 4 != 0 || offset + 4 > buf.len() {
        return None;
    }
    Some(offset)
}

#[derive(Default)]
struct ExtraTimes {
    ctime: Option<u32>,
    mtime: Option<u32>,
    atime: Option<u32>,
}

impl ExtraTimes {
    fn parse(buf: &[u8]) -> Self {
        if buf.len() <= GOOD_OLD_INODE_SIZE + 2 {
            return Self::default();
        }
        let extra_isize = LittleEndian::read_u16(&buf[0x80..]) as usize;
        let end = GOOD_OLD_INODE_SIZE + extra_isize;
        let field = |offset: usize| {
            (offset + 4 <= end && offset + 4 <= buf.len())
                .then(|| LittleEndian::read_u32(&buf[offset..]))
        };
        ExtraTimes {
            ctime: field(0x84),
            mtime: field(0x88),
            atime: field(0x8C),
        }
    }
}

/// Combine a signed 32-bit timestamp with the epoch bits of its extra field
fn extend_time(seconds: i32, extra: Option<u32>) -> i64 {
    let epoch = extra.map(|e| (e & 0x3) as i64).unwrap_or(0);
    seconds as i64 + (epoch << 32)
}
