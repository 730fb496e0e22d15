//! Linear directory block decoding
//!
//! Every directory block is a chain of `ext2_dir_entry_2` records:
//! inode (4), rec_len (2), name_len (1), file_type (1), name.
//! Unused slots, htree interior nodes and checksum tails all carry inode 0
//! and are skipped.

use byteorder::{ByteOrder, LittleEndian};

use crate::fs::{FsError, RawDirEntry};

const DIRENT_HEADER: usize = 8;

/// Record length as stored, widened for 64 KiB blocks
///
/// A 16-bit field cannot hold 65536, so large-block filesystems store a
/// whole-block record as 65535 or 0 and fold bits 16-17 into the low two bits.
fn decode_rec_len(raw: u16, block_size: usize) -> usize {
    let len = raw as usize;
    if block_size < 65536 {
        len
    } else if raw == u16::MAX || raw == 0 {
        block_size
    } else {
        (len & 65532) | ((len & 3) << 16)
    }
}

/// Decode the used records of one directory block
///
/// `block` only labels corruption errors.
pub fn parse_dir_block(
    data: &[u8],
    has_filetype: bool,
    block: u64,
) -> Result<Vec<RawDirEntry>, FsError> {
    let mut entries = Vec::new();
    let mut offset = 0;

    while offset + DIRENT_HEADER <= data.len() {
        let inode = LittleEndian::read_u32(&data[offset..]);
        let rec_len = decode_rec_len(LittleEndian::read_u16(&data[offset + 4..]), data.len());
        let name_len = data[offset + 6] as usize;
        let file_type = if has_filetype { data[offset + 7] } else { 0 };

        if rec_len < DIRENT_HEADER || rec_len % 4 != 0 || offset + rec_len > data.len() {
            return Err(FsError::corruption(
                block,
                format!("bad rec_len {rec_len} at offset {offset}"),
            ));
        }
        if inode != 0 && DIRENT_HEADER + name_len > rec_len {
            return Err(FsError::corruption(
                block,
                format!("name_len {name_len} exceeds rec_len {rec_len} at offset {offset}"),
            ));
        }

        if inode != 0 {
            let name_start = offset + DIRENT_HEADER;
            entries.push(RawDirEntry {
                inode,
                name: data[name_start..name_start + name_len].to_vec(),
                file_type,
            });
        }

        offset += rec_len;
    }

    Ok(entries)
}

#[cfg(test)]
pub(crate) fn write_dir_entry(
    buf: &mut [u8],
    offset: usize,
    inode: u32,
    name: &[u8],
    ft: u8,
    rec_len: usize,
) {
    LittleEndian::write_u32(&mut buf[offset..], inode);
    LittleEndian::write_u16(&mut buf[offset + 4..], rec_len as u16);
    buf[offset + 6] = name.len() as u8;
    buf[offset + 7] = ft;
    buf[offset + 8..offset + 8 + name.len()].copy_from_slice(name);
}
