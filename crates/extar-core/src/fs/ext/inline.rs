//! Inline data: content kept in `i_block` and the `system.data` attribute

use byteorder::{ByteOrder, LittleEndian};

use super::inode::inline_xattr_offset;

const XATTR_MAGIC: u32 = 0xEA02_0000;
const XATTR_INDEX_SYSTEM: u8 = 7;
const XATTR_ENTRY_HEADER: usize = 16;

/// Value of the in-inode `system.data` attribute, if present
pub fn system_data(raw_inode: &[u8]) -> Option<&[u8]> {
    let start = inline_xattr_offset(raw_inode)?;
    if LittleEndian::read_u32(&raw_inode[start..]) != XATTR_MAGIC {
        return None;
    }

    // Entries and value offsets are both relative to the first entry
    let base = start + 4;
    let mut off = base;
    while off + XATTR_ENTRY_HEADER <= raw_inode.len() {
        if LittleEndian::read_u32(&raw_inode[off..]) == 0 {
            break;
        }
        let name_len = raw_inode[off] as usize;
        let name_index = raw_inode[off + 1];
        let value_offs = LittleEndian::read_u16(&raw_inode[off + 2..]) as usize;
        let value_inum = LittleEndian::read_u32(&raw_inode[off + 4..]);
        let value_size = LittleEndian::read_u32(&raw_inode[off + 8..]) as usize;

        let name_start = off + XATTR_ENTRY_HEADER;
        let name_end = name_start + name_len;
        if name_end > raw_inode.len() {
            return None;
        }

        if name_index == XATTR_INDEX_SYSTEM
            && &raw_inode[name_start..name_end] == b"data"
            && value_inum == 0
        {
            let value_start = base + value_offs;
            let value_end = value_start + value_size;
            return raw_inode.get(value_start..value_end);
        }

        off += (XATTR_ENTRY_HEADER + name_len + 3) & !3;
    }
    None
}

/// Full inline content: the embedded words followed by `system.data`
pub fn inline_content(embedded: &[u8], raw_inode: &[u8], size: u64) -> Vec<u8> {
    let mut data = embedded.to_vec();
    if let Some(extra) = system_data(raw_inode) {
        data.extend_from_slice(extra);
    }
    data.truncate(size.min(data.len() as u64) as usize);
    data
}

#[cfg(test)]
pub(crate) fn write_system_data(raw_inode: &mut [u8], value: &[u8]) {
    LittleEndian::write_u16(&mut raw_inode[0x80..], 32);
    let start = 128 + 32;
    LittleEndian::write_u32(&mut raw_inode[start..], XATTR_MAGIC);
    let entry = start + 4;
    raw_inode[entry] = 4;
    raw_inode[entry + 1] = XATTR_INDEX_SYSTEM;
    // Value placed after the entry and the 4-byte terminator
    let value_offs = XATTR_ENTRY_HEADER + 4 + 4;
    LittleEndian::write_u16(&mut raw_inode[entry + 2..], value_offs as u16);
    LittleEndian::write_u32(&mut raw_inode[entry + 8..], value.len() as u32);
    raw_inode[entry + 16..entry + 20].copy_from_slice(b"data");
    let value_start = entry + value_offs;
    raw_inode[value_start..value_start + value.len()].copy_from_slice(value);
}
