//! Logical-to-physical block mapping for extent-mapped and indirect-mapped inodes

use byteorder::{ByteOrder, LittleEndian};

use super::inode::EXT4_EXTENTS_FL;
use crate::fs::common::BlockDevice;
use crate::fs::{FsError, InodeRecord};

const EXT4_EXT_MAGIC: u16 = 0xF30A;
const EXT_INIT_MAX_LEN: u16 = 32768;
const MAX_EXTENT_DEPTH: u16 = 5;

const DIRECT_BLOCKS: usize = 12;
const SINGLE_INDIRECT: usize = 12;
const DOUBLE_INDIRECT: usize = 13;
const TRIPLE_INDIRECT: usize = 14;

/// A run of contiguous blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub logical: u64,
    pub physical: u64,
    pub len: u64,
    /// Allocated but never written; reads as zeros
    pub uninit: bool,
}

impl Extent {
    pub fn contains(&self, logical: u64) -> bool {
        logical >= self.logical && logical < self.logical + self.len
    }
}

/// Walks extent trees and indirect block chains on one device
pub struct BlockMapper<'a> {
    device: &'a BlockDevice,
    block_size: u32,
    blocks_count: u64,
}

impl<'a> BlockMapper<'a> {
    pub fn new(device: &'a BlockDevice, block_size: u32, blocks_count: u64) -> Self {
        Self {
            device,
            block_size,
            blocks_count,
        }
    }

    /// Map every allocated block of `inode`, sorted by logical block
    pub fn map(&self, inode: &InodeRecord) -> Result<Vec<Extent>, FsError> {
        let mut extents = if inode.flags & EXT4_EXTENTS_FL != 0 {
            let root = inode.embedded_bytes();
            let mut out = Vec::new();
            self.walk_extent_node(&root, 0, MAX_EXTENT_DEPTH, &mut out)?;
            out
        } else {
            self.map_indirect(inode)?
        };
        extents.sort_by_key(|e| e.logical);
        Ok(extents)
    }

    fn read_block(&self, block: u64) -> Result<&'a [u8], FsError> {
        self.check_block(block, 1)?;
        self.device.read_block(block, self.block_size)
    }

    fn check_block(&self, block: u64, len: u64) -> Result<(), FsError> {
        if block == 0 || block.saturating_add(len) > self.blocks_count {
            return Err(FsError::corruption(
                block,
                format!("block run of {len} outside filesystem"),
            ));
        }
        Ok(())
    }

    // ---- Extent trees ----

    fn walk_extent_node(
        &self,
        node: &[u8],
        node_block: u64,
        depth_budget: u16,
        out: &mut Vec<Extent>,
    ) -> Result<(), FsError> {
        if node.len() < 12 {
            return Err(FsError::corruption(node_block, "extent node too short"));
        }
        let magic = LittleEndian::read_u16(&node[0..]);
        if magic != EXT4_EXT_MAGIC {
            return Err(FsError::corruption(
                node_block,
                format!("invalid extent magic 0x{magic:04X}"),
            ));
        }
        let entries = LittleEndian::read_u16(&node[2..]) as usize;
        let depth = LittleEndian::read_u16(&node[6..]);
        if depth > depth_budget {
            return Err(FsError::corruption(node_block, "extent tree too deep"));
        }
        if 12 + entries * 12 > node.len() {
            return Err(FsError::corruption(node_block, "extent entries overflow node"));
        }

        for i in 0..entries {
            let off = 12 + i * 12;
            let logical = LittleEndian::read_u32(&node[off..]) as u64;
            if depth == 0 {
                let raw_len = LittleEndian::read_u16(&node[off + 4..]);
                let start_hi = LittleEndian::read_u16(&node[off + 6..]) as u64;
                let start_lo = LittleEndian::read_u32(&node[off + 8..]) as u64;
                let (len, uninit) = if raw_len > EXT_INIT_MAX_LEN {
                    (raw_len - EXT_INIT_MAX_LEN, true)
                } else {
                    (raw_len, false)
                };
                let physical = (start_hi << 32) | start_lo;
                if len == 0 {
                    continue;
                }
                self.check_block(physical, len as u64)?;
                out.push(Extent {
                    logical,
                    physical,
                    len: len as u64,
                    uninit,
                });
            } else {
                let leaf_lo = LittleEndian::read_u32(&node[off + 4..]) as u64;
                let leaf_hi = LittleEndian::read_u16(&node[off + 8..]) as u64;
                let child = (leaf_hi << 32) | leaf_lo;
                let data = self.read_block(child)?;
                self.walk_extent_node(data, child, depth - 1, out)?;
            }
        }
        Ok(())
    }

    // ---- Indirect blocks ----

    fn map_indirect(&self, inode: &InodeRecord) -> Result<Vec<Extent>, FsError> {
        let mut runs = RunBuilder::default();

        for (logical, &ptr) in inode.block[..DIRECT_BLOCKS].iter().enumerate() {
            self.push_pointer(&mut runs, logical as u64, ptr as u64)?;
        }

        let per_block = (self.block_size / 4) as u64;
        let mut base = DIRECT_BLOCKS as u64;
        self.walk_indirect(&mut runs, inode.block[SINGLE_INDIRECT] as u64, 1, base)?;
        base += per_block;
        self.walk_indirect(&mut runs, inode.block[DOUBLE_INDIRECT] as u64, 2, base)?;
        base += per_block * per_block;
        self.walk_indirect(&mut runs, inode.block[TRIPLE_INDIRECT] as u64, 3, base)?;

        Ok(runs.finish())
    }

    fn walk_indirect(
        &self,
        runs: &mut RunBuilder,
        block: u64,
        level: u32,
        base: u64,
    ) -> Result<(), FsError> {
        if block == 0 {
            return Ok(());
        }
        let data = self.read_block(block)?;
        let per_block = (self.block_size / 4) as u64;
        let span = per_block.pow(level - 1);

        for i in 0..per_block {
            let ptr = LittleEndian::read_u32(&data[(i * 4) as usize..]) as u64;
            let logical = base + i * span;
            if level == 1 {
                self.push_pointer(runs, logical, ptr)?;
            } else {
                self.walk_indirect(runs, ptr, level - 1, logical)?;
            }
        }
        Ok(())
    }

    fn push_pointer(&self, runs: &mut RunBuilder, logical: u64, ptr: u64) -> Result<(), FsError> {
        if ptr == 0 {
            return Ok(());
        }
        self.check_block(ptr, 1)?;
        runs.push(logical, ptr);
        Ok(())
    }
}

/// Coalesces single block pointers into extents
#[derive(Default)]
struct RunBuilder {
    done: Vec<Extent>,
    current: Option<Extent>,
}

impl RunBuilder {
    fn push(&mut self, logical: u64, physical: u64) {
        if let Some(run) = self.current.as_mut() {
            if run.logical + run.len == logical && run.physical + run.len == physical {
                run.len += 1;
                return;
            }
        }
        if let Some(run) = self.current.take() {
            self.done.push(run);
        }
        self.current = Some(Extent {
            logical,
            physical,
            len: 1,
            uninit: false,
        });
    }

    fn finish(mut self) -> Vec<Extent> {
        if let Some(run) = self.current.take() {
            self.done.push(run);
        }
        self.done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BS: u32 = 1024;

    fn inode_with_words(words: &[(usize, u32)], flags: u32) -> InodeRecord {
        let mut inode = InodeRecord {
            mode: 0o100644,
            flags,
            ..Default::default()
        };
        for &(i, w) in words {
            inode.block[i] = w;
        }
        inode
    }

    #[test]
    fn test_direct_blocks_coalesce() {
        let device = BlockDevice::from_vec(vec![0u8; 64 * BS as usize]);
        let mapper = BlockMapper::new(&device, BS, 64);
        let inode = inode_with_words(&[(0, 20), (1, 21), (2, 22), (4, 30)], 0);

        let extents = mapper.map(&inode).unwrap();
        assert_eq!(
            extents,
            vec![
                Extent { logical: 0, physical: 20, len: 3, uninit: false },
                Extent { logical: 4, physical: 30, len: 1, uninit: false },
            ]
        );
    }

    #[test]
    fn test_single_indirect() {
        let mut image = vec![0u8; 64 * BS as usize];
        // Indirect block 40 points at 41 and 42
        let ind = 40 * BS as usize;
        LittleEndian::write_u32(&mut image[ind..], 41);
        LittleEndian::write_u32(&mut image[ind + 4..], 42);
        let device = BlockDevice::from_vec(image);
        let mapper = BlockMapper::new(&device, BS, 64);
        let inode = inode_with_words(&[(11, 10), (SINGLE_INDIRECT, 40)], 0);

        let extents = mapper.map(&inode).unwrap();
        assert_eq!(
            extents,
            vec![
                Extent { logical: 11, physical: 10, len: 1, uninit: false },
                Extent { logical: 12, physical: 41, len: 2, uninit: false },
            ]
        );
    }

    #[test]
    fn test_pointer_outside_filesystem() {
        let device = BlockDevice::from_vec(vec![0u8; 16 * BS as usize]);
        let mapper = BlockMapper::new(&device, BS, 16);
        let inode = inode_with_words(&[(0, 99)], 0);
        assert!(matches!(
            mapper.map(&inode),
            Err(FsError::Corruption { block: 99, .. })
        ));
    }

    fn extent_root(entries: &[(u32, u16, u32)], depth: u16) -> InodeRecord {
        let mut bytes = [0u8; 60];
        LittleEndian::write_u16(&mut bytes[0..], EXT4_EXT_MAGIC);
        LittleEndian::write_u16(&mut bytes[2..], entries.len() as u16);
        LittleEndian::write_u16(&mut bytes[4..], 4);
        LittleEndian::write_u16(&mut bytes[6..], depth);
        for (i, &(logical, len, start)) in entries.iter().enumerate() {
            let off = 12 + i * 12;
            LittleEndian::write_u32(&mut bytes[off..], logical);
            if depth == 0 {
                LittleEndian::write_u16(&mut bytes[off + 4..], len);
                LittleEndian::write_u32(&mut bytes[off + 8..], start);
            } else {
                LittleEndian::write_u32(&mut bytes[off + 4..], start);
            }
        }
        let mut inode = InodeRecord {
            mode: 0o100644,
            flags: EXT4_EXTENTS_FL,
            ..Default::default()
        };
        LittleEndian::read_u32_into(&bytes, &mut inode.block);
        inode
    }

    #[test]
    fn test_extent_leaf_in_inode() {
        let device = BlockDevice::from_vec(vec![0u8; 128 * BS as usize]);
        let mapper = BlockMapper::new(&device, BS, 128);
        let inode = extent_root(&[(3, 2, 70), (0, EXT_INIT_MAX_LEN + 3, 50)], 0);

        let extents = mapper.map(&inode).unwrap();
        assert_eq!(
            extents,
            vec![
                Extent { logical: 0, physical: 50, len: 3, uninit: true },
                Extent { logical: 3, physical: 70, len: 2, uninit: false },
            ]
        );
    }

    #[test]
    fn test_extent_index_node() {
        let mut image = vec![0u8; 128 * BS as usize];
        let leaf = 100 * BS as usize;
        LittleEndian::write_u16(&mut image[leaf..], EXT4_EXT_MAGIC);
        LittleEndian::write_u16(&mut image[leaf + 2..], 1);
        LittleEndian::write_u32(&mut image[leaf + 12..], 0);
        LittleEndian::write_u16(&mut image[leaf + 16..], 4);
        LittleEndian::write_u32(&mut image[leaf + 20..], 60);
        let device = BlockDevice::from_vec(image);
        let mapper = BlockMapper::new(&device, BS, 128);
        let inode = extent_root(&[(0, 0, 100)], 1);

        let extents = mapper.map(&inode).unwrap();
        assert_eq!(
            extents,
            vec![Extent { logical: 0, physical: 60, len: 4, uninit: false }]
        );
    }

    #[test]
    fn test_bad_extent_magic() {
        let device = BlockDevice::from_vec(vec![0u8; 16 * BS as usize]);
        let mapper = BlockMapper::new(&device, BS, 16);
        let inode = inode_with_words(&[(0, 5)], EXT4_EXTENTS_FL);
        assert!(mapper.map(&inode).is_err());
    }
}
