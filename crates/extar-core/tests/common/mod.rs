//! Builds small single-group ext2 images for integration tests.
//!
//! Layout with 1 KiB blocks: superblock in block 1, descriptors in 2,
//! block bitmap 3, inode bitmap 4, inode table 5..21, data from 21.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io::Write;

use byteorder::{ByteOrder, LittleEndian};
use tempfile::NamedTempFile;

pub const BLOCK_SIZE: usize = 1024;
pub const ROOT: u32 = 2;

const INODES: u32 = 128;
const INODE_SIZE: usize = 128;
const INODE_TABLE: u32 = 5;
const FIRST_DATA: u32 = INODE_TABLE + (INODES as usize * INODE_SIZE / BLOCK_SIZE) as u32;
const DIRECT: usize = 12;

pub const ATIME: u32 = 1_600_000_000;
pub const CTIME: u32 = 1_650_000_000;
pub const MTIME: u32 = 1_700_000_000;

const INCOMPAT_FILETYPE: u32 = 0x0002;
const INCOMPAT_RECOVER: u32 = 0x0004;

#[derive(Clone, Default)]
struct TestInode {
    mode: u16,
    uid: u16,
    gid: u16,
    size: u32,
    links: u16,
    sectors: u32,
    block: [u32; 15],
}

pub struct ImageBuilder {
    data: Vec<u8>,
    inodes: BTreeMap<u32, TestInode>,
    dirs: BTreeMap<u32, Vec<(u32, Vec<u8>, u8)>>,
    next_ino: u32,
    next_block: u32,
    incompat: u32,
}

impl ImageBuilder {
    pub fn new() -> Self {
        let mut builder = Self {
            data: Vec::new(),
            inodes: BTreeMap::new(),
            dirs: BTreeMap::new(),
            next_ino: 11,
            next_block: FIRST_DATA,
            incompat: INCOMPAT_FILETYPE,
        };
        builder.inodes.insert(
            ROOT,
            TestInode {
                mode: 0o040755,
                links: 2,
                ..Default::default()
            },
        );
        builder.dirs.insert(
            ROOT,
            vec![(ROOT, b".".to_vec(), 2), (ROOT, b"..".to_vec(), 2)],
        );
        builder
    }

    pub fn needs_recovery(&mut self) -> &mut Self {
        self.incompat |= INCOMPAT_RECOVER;
        self
    }

    fn allocate_inode(&mut self, parent: u32, name: &[u8], ft: u8, inode: TestInode) -> u32 {
        let ino = self.next_ino;
        assert!(ino <= INODES, "test image out of inodes");
        self.next_ino += 1;
        self.inodes.insert(ino, inode);
        self.add_entry(parent, name, ino, ft);
        ino
    }

    fn add_entry(&mut self, parent: u32, name: &[u8], ino: u32, ft: u8) {
        self.dirs
            .get_mut(&parent)
            .expect("parent is not a directory")
            .push((ino, name.to_vec(), ft));
    }

    fn allocate_block(&mut self, content: &[u8]) -> u32 {
        let block = self.next_block;
        self.next_block += 1;
        let start = block as usize * BLOCK_SIZE;
        if self.data.len() < start + BLOCK_SIZE {
            self.data.resize(start + BLOCK_SIZE, 0);
        }
        self.data[start..start + content.len()].copy_from_slice(content);
        block
    }

    pub fn mkdir(&mut self, parent: u32, name: &str) -> u32 {
        let ino = self.allocate_inode(
            parent,
            name.as_bytes(),
            2,
            TestInode {
                mode: 0o040755,
                links: 2,
                ..Default::default()
            },
        );
        self.dirs
            .insert(ino, vec![(ino, b".".to_vec(), 2), (parent, b"..".to_vec(), 2)]);
        if let Some(p) = self.inodes.get_mut(&parent) {
            p.links += 1;
        }
        ino
    }

    /// Regular file with direct and, past 12 blocks, single-indirect pointers
    pub fn file(&mut self, parent: u32, name: &str, content: &[u8]) -> u32 {
        self.file_with_mode(parent, name, content, 0o100644)
    }

    pub fn file_with_mode(&mut self, parent: u32, name: &str, content: &[u8], mode: u16) -> u32 {
        let mut inode = TestInode {
            mode,
            uid: 1000,
            gid: 100,
            size: content.len() as u32,
            links: 1,
            ..Default::default()
        };

        let blocks: Vec<u32> = content
            .chunks(BLOCK_SIZE)
            .map(|chunk| self.allocate_block(chunk))
            .collect();
        let per_indirect = BLOCK_SIZE / 4;
        assert!(blocks.len() <= DIRECT + per_indirect, "file too large for test image");

        for (slot, &block) in inode.block.iter_mut().zip(blocks.iter().take(DIRECT)) {
            *slot = block;
        }
        let mut allocated = blocks.len() as u32;
        if blocks.len() > DIRECT {
            let mut table = vec![0u8; BLOCK_SIZE];
            for (i, &block) in blocks[DIRECT..].iter().enumerate() {
                LittleEndian::write_u32(&mut table[i * 4..], block);
            }
            inode.block[DIRECT] = self.allocate_block(&table);
            allocated += 1;
        }
        inode.sectors = allocated * (BLOCK_SIZE / 512) as u32;

        self.allocate_inode(parent, name.as_bytes(), 1, inode)
    }

    /// Another name for an existing inode
    pub fn link(&mut self, parent: u32, name: &str, ino: u32) {
        self.add_entry(parent, name.as_bytes(), ino, 1);
        if let Some(inode) = self.inodes.get_mut(&ino) {
            inode.links += 1;
        }
    }

    /// Fast symlink below 60 bytes, otherwise one data block
    pub fn symlink(&mut self, parent: u32, name: &str, target: &str) -> u32 {
        let target = target.as_bytes();
        let mut inode = TestInode {
            mode: 0o120777,
            size: target.len() as u32,
            links: 1,
            ..Default::default()
        };
        if target.len() < 60 {
            let mut raw = [0u8; 60];
            raw[..target.len()].copy_from_slice(target);
            LittleEndian::read_u32_into(&raw, &mut inode.block);
        } else {
            inode.block[0] = self.allocate_block(target);
            inode.sectors = (BLOCK_SIZE / 512) as u32;
        }
        self.allocate_inode(parent, name.as_bytes(), 7, inode)
    }

    /// Character or block device; small numbers use the old encoding
    pub fn device(&mut self, parent: u32, name: &str, mode: u16, major: u32, minor: u32) -> u32 {
        let mut inode = TestInode {
            mode,
            links: 1,
            ..Default::default()
        };
        if major < 256 && minor < 256 {
            inode.block[0] = (major << 8) | minor;
        } else {
            inode.block[1] = (minor & 0xff) | (major << 8) | ((minor & !0xff) << 12);
        }
        let ft = if mode & 0o170000 == 0o060000 { 4 } else { 3 };
        self.allocate_inode(parent, name.as_bytes(), ft, inode)
    }

    pub fn fifo(&mut self, parent: u32, name: &str) -> u32 {
        self.allocate_inode(
            parent,
            name.as_bytes(),
            5,
            TestInode {
                mode: 0o010644,
                links: 1,
                ..Default::default()
            },
        )
    }

    fn write_directories(&mut self) {
        let dirs = std::mem::take(&mut self.dirs);
        for (ino, entries) in &dirs {
            let mut blocks = vec![vec![0u8; BLOCK_SIZE]];
            let mut offset = 0;
            let mut last: Option<usize> = None;

            for (child, name, ft) in entries {
                let needed = (8 + name.len() + 3) & !3;
                if offset + needed > BLOCK_SIZE {
                    // Stretch the previous record to the end of its block
                    if let Some(prev) = last {
                        let block = blocks.last_mut().expect("block");
                        LittleEndian::write_u16(&mut block[prev + 4..], (BLOCK_SIZE - prev) as u16);
                    }
                    blocks.push(vec![0u8; BLOCK_SIZE]);
                    offset = 0;
                }
                let block = blocks.last_mut().expect("block");
                LittleEndian::write_u32(&mut block[offset..], *child);
                LittleEndian::write_u16(&mut block[offset + 4..], needed as u16);
                block[offset + 6] = name.len() as u8;
                block[offset + 7] = *ft;
                block[offset + 8..offset + 8 + name.len()].copy_from_slice(name);
                last = Some(offset);
                offset += needed;
            }
            if let Some(prev) = last {
                let block = blocks.last_mut().expect("block");
                LittleEndian::write_u16(&mut block[prev + 4..], (BLOCK_SIZE - prev) as u16);
            }

            assert!(blocks.len() <= DIRECT, "directory too large for test image");
            let numbers: Vec<u32> = blocks.iter().map(|b| self.allocate_block(b)).collect();
            let inode = self.inodes.get_mut(ino).expect("directory inode");
            for (slot, n) in inode.block.iter_mut().zip(&numbers) {
                *slot = *n;
            }
            inode.size = (numbers.len() * BLOCK_SIZE) as u32;
            inode.sectors = (numbers.len() * BLOCK_SIZE / 512) as u32;
        }
        self.dirs = dirs;
    }

    pub fn build(&mut self) -> Vec<u8> {
        self.write_directories();

        let blocks_count = (self.next_block + 8).max(64);
        let mut image = std::mem::take(&mut self.data);
        image.resize(blocks_count as usize * BLOCK_SIZE, 0);

        let sb = &mut image[1024..2048];
        LittleEndian::write_u32(&mut sb[0x00..], INODES);
        LittleEndian::write_u32(&mut sb[0x04..], blocks_count);
        LittleEndian::write_u32(&mut sb[0x14..], 1); // first data block
        LittleEndian::write_u32(&mut sb[0x18..], 0); // 1 KiB blocks
        LittleEndian::write_u32(&mut sb[0x20..], 8192);
        LittleEndian::write_u32(&mut sb[0x28..], INODES);
        LittleEndian::write_u16(&mut sb[0x38..], 0xEF53);
        LittleEndian::write_u32(&mut sb[0x4C..], 1); // dynamic revision
        LittleEndian::write_u32(&mut sb[0x54..], 11);
        LittleEndian::write_u16(&mut sb[0x58..], INODE_SIZE as u16);
        LittleEndian::write_u32(&mut sb[0x60..], self.incompat);
        sb[0x78..0x80].copy_from_slice(b"testfs\0\0");

        let gd = &mut image[2 * BLOCK_SIZE..2 * BLOCK_SIZE + 32];
        LittleEndian::write_u32(&mut gd[0x00..], 3);
        LittleEndian::write_u32(&mut gd[0x04..], 4);
        LittleEndian::write_u32(&mut gd[0x08..], INODE_TABLE);

        for block in 0..self.next_block as usize {
            image[3 * BLOCK_SIZE + block / 8] |= 1 << (block % 8);
        }
        // Reserved inodes are always marked in use
        for ino in (1..=10).chain(self.inodes.keys().copied()) {
            let bit = (ino - 1) as usize;
            image[4 * BLOCK_SIZE + bit / 8] |= 1 << (bit % 8);
        }

        for (ino, inode) in &self.inodes {
            let off = INODE_TABLE as usize * BLOCK_SIZE + (*ino as usize - 1) * INODE_SIZE;
            let raw = &mut image[off..off + INODE_SIZE];
            LittleEndian::write_u16(&mut raw[0x00..], inode.mode);
            LittleEndian::write_u16(&mut raw[0x02..], inode.uid);
            LittleEndian::write_u32(&mut raw[0x04..], inode.size);
            LittleEndian::write_u32(&mut raw[0x08..], ATIME);
            LittleEndian::write_u32(&mut raw[0x0C..], CTIME);
            LittleEndian::write_u32(&mut raw[0x10..], MTIME);
            LittleEndian::write_u16(&mut raw[0x18..], inode.gid);
            LittleEndian::write_u16(&mut raw[0x1A..], inode.links);
            LittleEndian::write_u32(&mut raw[0x1C..], inode.sectors);
            LittleEndian::write_u32_into(&inode.block, &mut raw[0x28..0x64]);
        }

        image
    }

    /// Build into a temporary image file
    pub fn build_file(&mut self) -> NamedTempFile {
        let image = self.build();
        let mut file = NamedTempFile::new().expect("temp image");
        file.write_all(&image).expect("write image");
        file.flush().expect("flush image");
        file
    }
}
