/// ext2/3/4 file system support
use std::io::Read;
use std::path::Path;

use super::common::BlockDevice;
use super::{
    DirectoryBlock, FileKind, FilesystemAccess, FsError, InodeRecord, RawDirEntry,
    EMBEDDED_CAPACITY, ROOT_INO,
};

pub mod blockmap;
pub mod directory;
pub mod file;
pub mod inline;
pub mod inode;
pub mod superblock;

use blockmap::{BlockMapper, Extent};
use directory::parse_dir_block;
use file::ExtFileReader;
use inode::{parse_inode, EXT4_INLINE_DATA_FL};
use superblock::{
    GroupDescriptor, Superblock, BG_INODE_UNINIT, INCOMPAT_FILETYPE, INCOMPAT_JOURNAL_DEV,
    INCOMPAT_META_BG, INCOMPAT_RECOVER, SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE,
};

/// Ancestors walked before a path is cut short with `...`
const MAX_PATH_DEPTH: usize = 4096;

/// Check if the device carries an ext superblock
pub fn is_ext_superblock(device: &BlockDevice) -> bool {
    device
        .read_bytes(SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE)
        .map(|raw| Superblock::parse(raw).is_ok())
        .unwrap_or(false)
}

/// An opened ext2/3/4 image
pub struct ExtFilesystem {
    device: BlockDevice,
    sb: Superblock,
    groups: Vec<GroupDescriptor>,
}

impl ExtFilesystem {
    /// Open an image file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, FsError> {
        Self::from_device(BlockDevice::open(path)?)
    }

    pub fn from_device(device: BlockDevice) -> Result<Self, FsError> {
        let sb = Superblock::parse(device.read_bytes(SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE)?)?;

        if sb.has_incompat(INCOMPAT_JOURNAL_DEV) {
            return Err(FsError::Format("image is an external journal device".into()));
        }
        if sb.has_incompat(INCOMPAT_META_BG) {
            return Err(FsError::Unsupported("meta_bg group descriptor layout".into()));
        }
        if sb.blocks_count > device.size() / sb.block_size as u64 {
            tracing::warn!(
                "Image is shorter than the filesystem ({} blocks declared, {} present)",
                sb.blocks_count,
                device.size() / sb.block_size as u64
            );
        }

        let group_count = sb.group_count() as usize;
        let desc_size = sb.desc_size as usize;
        let table = device.read_bytes(
            sb.descriptor_table_block() * sb.block_size as u64,
            group_count * desc_size,
        )?;
        let groups = table
            .chunks_exact(desc_size)
            .map(|d| GroupDescriptor::parse(d, sb.desc_size))
            .collect::<Result<Vec<_>, _>>()?;

        let max_inodes = group_count as u64 * sb.inodes_per_group as u64;
        if (sb.inodes_count as u64) > max_inodes {
            return Err(FsError::Format(format!(
                "{} inodes declared but groups hold {}",
                sb.inodes_count, max_inodes
            )));
        }

        tracing::info!(
            "Opened {} filesystem: {} blocks of {} bytes, {} inodes in {} groups",
            sb.version(),
            sb.blocks_count,
            sb.block_size,
            sb.inodes_count,
            group_count
        );

        Ok(Self { device, sb, groups })
    }

    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    pub fn block_size(&self) -> u32 {
        self.sb.block_size
    }

    /// The journal has uncommitted transactions that are not replayed
    pub fn needs_recovery(&self) -> bool {
        self.sb.has_incompat(INCOMPAT_RECOVER)
    }

    fn mapper(&self) -> BlockMapper<'_> {
        BlockMapper::new(&self.device, self.sb.block_size, self.sb.blocks_count)
    }

    fn read_block(&self, block: u64) -> Result<&[u8], FsError> {
        if block == 0 || block >= self.sb.blocks_count {
            return Err(FsError::corruption(block, "block outside filesystem"));
        }
        self.device.read_block(block, self.sb.block_size)
    }

    fn locate(&self, ino: u32) -> Result<(usize, u32), FsError> {
        if ino == 0 || ino > self.sb.inodes_count {
            return Err(FsError::InvalidInode(ino));
        }
        let group = ((ino - 1) / self.sb.inodes_per_group) as usize;
        let index = (ino - 1) % self.sb.inodes_per_group;
        Ok((group, index))
    }

    /// Raw on-disk slot of an inode
    pub fn read_inode_raw(&self, ino: u32) -> Result<&[u8], FsError> {
        let (group, index) = self.locate(ino)?;
        let gd = &self.groups[group];
        let offset = gd.inode_table * self.sb.block_size as u64
            + index as u64 * self.sb.inode_size as u64;
        self.device.read_bytes(offset, self.sb.inode_size as usize)
    }

    /// Whether the inode bitmap marks `ino` as allocated
    fn inode_in_use(&self, ino: u32) -> Result<bool, FsError> {
        let (group, index) = self.locate(ino)?;
        let gd = &self.groups[group];

        if self.sb.has_group_checksums() {
            if gd.flags & BG_INODE_UNINIT != 0 {
                return Ok(false);
            }
            let used = self.sb.inodes_per_group.saturating_sub(gd.itable_unused);
            if index >= used {
                return Ok(false);
            }
        }

        let bitmap = self.read_block(gd.inode_bitmap)?;
        let byte = bitmap
            .get((index / 8) as usize)
            .ok_or_else(|| FsError::corruption(gd.inode_bitmap, "inode bitmap too small"))?;
        Ok(byte & (1 << (index % 8)) != 0)
    }

    fn extents(&self, inode: &InodeRecord) -> Result<Vec<Extent>, FsError> {
        self.mapper().map(inode)
    }

    fn inline_data(&self, ino: u32, inode: &InodeRecord) -> Result<Vec<u8>, FsError> {
        let raw = self.read_inode_raw(ino)?;
        Ok(inline::inline_content(&inode.embedded_bytes(), raw, inode.size))
    }

    /// All records of a directory, in on-disk order
    fn list_directory(&self, ino: u32) -> Result<Vec<RawDirEntry>, FsError> {
        let inode = self.read_inode(ino)?;
        if !inode.is_dir() {
            return Err(FsError::corruption(0, format!("inode {ino} is not a directory")));
        }
        let has_filetype = self.sb.has_incompat(INCOMPAT_FILETYPE);

        if inode.flags & EXT4_INLINE_DATA_FL != 0 {
            return self.list_inline_directory(ino, &inode, has_filetype);
        }

        let mut entries = Vec::new();
        for extent in self.extents(&inode)? {
            if extent.uninit {
                continue;
            }
            for i in 0..extent.len {
                let block = extent.physical + i;
                entries.extend(parse_dir_block(self.read_block(block)?, has_filetype, block)?);
            }
        }
        Ok(entries)
    }

    /// Inline directories store the parent inode in the first word and
    /// records after it, continued in `system.data`
    fn list_inline_directory(
        &self,
        ino: u32,
        inode: &InodeRecord,
        has_filetype: bool,
    ) -> Result<Vec<RawDirEntry>, FsError> {
        let embedded = inode.embedded_bytes();
        let mut entries = vec![RawDirEntry {
            inode: inode.block[0],
            name: b"..".to_vec(),
            file_type: 2,
        }];
        entries.extend(parse_dir_block(&embedded[4..], has_filetype, 0)?);

        let raw = self.read_inode_raw(ino)?;
        if let Some(extra) = inline::system_data(raw) {
            entries.extend(parse_dir_block(extra, has_filetype, 0)?);
        }
        Ok(entries)
    }

    fn lookup_parent(&self, dir: u32) -> Result<Option<u32>, FsError> {
        Ok(self
            .list_directory(dir)?
            .into_iter()
            .find(|e| e.name == b"..")
            .map(|e| e.inode))
    }

    fn lookup_name(&self, dir: u32, child: u32) -> Result<Option<Vec<u8>>, FsError> {
        Ok(self
            .list_directory(dir)?
            .into_iter()
            .find(|e| e.inode == child && !e.is_dot_or_dotdot())
            .map(|e| e.name))
    }

    /// Get ext file system information
    pub fn describe(&self) -> String {
        let sb = &self.sb;
        let fs_size_mb = (sb.blocks_count * sb.block_size as u64) / (1024 * 1024);
        let label = if sb.volume_name.is_empty() {
            "(none)"
        } else {
            sb.volume_name.as_str()
        };

        format!(
            "{} File System\n\
             - Volume Label: {}\n\
             - Block Size: {} bytes\n\
             - Total Blocks: {}\n\
             - File System Size: {} MB\n\
             - Inodes: {} ({} bytes each)\n\
             - Block Groups: {}\n\
             - Features: compat 0x{:08X}, incompat 0x{:08X}, ro_compat 0x{:08X}\n\
             - UUID: {}",
            sb.version(),
            label,
            sb.block_size,
            sb.blocks_count,
            fs_size_mb,
            sb.inodes_count,
            sb.inode_size,
            self.groups.len(),
            sb.feature_compat,
            sb.feature_incompat,
            sb.feature_ro_compat,
            sb.uuid_string()
        )
    }
}

impl FilesystemAccess for ExtFilesystem {
    fn inode_count(&self) -> u32 {
        self.sb.inodes_count
    }

    fn inodes(&self) -> Box<dyn Iterator<Item = Result<(u32, InodeRecord), FsError>> + '_> {
        Box::new(InodeScan { fs: self, next: 1 })
    }

    fn read_inode(&self, ino: u32) -> Result<InodeRecord, FsError> {
        parse_inode(self.read_inode_raw(ino)?)
    }

    fn has_valid_blocks(&self, inode: &InodeRecord) -> bool {
        match inode.kind() {
            Some(FileKind::Directory) | Some(FileKind::RegularFile) => {}
            Some(FileKind::Symlink) => {
                if inode.file_acl == 0 {
                    if inode.sectors == 0 {
                        return false;
                    }
                } else {
                    // With an xattr block, i_blocks counts it too
                    if inode.size >= EMBEDDED_CAPACITY as u64 {
                        return true;
                    }
                    if inode.size > 4 && inode.block[1] == 0 {
                        return true;
                    }
                    return false;
                }
            }
            _ => return false,
        }
        inode.flags & EXT4_INLINE_DATA_FL == 0
    }

    fn iterate_blocks(
        &self,
        _ino: u32,
        inode: &InodeRecord,
        f: &mut dyn FnMut(u64, u64),
    ) -> Result<(), FsError> {
        for extent in self.extents(inode)? {
            for i in 0..extent.len {
                f(extent.physical + i, extent.logical + i);
            }
        }
        Ok(())
    }

    fn directory_entries(&self, block: &DirectoryBlock) -> Result<Vec<RawDirEntry>, FsError> {
        let data = self.read_block(block.block)?;
        parse_dir_block(data, self.sb.has_incompat(INCOMPAT_FILETYPE), block.block)
    }

    fn resolve_pathname(&self, dir: u32) -> Result<Vec<u8>, FsError> {
        let mut components: Vec<Vec<u8>> = Vec::new();
        let mut current = dir;
        let mut reached_root = false;

        for _ in 0..MAX_PATH_DEPTH {
            if current == ROOT_INO {
                reached_root = true;
                break;
            }
            let Some(parent) = self.lookup_parent(current)? else {
                components.push(format!("<{current}>").into_bytes());
                reached_root = true;
                break;
            };
            let name = self
                .lookup_name(parent, current)?
                .unwrap_or_else(|| format!("<{current}>").into_bytes());
            components.push(name);
            current = parent;
        }
        if !reached_root {
            components.push(b"...".to_vec());
        }

        if components.is_empty() {
            return Ok(b"/".to_vec());
        }
        let mut path = Vec::new();
        for component in components.iter().rev() {
            path.push(b'/');
            path.extend_from_slice(component);
        }
        Ok(path)
    }

    fn open_file<'a>(
        &'a self,
        ino: u32,
        inode: &InodeRecord,
    ) -> Result<Box<dyn Read + 'a>, FsError> {
        if inode.flags & EXT4_INLINE_DATA_FL != 0 {
            let data = self.inline_data(ino, inode)?;
            return Ok(Box::new(ExtFileReader::from_inline(data, inode.size)));
        }
        let extents = self.extents(inode)?;
        Ok(Box::new(ExtFileReader::from_extents(
            &self.device,
            self.sb.block_size,
            extents,
            inode.size,
        )))
    }
}

/// Iterator over allocated inodes in number order
struct InodeScan<'a> {
    fs: &'a ExtFilesystem,
    next: u32,
}

impl Iterator for InodeScan<'_> {
    type Item = Result<(u32, InodeRecord), FsError>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.next != 0 && self.next <= self.fs.sb.inodes_count {
            let ino = self.next;
            self.next = self.next.checked_add(1).unwrap_or(0);

            match self.fs.inode_in_use(ino) {
                Ok(false) => continue,
                Ok(true) => return Some(self.fs.read_inode(ino).map(|inode| (ino, inode))),
                Err(e) => {
                    // Stop after the first failure
                    self.next = 0;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}
