//! Phase 1: register the data blocks of every directory

use crate::fs::{DirectoryBlock, FilesystemAccess};

use super::error::{Advisory, AdvisoryLog, ExportError};

/// Every directory data block of the image, in inode then block order.
///
/// Only a completed [`InodeScanner::scan`] produces one, so holding a list
/// means phase 1 has finished.
#[derive(Debug)]
pub struct DirectoryBlockList {
    blocks: Vec<DirectoryBlock>,
    inodes_scanned: u64,
    directories: u64,
}

impl DirectoryBlockList {
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DirectoryBlock> {
        self.blocks.iter()
    }

    /// In-use inodes visited by the scan
    pub fn inodes_scanned(&self) -> u64 {
        self.inodes_scanned
    }

    /// Directories that registered at least one block
    pub fn directories(&self) -> u64 {
        self.directories
    }
}

impl IntoIterator for DirectoryBlockList {
    type Item = DirectoryBlock;
    type IntoIter = std::vec::IntoIter<DirectoryBlock>;

    fn into_iter(self) -> Self::IntoIter {
        self.blocks.into_iter()
    }
}

pub struct InodeScanner<'a> {
    fs: &'a dyn FilesystemAccess,
}

impl<'a> InodeScanner<'a> {
    pub fn new(fs: &'a dyn FilesystemAccess) -> Self {
        Self { fs }
    }

    /// Visit every in-use inode once and register the blocks of each
    /// directory that has valid block pointers
    pub fn scan(self, advisories: &mut AdvisoryLog) -> Result<DirectoryBlockList, ExportError> {
        let mut list = DirectoryBlockList {
            blocks: Vec::new(),
            inodes_scanned: 0,
            directories: 0,
        };

        tracing::info!("Scanning {} inodes for directories", self.fs.inode_count());

        for item in self.fs.inodes() {
            let (ino, inode) = item.map_err(ExportError::Scan)?;
            list.inodes_scanned += 1;

            if !inode.is_dir() {
                continue;
            }
            if !self.fs.has_valid_blocks(&inode) {
                if inode.has_inline_data() {
                    advisories.record(Advisory::InlineDirectorySkipped { ino });
                }
                continue;
            }

            let before = list.blocks.len();
            let blocks = &mut list.blocks;
            self.fs
                .iterate_blocks(ino, &inode, &mut |block, index| {
                    tracing::debug!(dir = ino, block, index, "Registered directory block");
                    blocks.push(DirectoryBlock {
                        dir: ino,
                        block,
                        index,
                    });
                })
                .map_err(|source| ExportError::BlockEnumeration { ino, source })?;

            if list.blocks.len() > before {
                list.directories += 1;
            }
        }

        tracing::info!(
            "Scan complete: {} inodes, {} directories, {} directory blocks",
            list.inodes_scanned,
            list.directories,
            list.blocks.len()
        );
        Ok(list)
    }
}
