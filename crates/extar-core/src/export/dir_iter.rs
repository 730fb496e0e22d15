//! Phase 2: replay registered directory blocks as (parent, child, name)

use std::vec;

use crate::fs::{DirectoryBlock, FilesystemAccess};

use super::error::ExportError;
use super::scanner::DirectoryBlockList;

/// One named link found in a directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub parent: u32,
    pub child: u32,
    pub name: Vec<u8>,
}

/// Yields the entries of every registered block in registration order,
/// without `.` and `..`. Stops after the first decode error.
pub struct DirectoryIterator<'a> {
    fs: &'a dyn FilesystemAccess,
    blocks: vec::IntoIter<DirectoryBlock>,
    pending: vec::IntoIter<DirectoryEntry>,
    blocks_read: u64,
    failed: bool,
}

impl<'a> DirectoryIterator<'a> {
    pub fn new(fs: &'a dyn FilesystemAccess, blocks: DirectoryBlockList) -> Self {
        Self {
            fs,
            blocks: blocks.into_iter(),
            pending: Vec::new().into_iter(),
            blocks_read: 0,
            failed: false,
        }
    }

    pub fn blocks_read(&self) -> u64 {
        self.blocks_read
    }

    fn load(&mut self, block: DirectoryBlock) -> Result<(), ExportError> {
        let raw = self
            .fs
            .directory_entries(&block)
            .map_err(|source| ExportError::DirectoryDecode {
                dir: block.dir,
                block: block.block,
                source,
            })?;
        self.blocks_read += 1;

        let entries: Vec<DirectoryEntry> = raw
            .into_iter()
            .filter(|e| e.inode != 0 && !e.is_dot_or_dotdot())
            .map(|e| DirectoryEntry {
                parent: block.dir,
                child: e.inode,
                name: e.name,
            })
            .collect();
        tracing::debug!(
            dir = block.dir,
            block = block.block,
            "Decoded {} entries",
            entries.len()
        );
        self.pending = entries.into_iter();
        Ok(())
    }
}

impl Iterator for DirectoryIterator<'_> {
    type Item = Result<DirectoryEntry, ExportError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(entry) = self.pending.next() {
                return Some(Ok(entry));
            }
            let block = self.blocks.next()?;
            if let Err(e) = self.load(block) {
                self.failed = true;
                return Some(Err(e));
            }
        }
    }
}
