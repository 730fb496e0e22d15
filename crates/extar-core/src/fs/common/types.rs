/// Common types and utilities for image access
use memmap2::MmapOptions;
use std::fs::File;
use std::path::Path;

use crate::fs::FsError;

enum Storage {
    Mapped { _file: File, mmap: memmap2::Mmap },
    Memory(Vec<u8>),
}

/// A read-only view of an image file, memory-mapped for large images
pub struct BlockDevice {
    storage: Storage,
    size: u64,
}

impl BlockDevice {
    /// Open an image file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, FsError> {
        let file = File::open(path.as_ref())?;
        let size = file.metadata()?.len();

        if size == 0 {
            return Ok(Self::from_vec(Vec::new()));
        }

        // The image is opened read-only and never written through the map.
        let mmap = unsafe { MmapOptions::new().map(&file)? };

        Ok(BlockDevice {
            storage: Storage::Mapped { _file: file, mmap },
            size,
        })
    }

    /// Wrap an in-memory image
    pub fn from_vec(data: Vec<u8>) -> Self {
        let size = data.len() as u64;
        BlockDevice {
            storage: Storage::Memory(data),
            size,
        }
    }

    /// Get the size of the device in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    fn bytes(&self) -> &[u8] {
        match &self.storage {
            Storage::Mapped { mmap, .. } => &mmap[..],
            Storage::Memory(data) => &data[..],
        }
    }

    /// Read a slice of bytes from the device
    pub fn read_bytes(&self, offset: u64, length: usize) -> Result<&[u8], FsError> {
        let end = offset
            .checked_add(length as u64)
            .ok_or(FsError::OutOfBounds {
                end: u64::MAX,
                size: self.size,
            })?;

        if end > self.size {
            return Err(FsError::OutOfBounds {
                end,
                size: self.size,
            });
        }

        Ok(&self.bytes()[offset as usize..end as usize])
    }

    /// Read data at a specific block offset
    pub fn read_block(&self, block_number: u64, block_size: u32) -> Result<&[u8], FsError> {
        let offset = block_number
            .checked_mul(block_size as u64)
            .ok_or_else(|| FsError::corruption(block_number, "block number overflows"))?;
        self.read_bytes(offset, block_size as usize)
    }
}
