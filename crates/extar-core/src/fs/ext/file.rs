//! Sequential content reader over mapped extents

use std::io::{self, Read};

use super::blockmap::Extent;
use crate::fs::common::BlockDevice;

enum Source<'a> {
    Blocks {
        device: &'a BlockDevice,
        block_size: u32,
        extents: Vec<Extent>,
    },
    Inline(Vec<u8>),
}

/// Reads an inode's content up to its declared size; holes and
/// uninitialized extents read as zeros
pub struct ExtFileReader<'a> {
    source: Source<'a>,
    size: u64,
    pos: u64,
}

impl<'a> ExtFileReader<'a> {
    pub fn from_extents(
        device: &'a BlockDevice,
        block_size: u32,
        extents: Vec<Extent>,
        size: u64,
    ) -> Self {
        Self {
            source: Source::Blocks {
                device,
                block_size,
                extents,
            },
            size,
            pos: 0,
        }
    }

    pub fn from_inline(data: Vec<u8>, size: u64) -> Self {
        Self {
            source: Source::Inline(data),
            size,
            pos: 0,
        }
    }

    /// Copy bytes at the current position without crossing a block boundary
    fn read_step(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.size - self.pos;
        match &self.source {
            Source::Inline(data) => {
                let start = self.pos as usize;
                if start >= data.len() {
                    // Declared size larger than the stored inline bytes
                    return Ok(0);
                }
                let n = buf.len().min(data.len() - start).min(remaining as usize);
                buf[..n].copy_from_slice(&data[start..start + n]);
                Ok(n)
            }
            Source::Blocks {
                device,
                block_size,
                extents,
            } => {
                let bs = *block_size as u64;
                let logical = self.pos / bs;
                let within = (self.pos % bs) as usize;
                let n = buf
                    .len()
                    .min(bs as usize - within)
                    .min(remaining.min(usize::MAX as u64) as usize);

                let mapped = extents
                    .binary_search_by(|e| {
                        if e.contains(logical) {
                            std::cmp::Ordering::Equal
                        } else if e.logical > logical {
                            std::cmp::Ordering::Greater
                        } else {
                            std::cmp::Ordering::Less
                        }
                    })
                    .ok()
                    .map(|i| extents[i]);

                match mapped {
                    Some(extent) if !extent.uninit => {
                        let physical = extent.physical + (logical - extent.logical);
                        let block = device
                            .read_block(physical, *block_size)
                            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                        buf[..n].copy_from_slice(&block[within..within + n]);
                    }
                    _ => buf[..n].fill(0),
                }
                Ok(n)
            }
        }
    }
}

impl Read for ExtFileReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() && self.pos < self.size {
            let n = self.read_step(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
            self.pos += n as u64;
        }
        Ok(filled)
    }
}
