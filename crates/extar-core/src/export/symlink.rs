//! Symlink target extraction

use std::io::{ErrorKind, Read};

use crate::fs::{FilesystemAccess, InodeRecord, EMBEDDED_CAPACITY};

use super::error::{Advisory, AdvisoryLog, ExportError};
use super::exporter::CONTENT_CHUNK_SIZE;

/// Longest target a symlink may carry, including the terminating NUL
pub const SYMLINK_MAX: u64 = 4096;

/// Where a symlink keeps its target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymlinkStorage {
    /// In the embedded pointer words
    Fast,
    /// In data blocks, read like file content
    Slow,
}

impl SymlinkStorage {
    pub fn of(record: &InodeRecord) -> Self {
        if record.size > 0 && record.size < EMBEDDED_CAPACITY as u64 {
            SymlinkStorage::Fast
        } else {
            SymlinkStorage::Slow
        }
    }
}

pub struct SymlinkResolver<'a> {
    fs: &'a dyn FilesystemAccess,
}

impl<'a> SymlinkResolver<'a> {
    pub fn new(fs: &'a dyn FilesystemAccess) -> Self {
        Self { fs }
    }

    pub fn resolve(
        &self,
        ino: u32,
        record: &InodeRecord,
        path: &str,
        advisories: &mut AdvisoryLog,
    ) -> Result<Vec<u8>, ExportError> {
        let target = match SymlinkStorage::of(record) {
            SymlinkStorage::Fast => fast_target(record),
            SymlinkStorage::Slow => self.slow_target(ino, record, path)?,
        };

        if target.is_empty() {
            advisories.record(Advisory::EmptySymlinkTarget {
                ino,
                path: path.to_string(),
            });
        }
        Ok(target)
    }

    fn slow_target(
        &self,
        ino: u32,
        record: &InodeRecord,
        path: &str,
    ) -> Result<Vec<u8>, ExportError> {
        let read_failed = |detail: String, errno: i32| ExportError::SymlinkRead {
            ino,
            path: path.to_string(),
            detail,
            errno,
        };

        if record.size > SYMLINK_MAX {
            return Err(read_failed(
                format!("target length {} exceeds {SYMLINK_MAX}", record.size),
                36,
            ));
        }

        let mut reader = self
            .fs
            .open_file(ino, record)
            .map_err(|e| read_failed(e.to_string(), e.to_errno()))?;

        let size = record.size as usize;
        let mut target = Vec::with_capacity(size);
        let mut chunk = [0u8; CONTENT_CHUNK_SIZE];
        while target.len() < size {
            let want = (size - target.len()).min(CONTENT_CHUNK_SIZE);
            let n = match reader.read(&mut chunk[..want]) {
                Ok(0) => {
                    return Err(ExportError::ShortRead {
                        ino,
                        path: path.to_string(),
                        expected: record.size,
                        actual: target.len() as u64,
                    })
                }
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(read_failed(e.to_string(), e.raw_os_error().unwrap_or(5))),
            };
            target.extend_from_slice(&chunk[..n]);
        }
        Ok(target)
    }
}

/// Target stored in the embedded words, cut at the first NUL
fn fast_target(record: &InodeRecord) -> Vec<u8> {
    let embedded = record.embedded_bytes();
    let stored = &embedded[..record.size as usize];
    let end = stored.iter().position(|&b| b == 0).unwrap_or(stored.len());
    stored[..end].to_vec()
}
