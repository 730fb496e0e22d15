//! One archive entry per exported object

use std::io::{ErrorKind, Read};

use crate::archive::{ArchiveEntry, ArchiveWriter, EntryKind};
use crate::fs::{FileKind, FilesystemAccess, InodeRecord};

use super::device::DeviceNumber;
use super::error::{AdvisoryLog, ExportError};
use super::symlink::SymlinkResolver;

/// Regular-file content is copied in chunks of this size
pub const CONTENT_CHUNK_SIZE: usize = 512;

pub struct ArchiveExporter<'a> {
    fs: &'a dyn FilesystemAccess,
    archive: &'a mut dyn ArchiveWriter,
}

impl<'a> ArchiveExporter<'a> {
    pub fn new(fs: &'a dyn FilesystemAccess, archive: &'a mut dyn ArchiveWriter) -> Self {
        Self { fs, archive }
    }

    /// Write the header of one object and, for regular files, its content.
    ///
    /// Returns the number of content bytes written.
    pub fn export(
        &mut self,
        ino: u32,
        record: &InodeRecord,
        kind: FileKind,
        path: &[u8],
        advisories: &mut AdvisoryLog,
    ) -> Result<u64, ExportError> {
        let shown = String::from_utf8_lossy(path).into_owned();

        let entry_kind = match kind {
            FileKind::Directory => EntryKind::Directory,
            FileKind::RegularFile => EntryKind::Regular,
            FileKind::Symlink => EntryKind::Symlink,
            FileKind::CharDevice => EntryKind::CharDevice,
            FileKind::BlockDevice => EntryKind::BlockDevice,
            FileKind::Fifo | FileKind::Socket => {
                return Err(ExportError::UnsupportedType {
                    ino,
                    path: shown,
                    kind,
                })
            }
        };

        let member = path.strip_prefix(b"/").unwrap_or(path);
        let mut entry = ArchiveEntry::new(member, entry_kind);
        entry.mode = record.permissions() as u32;
        entry.size = record.size;
        entry.nlink = record.links_count as u32;
        entry.uid = record.uid;
        entry.gid = record.gid;
        entry.atime = record.atime;
        entry.ctime = record.ctime;
        entry.mtime = record.mtime;

        match entry_kind {
            EntryKind::Symlink => {
                let target =
                    SymlinkResolver::new(self.fs).resolve(ino, record, &shown, advisories)?;
                entry.set_symlink(target);
            }
            EntryKind::CharDevice | EntryKind::BlockDevice => {
                entry.set_rdev(DeviceNumber::from_inode(record).rdev());
            }
            EntryKind::Directory | EntryKind::Regular => {}
        }

        self.archive
            .write_header(&entry)
            .map_err(|source| ExportError::Header {
                ino,
                path: shown.clone(),
                source,
            })?;
        tracing::debug!(ino, path = %shown, kind = %kind, size = record.size, "Wrote header");

        if entry_kind == EntryKind::Regular {
            self.copy_content(ino, record, &shown)
        } else {
            Ok(0)
        }
    }

    fn copy_content(
        &mut self,
        ino: u32,
        record: &InodeRecord,
        path: &str,
    ) -> Result<u64, ExportError> {
        let mut reader = self
            .fs
            .open_file(ino, record)
            .map_err(|source| ExportError::OpenContent {
                ino,
                path: path.to_string(),
                source,
            })?;

        let mut chunk = [0u8; CONTENT_CHUNK_SIZE];
        let mut total = 0u64;
        loop {
            let read = match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(ExportError::ContentRead {
                        ino,
                        path: path.to_string(),
                        source,
                    })
                }
            };
            let written = self
                .archive
                .write_data(&chunk[..read])
                .map_err(|source| ExportError::ContentWrite {
                    ino,
                    path: path.to_string(),
                    source,
                })?;
            if written != read {
                return Err(ExportError::ShortWrite {
                    ino,
                    path: path.to_string(),
                    read,
                    written,
                });
            }
            total += read as u64;
        }

        if total < record.size {
            return Err(ExportError::ShortRead {
                ino,
                path: path.to_string(),
                expected: record.size,
                actual: total,
            });
        }
        Ok(total)
    }
}
