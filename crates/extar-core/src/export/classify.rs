//! Object type dispatch

use crate::fs::{FileKind, FilesystemAccess, InodeRecord};

use super::dir_iter::DirectoryEntry;
use super::error::{Advisory, AdvisoryLog, ExportError};

/// An inode that passed classification and can be exported
#[derive(Debug, Clone)]
pub struct Classified {
    pub ino: u32,
    pub record: InodeRecord,
    pub kind: FileKind,
}

pub struct InodeClassifier<'a> {
    fs: &'a dyn FilesystemAccess,
}

impl<'a> InodeClassifier<'a> {
    pub fn new(fs: &'a dyn FilesystemAccess) -> Self {
        Self { fs }
    }

    /// Read the entry's inode and decide whether it can be exported
    pub fn classify(
        &self,
        entry: &DirectoryEntry,
        path: &[u8],
        advisories: &mut AdvisoryLog,
    ) -> Result<Classified, ExportError> {
        let ino = entry.child;
        let record = self
            .fs
            .read_inode(ino)
            .map_err(|source| ExportError::InodeRead { ino, source })?;
        let display = || String::from_utf8_lossy(path).into_owned();

        let Some(kind) = record.kind() else {
            return Err(ExportError::UnknownType {
                ino,
                path: display(),
                mode: record.mode,
            });
        };

        match kind {
            FileKind::Directory | FileKind::Symlink | FileKind::CharDevice => {}
            FileKind::RegularFile => match record.links_count {
                0 => {
                    return Err(ExportError::ZeroLinkCount {
                        ino,
                        path: display(),
                    })
                }
                1 => {}
                links => advisories.record(Advisory::HardLink {
                    ino,
                    path: display(),
                    links,
                }),
            },
            FileKind::BlockDevice | FileKind::Fifo | FileKind::Socket => {
                return Err(ExportError::UnsupportedType {
                    ino,
                    path: display(),
                    kind,
                })
            }
        }

        Ok(Classified { ino, record, kind })
    }
}
