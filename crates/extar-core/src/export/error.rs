use std::fmt;

use thiserror::Error;

use crate::archive::ArchiveError;
use crate::fs::{FileKind, FsError};

/// How the orchestrator reacts to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Abort the run
    Fatal,
    /// Log it, abandon the current entry and continue
    Advisory,
}

/// Errors raised while exporting an image
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("cannot open filesystem {path}: {source}")]
    OpenFilesystem { path: String, source: FsError },

    #[error("cannot create archive {path}: {source}")]
    OpenArchive {
        path: String,
        source: std::io::Error,
    },

    #[error("inode scan failed: {0}")]
    Scan(FsError),

    #[error("cannot enumerate blocks of directory {ino}: {source}")]
    BlockEnumeration { ino: u32, source: FsError },

    #[error("cannot decode block {block} of directory {dir}: {source}")]
    DirectoryDecode {
        dir: u32,
        block: u64,
        source: FsError,
    },

    #[error("cannot resolve path of directory {dir}: {source}")]
    PathResolution { dir: u32, source: FsError },

    #[error("cannot read inode {ino}: {source}")]
    InodeRead { ino: u32, source: FsError },

    #[error("{path}: unsupported {kind} (inode {ino})")]
    UnsupportedType { ino: u32, path: String, kind: FileKind },

    #[error("{path}: unknown file type in mode {mode:#o} (inode {ino})")]
    UnknownType { ino: u32, path: String, mode: u16 },

    #[error("{path}: regular file with zero link count (inode {ino})")]
    ZeroLinkCount { ino: u32, path: String },

    #[error("{path}: cannot open content: {source}")]
    OpenContent {
        ino: u32,
        path: String,
        source: FsError,
    },

    #[error("{path}: content read failed: {source}")]
    ContentRead {
        ino: u32,
        path: String,
        source: std::io::Error,
    },

    #[error("{path}: short read, {actual} of {expected} bytes")]
    ShortRead {
        ino: u32,
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("{path}: content write failed: {source}")]
    ContentWrite {
        ino: u32,
        path: String,
        source: ArchiveError,
    },

    #[error("{path}: short write, {written} of {read} bytes")]
    ShortWrite {
        ino: u32,
        path: String,
        read: usize,
        written: usize,
    },

    #[error("{path}: cannot write header: {source}")]
    Header {
        ino: u32,
        path: String,
        source: ArchiveError,
    },

    #[error("{path}: cannot read symlink target: {detail}")]
    SymlinkRead {
        ino: u32,
        path: String,
        detail: String,
        errno: i32,
    },

    #[error("cannot finish archive: {0}")]
    Finish(ArchiveError),
}

impl ExportError {
    pub fn severity(&self) -> Severity {
        match self {
            // a failed write leaves the archive stream unusable
            ExportError::Header {
                source: ArchiveError::Io(_) | ArchiveError::IncompleteEntry { .. },
                ..
            } => Severity::Fatal,
            ExportError::Header { .. } | ExportError::SymlinkRead { .. } => Severity::Advisory,
            _ => Severity::Fatal,
        }
    }

    /// POSIX errno closest to this error, used as the log code
    pub fn to_errno(&self) -> i32 {
        match self {
            ExportError::OpenFilesystem { source, .. }
            | ExportError::Scan(source)
            | ExportError::BlockEnumeration { source, .. }
            | ExportError::DirectoryDecode { source, .. }
            | ExportError::PathResolution { source, .. }
            | ExportError::InodeRead { source, .. }
            | ExportError::OpenContent { source, .. } => source.to_errno(),
            ExportError::OpenArchive { source, .. } | ExportError::ContentRead { source, .. } => {
                source.raw_os_error().unwrap_or(5)
            }
            ExportError::Header { source, .. }
            | ExportError::ContentWrite { source, .. }
            | ExportError::Finish(source) => source.to_errno(),
            ExportError::SymlinkRead { errno, .. } => *errno,
            ExportError::UnsupportedType { .. } | ExportError::UnknownType { .. } => 95,
            ExportError::ZeroLinkCount { .. } => 22,
            ExportError::ShortRead { .. } | ExportError::ShortWrite { .. } => 5,
        }
    }

    /// Inode the error is attached to, when it concerns a single object
    pub fn inode(&self) -> Option<u32> {
        match self {
            ExportError::UnsupportedType { ino, .. }
            | ExportError::UnknownType { ino, .. }
            | ExportError::ZeroLinkCount { ino, .. }
            | ExportError::OpenContent { ino, .. }
            | ExportError::ContentRead { ino, .. }
            | ExportError::ShortRead { ino, .. }
            | ExportError::ContentWrite { ino, .. }
            | ExportError::ShortWrite { ino, .. }
            | ExportError::Header { ino, .. }
            | ExportError::SymlinkRead { ino, .. }
            | ExportError::InodeRead { ino, .. }
            | ExportError::BlockEnumeration { ino, .. } => Some(*ino),
            ExportError::DirectoryDecode { dir, .. } | ExportError::PathResolution { dir, .. } => {
                Some(*dir)
            }
            _ => None,
        }
    }

    /// Path of the entry the error is attached to
    pub fn path(&self) -> Option<&str> {
        match self {
            ExportError::UnsupportedType { path, .. }
            | ExportError::UnknownType { path, .. }
            | ExportError::ZeroLinkCount { path, .. }
            | ExportError::OpenContent { path, .. }
            | ExportError::ContentRead { path, .. }
            | ExportError::ShortRead { path, .. }
            | ExportError::ContentWrite { path, .. }
            | ExportError::ShortWrite { path, .. }
            | ExportError::Header { path, .. }
            | ExportError::SymlinkRead { path, .. } => Some(path),
            _ => None,
        }
    }
}

/// A non-fatal condition noted during a run
#[derive(Debug)]
pub enum Advisory {
    /// A regular file reachable through more than one directory entry
    HardLink { ino: u32, path: String, links: u16 },
    EmptySymlinkTarget { ino: u32, path: String },
    /// Inline-data directory whose children cannot be listed
    InlineDirectorySkipped { ino: u32 },
    /// The journal holds transactions that were not replayed
    NeedsRecovery,
    /// An entry abandoned after an advisory-severity error
    EntrySkipped(ExportError),
}

impl Advisory {
    pub fn code(&self) -> i32 {
        match self {
            Advisory::EntrySkipped(e) => e.to_errno(),
            _ => 0,
        }
    }

    pub fn inode(&self) -> Option<u32> {
        match self {
            Advisory::HardLink { ino, .. }
            | Advisory::EmptySymlinkTarget { ino, .. }
            | Advisory::InlineDirectorySkipped { ino } => Some(*ino),
            Advisory::NeedsRecovery => None,
            Advisory::EntrySkipped(e) => e.inode(),
        }
    }

    pub fn path(&self) -> Option<&str> {
        match self {
            Advisory::HardLink { path, .. } | Advisory::EmptySymlinkTarget { path, .. } => {
                Some(path)
            }
            Advisory::EntrySkipped(e) => e.path(),
            _ => None,
        }
    }
}

impl fmt::Display for Advisory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Advisory::HardLink { path, links, .. } => write!(
                f,
                "{path}: hard link ({links} links), exported as an independent copy"
            ),
            Advisory::EmptySymlinkTarget { path, .. } => {
                write!(f, "{path}: symlink has an empty target")
            }
            Advisory::InlineDirectorySkipped { ino } => write!(
                f,
                "directory {ino} stores its entries inline; its children are not exported"
            ),
            Advisory::NeedsRecovery => write!(
                f,
                "journal needs recovery; exporting the image without replaying it"
            ),
            Advisory::EntrySkipped(e) => write!(f, "entry skipped: {e}"),
        }
    }
}

/// Advisories of one run, in the order they were raised
#[derive(Debug, Default)]
pub struct AdvisoryLog {
    entries: Vec<Advisory>,
}

impl AdvisoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log an advisory and keep it for the run summary
    pub fn record(&mut self, advisory: Advisory) {
        tracing::warn!(
            ino = advisory.inode().unwrap_or(0),
            path = advisory.path().unwrap_or(""),
            code = advisory.code(),
            "{}",
            advisory
        );
        self.entries.push(advisory);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Advisory> {
        self.entries.iter()
    }

    /// Hard-link notices raised for `ino`
    pub fn hard_links_for(&self, ino: u32) -> usize {
        self.entries
            .iter()
            .filter(|a| matches!(a, Advisory::HardLink { ino: i, .. } if *i == ino))
            .count()
    }
}
