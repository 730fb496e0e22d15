//! Archive writing: the seam between the export engine and serialization

use thiserror::Error;

mod tar_writer;

pub use tar_writer::TarWriter;

/// Type of an archive member
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    Regular,
    Symlink,
    CharDevice,
    BlockDevice,
}

/// One archive member header, built and dropped within a single export step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Member path, relative (no leading separator)
    pub pathname: Vec<u8>,
    pub kind: EntryKind,
    /// Permission bits, including setuid/setgid/sticky
    pub mode: u32,
    pub size: u64,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: i64,
    pub ctime: i64,
    pub mtime: i64,
    pub symlink: Option<Vec<u8>>,
    /// Packed device number for device nodes
    pub rdev: Option<u64>,
}

impl ArchiveEntry {
    pub fn new(pathname: impl Into<Vec<u8>>, kind: EntryKind) -> Self {
        Self {
            pathname: pathname.into(),
            kind,
            mode: 0,
            size: 0,
            nlink: 1,
            uid: 0,
            gid: 0,
            atime: 0,
            ctime: 0,
            mtime: 0,
            symlink: None,
            rdev: None,
        }
    }

    pub fn set_symlink(&mut self, target: impl Into<Vec<u8>>) {
        self.symlink = Some(target.into());
    }

    pub fn set_rdev(&mut self, rdev: u64) {
        self.rdev = Some(rdev);
    }

    /// Bytes of body that follow the header
    pub fn data_len(&self) -> u64 {
        match self.kind {
            EntryKind::Regular => self.size,
            _ => 0,
        }
    }

    pub fn display_path(&self) -> String {
        String::from_utf8_lossy(&self.pathname).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("path cannot be stored in a tar header: {0}")]
    InvalidPath(String),

    #[error("symlink target cannot be stored in a tar header: {0}")]
    InvalidLink(String),

    #[error("{kind:?} entry {path} has no {field}")]
    MissingField {
        kind: EntryKind,
        path: String,
        field: &'static str,
    },

    #[error("previous entry still expects {remaining} bytes")]
    IncompleteEntry { remaining: u64 },
}

impl ArchiveError {
    pub fn to_errno(&self) -> i32 {
        match self {
            ArchiveError::Io(e) => e.raw_os_error().unwrap_or(5),
            ArchiveError::InvalidPath(_) | ArchiveError::InvalidLink(_) => 22,
            ArchiveError::MissingField { .. } => 22,
            ArchiveError::IncompleteEntry { .. } => 5,
        }
    }
}

/// Pack a device number the way glibc's `makedev` does
pub fn makedev(major: u32, minor: u32) -> u64 {
    let (major, minor) = (major as u64, minor as u64);
    ((major & 0x0000_0fff) << 8)
        | ((major & 0xffff_f000) << 32)
        | (minor & 0x0000_00ff)
        | ((minor & 0xffff_ff00) << 12)
}

pub fn dev_major(rdev: u64) -> u32 {
    (((rdev >> 8) & 0x0fff) | ((rdev >> 32) & 0xffff_f000)) as u32
}

pub fn dev_minor(rdev: u64) -> u32 {
    ((rdev & 0xff) | ((rdev >> 12) & 0xffff_ff00)) as u32
}

/// Operations the export engine needs from an archive format
pub trait ArchiveWriter {
    /// Write the header of a new member; the previous member must be complete
    fn write_header(&mut self, entry: &ArchiveEntry) -> Result<(), ArchiveError>;

    /// Append body bytes to the current member, returning how many were taken
    fn write_data(&mut self, data: &[u8]) -> Result<usize, ArchiveError>;
}

impl<T: ArchiveWriter + ?Sized> ArchiveWriter for &mut T {
    fn write_header(&mut self, entry: &ArchiveEntry) -> Result<(), ArchiveError> {
        (**self).write_header(entry)
    }

    fn write_data(&mut self, data: &[u8]) -> Result<usize, ArchiveError> {
        (**self).write_data(data)
    }
}
