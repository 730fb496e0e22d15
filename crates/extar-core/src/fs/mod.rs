/// Filesystem access: the seam between the export engine and on-disk decoding
use anyhow::Result;
use std::io::Read;
use std::path::Path;

pub mod common;
mod error;
pub mod ext;

pub use error::FsError;
use common::BlockDevice;

/// Inode number of the filesystem root directory
pub const ROOT_INO: u32 = 2;

/// Number of 32-bit pointer words embedded in an inode
pub const EMBEDDED_WORDS: usize = 15;

/// Byte capacity of the embedded pointer storage
pub const EMBEDDED_CAPACITY: usize = EMBEDDED_WORDS * 4;

// Mode type bits (S_IFMT family)
pub const S_IFMT: u16 = 0o170000;
pub const S_IFSOCK: u16 = 0o140000;
pub const S_IFLNK: u16 = 0o120000;
pub const S_IFREG: u16 = 0o100000;
pub const S_IFBLK: u16 = 0o060000;
pub const S_IFDIR: u16 = 0o040000;
pub const S_IFCHR: u16 = 0o020000;
pub const S_IFIFO: u16 = 0o010000;

/// Object type carried in an inode's mode bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    Directory,
    RegularFile,
    Symlink,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
}

impl FileKind {
    /// Decode the type bits of a mode; `None` when they match no known type
    pub fn from_mode(mode: u16) -> Option<Self> {
        match mode & S_IFMT {
            S_IFDIR => Some(FileKind::Directory),
            S_IFREG => Some(FileKind::RegularFile),
            S_IFLNK => Some(FileKind::Symlink),
            S_IFCHR => Some(FileKind::CharDevice),
            S_IFBLK => Some(FileKind::BlockDevice),
            S_IFIFO => Some(FileKind::Fifo),
            S_IFSOCK => Some(FileKind::Socket),
            _ => None,
        }
    }
}

impl std::fmt::Display for FileKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileKind::Directory => write!(f, "directory"),
            FileKind::RegularFile => write!(f, "regular file"),
            FileKind::Symlink => write!(f, "symlink"),
            FileKind::CharDevice => write!(f, "char device"),
            FileKind::BlockDevice => write!(f, "block device"),
            FileKind::Fifo => write!(f, "fifo"),
            FileKind::Socket => write!(f, "socket"),
        }
    }
}

/// Metadata of one inode, read fresh for every use
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InodeRecord {
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub links_count: u16,
    pub atime: i64,
    pub ctime: i64,
    pub mtime: i64,
    pub dtime: u32,
    pub flags: u32,
    /// Allocated 512-byte sectors (i_blocks)
    pub sectors: u64,
    /// Extended attribute block, 0 when absent
    pub file_acl: u64,
    /// Raw embedded pointer words (i_block)
    pub block: [u32; EMBEDDED_WORDS],
}

impl InodeRecord {
    pub fn kind(&self) -> Option<FileKind> {
        FileKind::from_mode(self.mode)
    }

    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    /// Content lives in the inode itself rather than in data blocks
    pub fn has_inline_data(&self) -> bool {
        self.flags & ext::inode::EXT4_INLINE_DATA_FL != 0
    }

    /// Permission, setuid/setgid and sticky bits
    pub fn permissions(&self) -> u16 {
        self.mode & !S_IFMT
    }

    /// Embedded pointer storage as the little-endian bytes found on disk
    pub fn embedded_bytes(&self) -> [u8; EMBEDDED_CAPACITY] {
        let mut bytes = [0u8; EMBEDDED_CAPACITY];
        for (chunk, word) in bytes.chunks_exact_mut(4).zip(self.block.iter()) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        bytes
    }
}

/// A data block registered for a directory during the inode scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryBlock {
    /// Directory inode owning the block
    pub dir: u32,
    /// Physical block number
    pub block: u64,
    /// Index of the block within the directory file
    pub index: u64,
}

/// One record decoded from a directory block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDirEntry {
    pub inode: u32,
    pub name: Vec<u8>,
    pub file_type: u8,
}

impl RawDirEntry {
    pub fn is_dot_or_dotdot(&self) -> bool {
        self.name == b"." || self.name == b".."
    }
}

/// Operations the export engine needs from a filesystem image.
///
/// Implementations own all on-disk decoding; the engine never touches raw
/// blocks except through these calls.
pub trait FilesystemAccess {
    /// Highest inode number in the filesystem
    fn inode_count(&self) -> u32;

    /// Every in-use inode, in inode-number order
    fn inodes(&self) -> Box<dyn Iterator<Item = Result<(u32, InodeRecord), FsError>> + '_>;

    fn read_inode(&self, ino: u32) -> Result<InodeRecord, FsError>;

    /// Whether the embedded pointer words of `inode` address data blocks
    fn has_valid_blocks(&self, inode: &InodeRecord) -> bool;

    /// Call `f(block, index)` for every mapped data block of `inode`, in file order
    fn iterate_blocks(
        &self,
        ino: u32,
        inode: &InodeRecord,
        f: &mut dyn FnMut(u64, u64),
    ) -> Result<(), FsError>;

    /// Decode the records stored in one directory data block
    fn directory_entries(&self, block: &DirectoryBlock) -> Result<Vec<RawDirEntry>, FsError>;

    /// Canonical absolute path of a directory inode; the root is `/`
    fn resolve_pathname(&self, dir: u32) -> Result<Vec<u8>, FsError>;

    /// Open the content of `inode` for sequential reading
    fn open_file<'a>(
        &'a self,
        ino: u32,
        inode: &InodeRecord,
    ) -> Result<Box<dyn Read + 'a>, FsError>;
}

/// Check whether an image carries an ext2/3/4 superblock
pub fn detect_filesystem(device_path: &Path) -> Result<bool> {
    let device = BlockDevice::open(device_path)?;
    Ok(ext::is_ext_superblock(&device))
}

/// Get human-readable file system information
pub fn get_filesystem_info(device_path: &Path) -> Result<String> {
    let fs = ext::ExtFilesystem::open(device_path)?;
    Ok(fs.describe())
}
