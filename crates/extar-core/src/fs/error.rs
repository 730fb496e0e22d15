use thiserror::Error;

/// Errors raised by the filesystem access layer.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The image is not a filesystem this reader understands.
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Live metadata failed validation at a known block.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    #[error("read beyond end of device: {end} > {size}")]
    OutOfBounds { end: u64, size: u64 },

    #[error("inode {0} is out of range")]
    InvalidInode(u32),

    #[error("unsupported feature: {0}")]
    Unsupported(String),
}

impl FsError {
    pub fn corruption(block: u64, detail: impl Into<String>) -> Self {
        FsError::Corruption {
            block,
            detail: detail.into(),
        }
    }

    /// POSIX errno closest to this error, used as the advisory log code.
    pub fn to_errno(&self) -> i32 {
        match self {
            FsError::Io(e) => e.raw_os_error().unwrap_or(5),
            FsError::Format(_) => 22,
            FsError::Corruption { .. } => 5,
            FsError::OutOfBounds { .. } => 5,
            FsError::InvalidInode(_) => 22,
            FsError::Unsupported(_) => 95,
        }
    }
}
