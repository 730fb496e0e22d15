//! GNU tar serialization on top of the `tar` crate's header codec

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use ::tar::{EntryType, Header};

use super::{dev_major, dev_minor, ArchiveEntry, ArchiveError, ArchiveWriter, EntryKind};

const BLOCK_SIZE: usize = 512;
const NAME_FIELD_LEN: usize = 100;
const LONG_LINK_NAME: &[u8] = b"././@LongLink";

/// Streams members into a tar archive
pub struct TarWriter<W: Write> {
    out: W,
    /// Body bytes still expected for the current member
    remaining: u64,
    /// Zero bytes owed once the current body is complete
    padding: usize,
    entries: u64,
}

impl TarWriter<BufWriter<File>> {
    /// Create (or truncate) an archive file
    pub fn create<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write> TarWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            remaining: 0,
            padding: 0,
            entries: 0,
        }
    }

    /// Number of member headers written so far
    pub fn entries(&self) -> u64 {
        self.entries
    }

    /// Write the end-of-archive marker and flush
    pub fn finish(mut self) -> Result<W, ArchiveError> {
        if self.remaining > 0 {
            return Err(ArchiveError::IncompleteEntry {
                remaining: self.remaining,
            });
        }
        self.out.write_all(&[0u8; BLOCK_SIZE * 2])?;
        self.out.flush()?;
        Ok(self.out)
    }

    /// Encode every record of a member header, GNU long-name records first
    fn encode_header(entry: &ArchiveEntry) -> Result<Vec<u8>, ArchiveError> {
        let mut path = entry.pathname.clone();
        if entry.kind == EntryKind::Directory && !path.ends_with(b"/") {
            path.push(b'/');
        }
        if path.is_empty() || path == b"/" {
            return Err(ArchiveError::InvalidPath("empty member path".into()));
        }
        if path.contains(&0) {
            return Err(ArchiveError::InvalidPath(entry.display_path()));
        }

        let mut records = Vec::with_capacity(BLOCK_SIZE * 3);
        if path.len() > NAME_FIELD_LEN {
            records.extend(long_record(EntryType::GNULongName, &path));
        }

        let mut header = Header::new_gnu();
        let name_len = path.len().min(NAME_FIELD_LEN);
        header.as_old_mut().name[..name_len].copy_from_slice(&path[..name_len]);
        header.set_mode(entry.mode & 0o7777);
        header.set_uid(entry.uid as u64);
        header.set_gid(entry.gid as u64);
        header.set_size(entry.data_len());
        header.set_mtime(clamp_time(entry.mtime));
        if let Some(gnu) = header.as_gnu_mut() {
            gnu.set_atime(clamp_time(entry.atime));
            gnu.set_ctime(clamp_time(entry.ctime));
        }

        match entry.kind {
            EntryKind::Directory => header.set_entry_type(EntryType::Directory),
            EntryKind::Regular => header.set_entry_type(EntryType::Regular),
            EntryKind::Symlink => {
                header.set_entry_type(EntryType::Symlink);
                let target = entry.symlink.as_ref().ok_or_else(|| ArchiveError::MissingField {
                    kind: entry.kind,
                    path: entry.display_path(),
                    field: "symlink target",
                })?;
                if target.contains(&0) {
                    return Err(ArchiveError::InvalidLink(
                        String::from_utf8_lossy(target).into_owned(),
                    ));
                }
                if target.len() > NAME_FIELD_LEN {
                    records.extend(long_record(EntryType::GNULongLink, target));
                }
                let link_len = target.len().min(NAME_FIELD_LEN);
                header.as_old_mut().linkname[..link_len].copy_from_slice(&target[..link_len]);
            }
            EntryKind::CharDevice | EntryKind::BlockDevice => {
                header.set_entry_type(if entry.kind == EntryKind::CharDevice {
                    EntryType::Char
                } else {
                    EntryType::Block
                });
                let rdev = entry.rdev.ok_or_else(|| ArchiveError::MissingField {
                    kind: entry.kind,
                    path: entry.display_path(),
                    field: "device number",
                })?;
                header.set_device_major(dev_major(rdev))?;
                header.set_device_minor(dev_minor(rdev))?;
            }
        }

        header.set_cksum();
        records.extend_from_slice(header.as_bytes());
        Ok(records)
    }
}

impl<W: Write> ArchiveWriter for TarWriter<W> {
    fn write_header(&mut self, entry: &ArchiveEntry) -> Result<(), ArchiveError> {
        if self.remaining > 0 {
            return Err(ArchiveError::IncompleteEntry {
                remaining: self.remaining,
            });
        }

        // Fully encoded before any byte is written, so a rejected entry
        // leaves the archive untouched
        let records = Self::encode_header(entry)?;
        self.out.write_all(&records)?;

        let len = entry.data_len();
        self.remaining = len;
        self.padding = (BLOCK_SIZE - (len % BLOCK_SIZE as u64) as usize) % BLOCK_SIZE;
        self.entries += 1;
        Ok(())
    }

    fn write_data(&mut self, data: &[u8]) -> Result<usize, ArchiveError> {
        let n = (data.len() as u64).min(self.remaining) as usize;
        self.out.write_all(&data[..n])?;
        self.remaining -= n as u64;

        if self.remaining == 0 && self.padding > 0 {
            self.out.write_all(&[0u8; BLOCK_SIZE][..self.padding])?;
            self.padding = 0;
        }
        Ok(n)
    }
}

/// A `././@LongLink` pseudo-member carrying a name that overflows its field
fn long_record(kind: EntryType, value: &[u8]) -> Vec<u8> {
    let mut header = Header::new_gnu();
    header.as_old_mut().name[..LONG_LINK_NAME.len()].copy_from_slice(LONG_LINK_NAME);
    header.set_mode(0o644);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    header.set_size(value.len() as u64 + 1);
    header.set_entry_type(kind);
    header.set_cksum();

    let mut record = header.as_bytes().to_vec();
    record.extend_from_slice(value);
    record.push(0);
    let padded = record.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
    record.resize(padded, 0);
    record
}

fn clamp_time(seconds: i64) -> u64 {
    seconds.max(0) as u64
}
