//! In-memory collaborators for engine tests

use std::cell::Cell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{self, Cursor, Read};

use crate::archive::{ArchiveEntry, ArchiveError, ArchiveWriter};
use crate::fs::{
    DirectoryBlock, FilesystemAccess, FsError, InodeRecord, RawDirEntry, EMBEDDED_CAPACITY,
    ROOT_INO,
};

/// Directory tree held in memory; directory blocks are slices of each
/// directory's entry list
pub(crate) struct MemoryFs {
    inodes: BTreeMap<u32, InodeRecord>,
    contents: HashMap<u32, Vec<u8>>,
    entries: HashMap<u32, Vec<RawDirEntry>>,
    parents: HashMap<u32, (u32, Vec<u8>)>,
    entries_per_block: usize,
    failing_blocks: HashSet<u32>,
    failing_decode: HashSet<u32>,
    failing_reads: HashSet<u32>,
    opens: Cell<usize>,
    resolves: Cell<usize>,
    next_ino: u32,
}

impl MemoryFs {
    pub fn new() -> Self {
        let mut fs = Self {
            inodes: BTreeMap::new(),
            contents: HashMap::new(),
            entries: HashMap::new(),
            parents: HashMap::new(),
            entries_per_block: 64,
            failing_blocks: HashSet::new(),
            failing_decode: HashSet::new(),
            failing_reads: HashSet::new(),
            opens: Cell::new(0),
            resolves: Cell::new(0),
            next_ino: 11,
        };
        fs.inodes.insert(ROOT_INO, record(0o040755, 0, 2));
        fs.entries.insert(ROOT_INO, dot_entries(ROOT_INO, ROOT_INO));
        fs
    }

    pub fn set_entries_per_block(&mut self, n: usize) {
        self.entries_per_block = n;
    }

    fn allocate(&mut self, parent: u32, name: &[u8], inode: InodeRecord) -> u32 {
        let ino = self.next_ino;
        self.next_ino += 1;
        self.inodes.insert(ino, inode);
        self.link(parent, name, ino);
        ino
    }

    fn link(&mut self, parent: u32, name: &[u8], ino: u32) {
        self.entries
            .get_mut(&parent)
            .expect("parent is not a directory")
            .push(RawDirEntry {
                inode: ino,
                name: name.to_vec(),
                file_type: 0,
            });
    }

    pub fn add_dir(&mut self, parent: u32, name: &[u8]) -> u32 {
        let ino = self.allocate(parent, name, record(0o040755, 0, 2));
        self.entries.insert(ino, dot_entries(ino, parent));
        self.parents.insert(ino, (parent, name.to_vec()));
        ino
    }

    pub fn add_file(&mut self, parent: u32, name: &[u8], content: &[u8]) -> u32 {
        let mut inode = record(0o100644, content.len() as u64, 1);
        inode.sectors = (content.len() as u64).div_ceil(512);
        let ino = self.allocate(parent, name, inode);
        self.contents.insert(ino, content.to_vec());
        ino
    }

    /// Another directory entry for an existing inode
    pub fn add_link(&mut self, parent: u32, name: &[u8], ino: u32) {
        self.link(parent, name, ino);
        if let Some(inode) = self.inodes.get_mut(&ino) {
            inode.links_count += 1;
        }
    }

    /// Targets shorter than the embedded storage are stored inline
    pub fn add_symlink(&mut self, parent: u32, name: &[u8], target: &[u8]) -> u32 {
        let mut inode = record(0o120777, target.len() as u64, 1);
        if !target.is_empty() && target.len() < EMBEDDED_CAPACITY {
            let mut bytes = [0u8; EMBEDDED_CAPACITY];
            bytes[..target.len()].copy_from_slice(target);
            for (word, chunk) in inode.block.iter_mut().zip(bytes.chunks_exact(4)) {
                *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            }
            self.allocate(parent, name, inode)
        } else {
            inode.sectors = 2;
            let ino = self.allocate(parent, name, inode);
            self.contents.insert(ino, target.to_vec());
            ino
        }
    }

    /// Device, fifo or socket node with raw embedded words
    pub fn add_node(&mut self, parent: u32, name: &[u8], mode: u16, words: &[u32]) -> u32 {
        let mut inode = record(mode, 0, 1);
        inode.block[..words.len()].copy_from_slice(words);
        self.allocate(parent, name, inode)
    }

    pub fn inode_mut(&mut self, ino: u32) -> &mut InodeRecord {
        self.inodes.get_mut(&ino).expect("no such inode")
    }

    /// Replace stored content without touching the declared size
    pub fn set_content(&mut self, ino: u32, content: &[u8]) {
        self.contents.insert(ino, content.to_vec());
    }

    pub fn fail_blocks_of(&mut self, dir: u32) {
        self.failing_blocks.insert(dir);
    }

    pub fn fail_decode_of(&mut self, dir: u32) {
        self.failing_decode.insert(dir);
    }

    pub fn fail_reads_of(&mut self, ino: u32) {
        self.failing_reads.insert(ino);
    }

    pub fn open_count(&self) -> usize {
        self.opens.get()
    }

    pub fn resolve_count(&self) -> usize {
        self.resolves.get()
    }

    fn block_count(&self, dir: u32) -> u64 {
        let n = self.entries.get(&dir).map_or(0, Vec::len);
        n.div_ceil(self.entries_per_block) as u64
    }
}

impl FilesystemAccess for MemoryFs {
    fn inode_count(&self) -> u32 {
        self.inodes.keys().next_back().copied().unwrap_or(0)
    }

    fn inodes(&self) -> Box<dyn Iterator<Item = Result<(u32, InodeRecord), FsError>> + '_> {
        Box::new(self.inodes.iter().map(|(ino, inode)| Ok((*ino, inode.clone()))))
    }

    fn read_inode(&self, ino: u32) -> Result<InodeRecord, FsError> {
        self.inodes
            .get(&ino)
            .cloned()
            .ok_or(FsError::InvalidInode(ino))
    }

    fn has_valid_blocks(&self, inode: &InodeRecord) -> bool {
        if inode.has_inline_data() {
            return false;
        }
        inode.is_dir() || inode.sectors > 0
    }

    fn iterate_blocks(
        &self,
        ino: u32,
        _inode: &InodeRecord,
        f: &mut dyn FnMut(u64, u64),
    ) -> Result<(), FsError> {
        if self.failing_blocks.contains(&ino) {
            return Err(FsError::corruption(ino as u64 * 1000, "bad extent header"));
        }
        for index in 0..self.block_count(ino) {
            f(ino as u64 * 1000 + index, index);
        }
        Ok(())
    }

    fn directory_entries(&self, block: &DirectoryBlock) -> Result<Vec<RawDirEntry>, FsError> {
        if self.failing_decode.contains(&block.dir) {
            return Err(FsError::corruption(block.block, "bad rec_len"));
        }
        let entries = self
            .entries
            .get(&block.dir)
            .ok_or_else(|| FsError::corruption(block.block, "not a directory block"))?;
        Ok(entries
            .chunks(self.entries_per_block)
            .nth(block.index as usize)
            .map(|chunk| chunk.to_vec())
            .unwrap_or_default())
    }

    fn resolve_pathname(&self, dir: u32) -> Result<Vec<u8>, FsError> {
        self.resolves.set(self.resolves.get() + 1);
        let mut components = Vec::new();
        let mut current = dir;
        while current != ROOT_INO {
            let (parent, name) = self
                .parents
                .get(&current)
                .ok_or(FsError::InvalidInode(current))?;
            components.push(name.clone());
            current = *parent;
        }
        if components.is_empty() {
            return Ok(b"/".to_vec());
        }
        let mut path = Vec::new();
        for name in components.iter().rev() {
            path.push(b'/');
            path.extend_from_slice(name);
        }
        Ok(path)
    }

    fn open_file<'a>(
        &'a self,
        ino: u32,
        _inode: &InodeRecord,
    ) -> Result<Box<dyn Read + 'a>, FsError> {
        self.opens.set(self.opens.get() + 1);
        if self.failing_reads.contains(&ino) {
            return Ok(Box::new(FailingReader));
        }
        let data = self.contents.get(&ino).cloned().unwrap_or_default();
        Ok(Box::new(Cursor::new(data)))
    }
}

struct FailingReader;

impl Read for FailingReader {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::Other, "media error"))
    }
}

fn record(mode: u16, size: u64, links: u16) -> InodeRecord {
    InodeRecord {
        mode,
        uid: 1000,
        gid: 1000,
        size,
        links_count: links,
        atime: 1_700_000_100,
        ctime: 1_700_000_200,
        mtime: 1_700_000_300,
        ..Default::default()
    }
}

fn dot_entries(ino: u32, parent: u32) -> Vec<RawDirEntry> {
    vec![
        RawDirEntry {
            inode: ino,
            name: b".".to_vec(),
            file_type: 2,
        },
        RawDirEntry {
            inode: parent,
            name: b"..".to_vec(),
            file_type: 2,
        },
    ]
}

/// Archive writer that keeps every member in memory
#[derive(Default)]
pub(crate) struct RecordingArchive {
    pub members: Vec<(ArchiveEntry, Vec<u8>)>,
    reject_paths: Vec<Vec<u8>>,
    broken_paths: Vec<Vec<u8>>,
    short_writes: bool,
}

impl RecordingArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail `write_header` for this member path
    pub fn reject(&mut self, path: &[u8]) {
        self.reject_paths.push(path.to_vec());
    }

    /// Fail `write_header` for this member path with an I/O error
    pub fn break_stream_at(&mut self, path: &[u8]) {
        self.broken_paths.push(path.to_vec());
    }

    /// Accept one byte less than offered on every data write
    pub fn short_writes(&mut self) {
        self.short_writes = true;
    }

    pub fn member(&self, path: &[u8]) -> Option<&(ArchiveEntry, Vec<u8>)> {
        self.members.iter().find(|(e, _)| e.pathname == path)
    }

    pub fn paths(&self) -> Vec<String> {
        self.members.iter().map(|(e, _)| e.display_path()).collect()
    }
}

impl ArchiveWriter for RecordingArchive {
    fn write_header(&mut self, entry: &ArchiveEntry) -> Result<(), ArchiveError> {
        if self.reject_paths.contains(&entry.pathname) {
            return Err(ArchiveError::InvalidPath(entry.display_path()));
        }
        if self.broken_paths.contains(&entry.pathname) {
            return Err(ArchiveError::Io(io::Error::new(
                io::ErrorKind::WriteZero,
                "archive stream closed",
            )));
        }
        self.members.push((entry.clone(), Vec::new()));
        Ok(())
    }

    fn write_data(&mut self, data: &[u8]) -> Result<usize, ArchiveError> {
        let taken = if self.short_writes {
            data.len().saturating_sub(1)
        } else {
            data.len()
        };
        if let Some((_, body)) = self.members.last_mut() {
            body.extend_from_slice(&data[..taken]);
        }
        Ok(taken)
    }
}
