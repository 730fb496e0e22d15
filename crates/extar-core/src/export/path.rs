//! Absolute paths for directory entries

use std::collections::{HashMap, VecDeque};

use crate::fs::FilesystemAccess;

use super::error::ExportError;

/// Joins an entry name onto its parent directory's canonical path.
///
/// Directory paths may be kept in a bounded cache for the run; with a
/// capacity of 0 every call asks the filesystem.
pub struct PathResolver<'a> {
    fs: &'a dyn FilesystemAccess,
    capacity: usize,
    cache: HashMap<u32, Vec<u8>>,
    order: VecDeque<u32>,
}

impl<'a> PathResolver<'a> {
    pub fn new(fs: &'a dyn FilesystemAccess, capacity: usize) -> Self {
        Self {
            fs,
            capacity,
            cache: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Absolute path of `name` inside directory `parent`. Names are taken
    /// verbatim.
    pub fn resolve(&mut self, parent: u32, name: &[u8]) -> Result<Vec<u8>, ExportError> {
        let mut path = self.directory_path(parent)?;
        if path != b"/" {
            path.push(b'/');
        }
        path.extend_from_slice(name);
        Ok(path)
    }

    fn directory_path(&mut self, dir: u32) -> Result<Vec<u8>, ExportError> {
        if let Some(path) = self.cache.get(&dir) {
            return Ok(path.clone());
        }

        let path = self
            .fs
            .resolve_pathname(dir)
            .map_err(|source| ExportError::PathResolution { dir, source })?;

        if self.capacity > 0 {
            if self.cache.len() >= self.capacity {
                if let Some(oldest) = self.order.pop_front() {
                    self.cache.remove(&oldest);
                }
            }
            self.cache.insert(dir, path.clone());
            self.order.push_back(dir);
        }
        Ok(path)
    }
}
