//! Traversal and export engine
//!
//! Phase 1 ([`InodeScanner`]) registers the data blocks of every directory.
//! Phase 2 ([`DirectoryIterator`]) replays them, and each entry is resolved
//! to a path, classified and written to the archive.

use serde::{Deserialize, Serialize};

use crate::archive::ArchiveWriter;
use crate::config::ExportConfig;
use crate::fs::FilesystemAccess;

mod classify;
mod device;
mod dir_iter;
mod error;
mod exporter;
mod path;
mod scanner;
mod symlink;

#[cfg(test)]
pub(crate) mod testing;

pub use classify::{Classified, InodeClassifier};
pub use device::{DeviceEncoding, DeviceNumber};
pub use dir_iter::{DirectoryEntry, DirectoryIterator};
pub use error::{Advisory, AdvisoryLog, ExportError, Severity};
pub use exporter::{ArchiveExporter, CONTENT_CHUNK_SIZE};
pub use path::PathResolver;
pub use scanner::{DirectoryBlockList, InodeScanner};
pub use symlink::{SymlinkResolver, SymlinkStorage};

pub use crate::fs::DirectoryBlock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExportPhase {
    ScanningInodes,
    ExportingEntries,
    Complete,
}

impl std::fmt::Display for ExportPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExportPhase::ScanningInodes => write!(f, "scanning inodes"),
            ExportPhase::ExportingEntries => write!(f, "exporting entries"),
            ExportPhase::Complete => write!(f, "complete"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExportProgress {
    pub phase: ExportPhase,
    pub inodes_scanned: u64,
    pub directory_blocks: u64,
    pub entries_exported: u64,
    pub current_path: Option<String>,
}

/// Counters of one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportStats {
    pub inodes_scanned: u64,
    pub directories: u64,
    pub directory_blocks: u64,
    /// Directory entries seen in phase 2
    pub entries_seen: u64,
    pub entries_exported: u64,
    /// Entries abandoned after an advisory error
    pub entries_skipped: u64,
    /// Regular-file content bytes written
    pub bytes_written: u64,
}

/// Runs both phases against one filesystem and one archive
pub struct ExportEngine<'a> {
    fs: &'a dyn FilesystemAccess,
    config: ExportConfig,
    advisories: AdvisoryLog,
    stats: ExportStats,
    progress_callback: Option<Box<dyn FnMut(&ExportProgress) + 'a>>,
}

impl<'a> ExportEngine<'a> {
    pub fn new(fs: &'a dyn FilesystemAccess, config: ExportConfig) -> Self {
        Self {
            fs,
            config,
            advisories: AdvisoryLog::new(),
            stats: ExportStats::default(),
            progress_callback: None,
        }
    }

    pub fn set_progress_callback<F>(&mut self, callback: F)
    where
        F: FnMut(&ExportProgress) + 'a,
    {
        self.progress_callback = Some(Box::new(callback));
    }

    /// Note a run-level condition before the run starts
    pub fn record_advisory(&mut self, advisory: Advisory) {
        self.advisories.record(advisory);
    }

    pub fn advisories(&self) -> &AdvisoryLog {
        &self.advisories
    }

    pub fn stats(&self) -> &ExportStats {
        &self.stats
    }

    /// Consume the engine, keeping its advisories
    pub fn into_advisories(self) -> AdvisoryLog {
        self.advisories
    }

    /// Export every reachable object into `archive`.
    ///
    /// Advisory-severity errors abandon the current entry and are logged;
    /// the first fatal error ends the run.
    pub fn run(&mut self, archive: &mut dyn ArchiveWriter) -> Result<ExportStats, ExportError> {
        self.emit_progress(ExportPhase::ScanningInodes, None);
        let blocks = InodeScanner::new(self.fs).scan(&mut self.advisories)?;
        self.stats.inodes_scanned = blocks.inodes_scanned();
        self.stats.directories = blocks.directories();
        self.stats.directory_blocks = blocks.len() as u64;

        tracing::info!("Exporting entries from {} directory blocks", blocks.len());
        self.emit_progress(ExportPhase::ExportingEntries, None);

        let fs = self.fs;
        let mut resolver = PathResolver::new(fs, self.config.path_cache_capacity);
        let classifier = InodeClassifier::new(fs);
        let mut exporter = ArchiveExporter::new(fs, archive);

        for item in DirectoryIterator::new(fs, blocks) {
            let entry = item?;
            self.stats.entries_seen += 1;
            let path = resolver.resolve(entry.parent, &entry.name)?;

            let outcome = classifier
                .classify(&entry, &path, &mut self.advisories)
                .and_then(|c| {
                    exporter.export(c.ino, &c.record, c.kind, &path, &mut self.advisories)
                });

            match outcome {
                Ok(bytes) => {
                    self.stats.entries_exported += 1;
                    self.stats.bytes_written += bytes;
                }
                Err(e) => match e.severity() {
                    Severity::Advisory => {
                        self.stats.entries_skipped += 1;
                        self.advisories.record(Advisory::EntrySkipped(e));
                    }
                    Severity::Fatal => {
                        tracing::error!(code = e.to_errno(), "{}", e);
                        return Err(e);
                    }
                },
            }

            let interval = self.config.progress_interval;
            if interval > 0 && self.stats.entries_seen % interval == 0 {
                let current = String::from_utf8_lossy(&path).into_owned();
                self.emit_progress(ExportPhase::ExportingEntries, Some(current));
            }
        }

        tracing::info!(
            "Export complete: {} entries exported, {} skipped, {} bytes of content, {} advisories",
            self.stats.entries_exported,
            self.stats.entries_skipped,
            self.stats.bytes_written,
            self.advisories.len()
        );
        self.emit_progress(ExportPhase::Complete, None);
        Ok(self.stats.clone())
    }

    fn emit_progress(&mut self, phase: ExportPhase, current_path: Option<String>) {
        if let Some(callback) = self.progress_callback.as_mut() {
            callback(&ExportProgress {
                phase,
                inodes_scanned: self.stats.inodes_scanned,
                directory_blocks: self.stats.directory_blocks,
                entries_exported: self.stats.entries_exported,
                current_path,
            });
        }
    }
}

/// Export with a fresh engine, returning the counters and advisories
pub fn run_export(
    fs: &dyn FilesystemAccess,
    archive: &mut dyn ArchiveWriter,
    config: &ExportConfig,
) -> Result<(ExportStats, AdvisoryLog), ExportError> {
    let mut engine = ExportEngine::new(fs, config.clone());
    let stats = engine.run(archive)?;
    Ok((stats, engine.into_advisories()))
}
