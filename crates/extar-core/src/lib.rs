use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Instant;

pub mod archive;
pub mod config;
pub mod export;
pub mod fs;

pub use archive::{ArchiveEntry, ArchiveError, ArchiveWriter, EntryKind, TarWriter};
pub use config::{ConfigError, ExportConfig};
pub use export::{
    Advisory, AdvisoryLog, ExportEngine, ExportError, ExportPhase, ExportProgress, ExportStats,
    Severity,
};
pub use fs::ext::ExtFilesystem;
pub use fs::{FileKind, FilesystemAccess, FsError, InodeRecord};

/// Outcome of a completed export
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportSummary {
    pub image: PathBuf,
    pub archive: PathBuf,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(flatten)]
    pub stats: ExportStats,
    /// Advisory messages in the order they were raised
    pub advisories: Vec<String>,
}

/// Export an ext2/3/4 image into a new tar archive
pub fn export_image(
    image: &Path,
    archive_path: &Path,
    config: &ExportConfig,
    progress: Option<&mut dyn FnMut(&ExportProgress)>,
) -> Result<ExportSummary, ExportError> {
    let started_at = Utc::now();
    let timer = Instant::now();
    tracing::info!(
        "Exporting {} to {}",
        image.display(),
        archive_path.display()
    );

    let filesystem = ExtFilesystem::open(image).map_err(|source| ExportError::OpenFilesystem {
        path: image.display().to_string(),
        source,
    })?;
    let mut writer = TarWriter::create(archive_path).map_err(|source| ExportError::OpenArchive {
        path: archive_path.display().to_string(),
        source,
    })?;

    let mut engine = ExportEngine::new(&filesystem, config.clone());
    if let Some(callback) = progress {
        engine.set_progress_callback(move |p: &ExportProgress| callback(p));
    }
    if filesystem.needs_recovery() {
        engine.record_advisory(Advisory::NeedsRecovery);
    }

    let stats = engine.run(&mut writer)?;
    writer.finish().map_err(ExportError::Finish)?;

    let advisories = engine.advisories().iter().map(|a| a.to_string()).collect();
    let summary = ExportSummary {
        image: image.to_path_buf(),
        archive: archive_path.to_path_buf(),
        started_at,
        duration_ms: timer.elapsed().as_millis() as u64,
        stats,
        advisories,
    };

    tracing::info!(
        "Wrote {} entries to {} in {} ms",
        summary.stats.entries_exported,
        archive_path.display(),
        summary.duration_ms
    );
    Ok(summary)
}
