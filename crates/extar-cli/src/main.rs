use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use extar_core::{export_image, ExportConfig, ExportPhase, ExportProgress};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::Level;

#[derive(Parser, Debug)]
#[command(
	name = "extar",
	version,
	about = "Export an ext2/3/4 image into a tar archive without mounting it"
)]
struct Cli {
	/// Path to the filesystem image
	image: PathBuf,
	/// Tar archive to create (overwritten if it exists)
	archive: PathBuf,
	/// JSON config file (defaults to the per-user config when present)
	#[arg(long)]
	config: Option<PathBuf>,
	/// Show filesystem information before exporting
	#[arg(long)]
	info: bool,
	/// Print the run summary as JSON
	#[arg(long)]
	json: bool,
	/// Log every entry
	#[arg(short, long, conflicts_with = "quiet")]
	verbose: bool,
	/// Only log advisories and errors
	#[arg(short, long)]
	quiet: bool,
	/// Never show the progress spinner
	#[arg(long)]
	no_progress: bool,
}

fn main() -> ExitCode {
	let cli = Cli::parse();

	let level = if cli.verbose {
		Level::DEBUG
	} else if cli.quiet {
		Level::WARN
	} else {
		Level::INFO
	};
	tracing_subscriber::fmt()
		.with_max_level(level)
		.with_writer(std::io::stdout)
		.init();

	match run(&cli) {
		Ok(()) => ExitCode::SUCCESS,
		Err(e) => {
			tracing::error!("{:#}", e);
			eprintln!("❌ Export failed: {:#}", e);
			ExitCode::FAILURE
		}
	}
}

fn run(cli: &Cli) -> Result<()> {
	let config = ExportConfig::load(cli.config.as_deref())?;

	if !extar_core::fs::detect_filesystem(&cli.image)
		.with_context(|| format!("cannot read {}", cli.image.display()))?
	{
		bail!("{} does not contain an ext2/3/4 filesystem", cli.image.display());
	}

	if cli.info {
		let info = extar_core::fs::get_filesystem_info(&cli.image)?;
		println!("📋 File System Information:");
		println!("{}", info);
		println!();
	}

	let spinner = if !cli.no_progress && !cli.quiet && atty::is(atty::Stream::Stderr) {
		let bar = ProgressBar::new_spinner();
		if let Ok(style) = ProgressStyle::with_template("{spinner} [{elapsed}] {msg}") {
			bar.set_style(style);
		}
		bar.enable_steady_tick(Duration::from_millis(120));
		Some(bar)
	} else {
		None
	};

	let mut on_progress = |p: &ExportProgress| {
		if let Some(bar) = &spinner {
			let message = match p.phase {
				ExportPhase::ScanningInodes => "scanning inodes".to_string(),
				ExportPhase::ExportingEntries => format!(
					"{} entries exported ({} directory blocks){}",
					p.entries_exported,
					p.directory_blocks,
					p.current_path
						.as_deref()
						.map(|path| format!(" {path}"))
						.unwrap_or_default()
				),
				ExportPhase::Complete => format!("{} entries exported", p.entries_exported),
			};
			bar.set_message(message);
		}
	};

	let result = export_image(&cli.image, &cli.archive, &config, Some(&mut on_progress));
	if let Some(bar) = &spinner {
		bar.finish_and_clear();
	}
	let summary = result?;

	if cli.json {
		println!("{}", serde_json::to_string_pretty(&summary)?);
		return Ok(());
	}

	println!("✅ Export completed successfully!");
	println!("📦 Archive: {}", summary.archive.display());
	println!("🕒 Started: {}", summary.started_at.to_rfc3339());
	println!("⏱️  Duration: {} ms", summary.duration_ms);
	println!("🔍 Inodes Scanned: {}", summary.stats.inodes_scanned);
	println!(
		"📁 Directories: {} ({} blocks)",
		summary.stats.directories, summary.stats.directory_blocks
	);
	println!("📄 Entries Exported: {}", summary.stats.entries_exported);
	println!("💾 Content Bytes: {}", summary.stats.bytes_written);
	if summary.stats.entries_skipped > 0 {
		println!("⚠️  Entries Skipped: {}", summary.stats.entries_skipped);
	}
	if !summary.advisories.is_empty() {
		println!("⚠️  Advisories: {}", summary.advisories.len());
		for advisory in &summary.advisories {
			println!("   - {}", advisory);
		}
	}
	Ok(())
}
