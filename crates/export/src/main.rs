//! saga-export - exports a legacy saga table snapshot into saga documents
//!
//! Reads a JSONL dump of the legacy table (one row per line), filters out
//! secondary index rows, remaps row identities to deterministic saga ids
//! and writes one JSON document per saga into a per-table subdirectory of
//! the working directory.

use std::path::PathBuf;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use sagastore_export::{
    DocumentWriter, ExportOptions, ExportedDocument, IdRemapPolicy, JsonlTableScan, TableExporter,
    DEFAULT_MAX_CONCURRENCY,
};

#[derive(Parser)]
#[command(name = "saga-export")]
#[command(about = "Exports a legacy saga table snapshot into saga documents", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the JSONL snapshot of the legacy table
    source: PathBuf,

    /// Name of the legacy table, used as the output subdirectory
    table: String,

    /// Directory the per-table output directory is created under
    #[arg(short, long, default_value = ".")]
    working_dir: PathBuf,

    /// How many rows may be transformed and written at the same time
    #[arg(long, default_value_t = DEFAULT_MAX_CONCURRENCY)]
    max_concurrency: usize,

    /// Rows per scan page
    #[arg(long, default_value_t = 1000)]
    page_size: usize,

    /// Fail rows without a secondary index marker instead of keeping their id
    #[arg(long)]
    require_marker: bool,

    /// Keep string cells that look like quoted JSON strings as they are
    #[arg(long)]
    no_quoted_sniffing: bool,

    /// Verbose logging (overridden by RUST_LOG when set)
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!(source = %cli.source.display(), "loading table snapshot");
    let scan = JsonlTableScan::open(&cli.source, cli.page_size)?;
    println!(
        "📄 Loaded {} rows from {}",
        scan.row_count(),
        cli.source.display()
    );

    let policy = if cli.require_marker {
        IdRemapPolicy::RequireMarker
    } else {
        IdRemapPolicy::WhenMarkerPresent
    };
    let options = ExportOptions::new()
        .with_max_concurrency(cli.max_concurrency)
        .with_id_remap(policy)
        .with_quoted_string_sniffing(!cli.no_quoted_sniffing);

    let output_dir = cli.working_dir.join(&cli.table);
    let exporter = TableExporter::new(scan, DocumentWriter::new(&output_dir), options)?;

    let cancel = exporter.cancel_signal();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n⚠️  Cancelling export, waiting for in-flight writes...");
            cancel.cancel();
        }
    });

    let (tx, mut rx) = mpsc::unbounded_channel::<ExportedDocument>();
    let progress = tokio::spawn(async move {
        let mut count = 0usize;
        while let Some(exported) = rx.recv().await {
            count += 1;
            println!("   [{count}] {}", exported.path.display());
        }
    });

    match exporter.run_with_progress(Some(tx)).await {
        Ok(summary) => {
            let _ = progress.await;
            println!("✅ Export complete!");
            println!("   Pages scanned: {}", summary.pages);
            println!("   Index rows skipped: {}", summary.skipped_index_rows);
            println!("   Documents written: {}", summary.exported_count());
            println!("   Output directory: {}", output_dir.display());
            Ok(())
        }
        Err(error) => {
            let _ = progress.await;
            eprintln!("❌ Export failed: {error}");
            std::process::exit(1);
        }
    }
}
