use anyhow::Result;
use bluetopo::data_source::DataSources;
use bluetopo::logging;
use bluetopo::s3::Provider;
use bluetopo::sync::{self, FetchOptions};
use clap::Parser;
use std::path::PathBuf;
use tracing::warn;

/// Discover, track and download National Bathymetric Source tiles.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Project directory holding the registry and downloaded tiles
    #[arg(short, long)]
    dir: PathBuf,

    /// Area of interest (any vector format GDAL reads) whose tiles should be tracked
    #[arg(short, long)]
    geom: Option<PathBuf>,

    /// Data source name
    #[arg(short, long, default_value = "bluetopo")]
    target: String,

    /// Untrack tiles whose files have gone missing from the project directory
    #[arg(short, long)]
    untrack: bool,

    /// Write the fetch plan without downloading anything
    #[arg(long)]
    dry_run: bool,

    /// TOML file adding or overriding data sources
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let args = Args::parse();

    let sources = DataSources::load(args.config.as_deref())?;
    let source = sources.get(&args.target)?;
    let provider = Provider::for_source(&source).await;

    let options = FetchOptions {
        root: args.dir,
        geometry: args.geom,
        untrack_missing: args.untrack,
        dry_run: args.dry_run,
    };
    let summary = sync::fetch_tiles(&provider, &source, &options).await?;
    for failure in &summary.report.failed {
        warn!("{}", failure);
    }
    Ok(())
}
