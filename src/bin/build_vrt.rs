use anyhow::Result;
use bluetopo::data_source::DataSources;
use bluetopo::logging;
use bluetopo::vrt::gdal::GdalCli;
use bluetopo::vrt::{self, VrtOptions};
use clap::Parser;
use std::path::PathBuf;

/// Build UTM and subregion VRTs over tiles fetched with fetch_tiles.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Project directory previously populated by fetch_tiles
    #[arg(short, long)]
    dir: PathBuf,

    /// Data source name
    #[arg(short, long, default_value = "bluetopo")]
    target: String,

    /// Reference source files by absolute path instead of relative to each VRT
    #[arg(long)]
    absolute: bool,

    /// TOML file adding or overriding data sources
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let args = Args::parse();

    let source = DataSources::load(args.config.as_deref())?.get(&args.target)?;
    let tools = GdalCli::default();
    tools.check().await?;

    let options = VrtOptions {
        root: args.dir,
        relative_to_vrt: !args.absolute,
    };
    vrt::build_vrts(&tools, &source, &options).await?;
    Ok(())
}
