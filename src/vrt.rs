//! Builds the VRT hierarchy over fetched tiles: per-resolution and complete VRTs for each
//! subregion, then one VRT per UTM zone carrying the combined contributor table.
pub mod gdal;
pub mod xml;

use crate::data_source::DataSource;
use crate::error::VrtError;
use crate::registry::{Registry, SubregionVrt, TrackedTile, UtmVrt};
use anyhow::{anyhow, Context, Result};
use gdal::RasterTools;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};
use xml::{RasterAttributeTable, CONTRIBUTOR_BAND};

const COMPLETE_LEVELS: [u32; 1] = [16];
const UTM_LEVELS: [u32; 2] = [32, 64];

#[derive(Debug, Clone)]
pub struct VrtOptions {
    pub root: PathBuf,
    pub relative_to_vrt: bool,
}

#[derive(Debug, Default)]
pub struct VrtSummary {
    pub missing_subregions: usize,
    pub built_subregions: Vec<String>,
    pub missing_utms: usize,
    pub built_utms: Vec<String>,
}

/// Overview levels for tiles of a resolution that get their own VRT. Other resolutions
/// go straight into the complete VRT.
fn resolution_levels(resolution: u32) -> Option<&'static [u32]> {
    match resolution {
        2 => Some(&[2, 4]),
        4 => Some(&[4, 8]),
        8 => Some(&[8]),
        _ => None,
    }
}

/// Leading number of a resolution label such as `4m`.
fn parse_resolution(label: &str) -> Option<u32> {
    let digits: String = label.trim().chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

pub async fn build_vrts(
    tools: &impl RasterTools,
    source: &DataSource,
    options: &VrtOptions,
) -> Result<VrtSummary> {
    let start = Instant::now();
    if !options.root.is_dir() {
        return Err(anyhow!("Folder path not found: {}", options.root.display()));
    }
    if !Registry::path(&options.root, source).is_file() {
        return Err(anyhow!(
            "SQLite database not found. Confirm correct folder. \
             Note: fetch_tiles must be run at least once prior to build_vrt"
        ));
    }
    let root = fs::canonicalize(&options.root)?;
    info!("{}: Beginning work in project folder: {}", source.name, root.display());
    let registry = Registry::open(&root, source)?;
    let mut summary = VrtSummary::default();

    for subregion in registry.subregions(true)? {
        if subregion.is_missing_files(&root) {
            registry.reset_subregion(&subregion)?;
            summary.missing_subregions += 1;
        }
    }
    if summary.missing_subregions > 0 {
        info!(
            "{} subregion vrts files missing. Added to build list.",
            summary.missing_subregions
        );
    }

    let unbuilt = registry.subregions(false)?;
    if unbuilt.is_empty() {
        info!("Subregion vrt(s) appear up to date with the most recently fetched tiles.");
    } else {
        info!("Building {} subregion vrt(s)", unbuilt.len());
    }
    for subregion in unbuilt {
        let tiles = tiles_on_disk(&root, registry.tiles_in_subregion(&subregion.region)?);
        if tiles.is_empty() {
            continue;
        }
        let built = build_subregion(tools, &root, source, &subregion, &tiles, options.relative_to_vrt)
            .await
            .with_context(|| format!("VRT failed to build for subregion {}", subregion.region))?;
        registry.update_subregion(&built)?;
        summary.built_subregions.push(built.region);
    }

    for utm in registry.utms(true)? {
        if utm.is_missing_files(&root) {
            registry.reset_utm(&utm.utm)?;
            summary.missing_utms += 1;
        }
    }
    if summary.missing_utms > 0 {
        info!("{} utm vrts files missing. Added to build list.", summary.missing_utms);
    }

    let unbuilt = registry.utms(false)?;
    if unbuilt.is_empty() {
        info!(
            "UTM vrt(s) appear up to date with the most recently fetched tiles. \
             Deleting the {} folder will allow you to recreate from scratch if necessary",
            source.vrt_dir_name()
        );
    }
    for utm in unbuilt {
        let utm_start = Instant::now();
        let subregions = registry.built_subregions_in_utm(&utm.utm)?;
        if let Some(missing) = subregions.iter().find(|s| s.is_missing_files(&root)) {
            return Err(anyhow!(
                "Subregion VRT files missing for {} in UTM {}. Please rerun.",
                missing.region,
                utm.utm
            ));
        }
        let inputs: Vec<PathBuf> = subregions
            .iter()
            .filter_map(|s| s.complete_vrt.as_deref())
            .map(|p| root.join(p))
            .collect();
        if inputs.is_empty() {
            continue;
        }

        info!("Building utm{}...", utm.utm);
        let built = build_utm(tools, &root, source, &registry, &utm, &inputs, options.relative_to_vrt)
            .await
            .with_context(|| format!("VRT failed to build for utm{}", utm.utm))?;
        registry.update_utm(&built)?;
        info!("utm{} complete after {:.1?}", utm.utm, utm_start.elapsed());
        summary.built_utms.push(built.utm);
    }

    info!("{}: Operation complete after {:.1?}", source.name, start.elapsed());
    Ok(summary)
}

fn tiles_on_disk(root: &Path, tiles: Vec<TrackedTile>) -> Vec<TrackedTile> {
    let total = tiles.len();
    let existing: Vec<TrackedTile> = tiles.into_iter().filter(|t| t.files_on_disk(root)).collect();
    if existing.len() < total {
        warn!(
            "Did not find the files for {} registered tile(s). Run fetch_tiles to retrieve files \
             or correct the directory path if incorrect.",
            total - existing.len()
        );
    }
    existing
}

fn existing_ovr(root: &Path, vrt: &str) -> Option<String> {
    let ovr = format!("{vrt}.ovr");
    root.join(&ovr).is_file().then_some(ovr)
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e).with_context(|| {
            format!("Failed to remove older vrt file {}. Please close all files and attempt again", path.display())
        }),
        _ => Ok(()),
    }
}

/// Builds one VRT with band descriptions and overviews, replacing any earlier version.
async fn build_one(
    tools: &impl RasterTools,
    inputs: &[PathBuf],
    vrt: &Path,
    levels: &[u32],
    relative_to_vrt: bool,
) -> Result<()> {
    remove_if_exists(vrt)?;
    let mut ovr = vrt.as_os_str().to_owned();
    ovr.push(".ovr");
    remove_if_exists(Path::new(&ovr))?;

    tools.build_vrt(inputs, vrt, relative_to_vrt).await?;
    xml::rewrite(vrt, xml::set_band_descriptions)?;
    tools.build_overviews(vrt, levels).await
}

async fn build_subregion(
    tools: &impl RasterTools,
    root: &Path,
    source: &DataSource,
    subregion: &SubregionVrt,
    tiles: &[TrackedTile],
    relative_to_vrt: bool,
) -> Result<SubregionVrt> {
    let region = &subregion.region;
    let rel_dir = format!("{}/{}", source.vrt_dir_name(), region);
    let dir = root.join(&rel_dir);
    if dir.is_dir() {
        fs::remove_dir_all(&dir).with_context(|| {
            format!("Failed to remove older vrt files for {}. Please close all files and attempt again", region)
        })?;
    }
    fs::create_dir_all(&dir)?;

    let mut groups: BTreeMap<u32, Vec<PathBuf>> = BTreeMap::new();
    let mut direct = vec![];
    for tile in tiles {
        let Some(geotiff) = &tile.geotiff_disk else {
            continue;
        };
        let path = root.join(geotiff);
        match tile.resolution.as_deref().and_then(parse_resolution) {
            Some(res) if resolution_levels(res).is_some() => groups.entry(res).or_default().push(path),
            _ => direct.push(path),
        }
    }

    let mut built = SubregionVrt {
        region: region.clone(),
        utm: subregion.utm.clone(),
        built: true,
        ..Default::default()
    };
    let mut complete_inputs = vec![];
    for (res, inputs) in groups {
        let levels = resolution_levels(res).unwrap_or(&[]);
        info!("Building {} band {}m...", region, res);
        let rel = format!("{}/{}_{}m.vrt", rel_dir, region, res);
        build_one(tools, &inputs, &root.join(&rel), levels, relative_to_vrt).await?;
        let ovr = existing_ovr(root, &rel);
        complete_inputs.push(root.join(&rel));
        match res {
            2 => (built.res_2_vrt, built.res_2_ovr) = (Some(rel), ovr),
            4 => (built.res_4_vrt, built.res_4_ovr) = (Some(rel), ovr),
            _ => (built.res_8_vrt, built.res_8_ovr) = (Some(rel), ovr),
        }
    }
    complete_inputs.extend(direct);

    let rel = format!("{}/{}_complete.vrt", rel_dir, region);
    build_one(tools, &complete_inputs, &root.join(&rel), &COMPLETE_LEVELS, relative_to_vrt).await?;
    built.complete_ovr = existing_ovr(root, &rel);
    built.complete_vrt = Some(rel);
    Ok(built)
}

async fn build_utm(
    tools: &impl RasterTools,
    root: &Path,
    source: &DataSource,
    registry: &Registry,
    utm: &UtmVrt,
    inputs: &[PathBuf],
    relative_to_vrt: bool,
) -> Result<UtmVrt> {
    let rel = format!(
        "{}/{}_Fetched_UTM{}.vrt",
        source.vrt_dir_name(),
        source.name,
        utm.utm
    );
    let vrt = root.join(&rel);
    build_one(tools, inputs, &vrt, &UTM_LEVELS, relative_to_vrt).await?;

    let rat = contributor_table(root, registry, &utm.utm)?;
    xml::rewrite(&vrt, |content, name| {
        xml::attach_rat(content, name, CONTRIBUTOR_BAND, &rat)
    })?;

    let ovr = existing_ovr(root, &rel).ok_or_else(|| VrtError::MissingOverview(rel.clone()))?;
    Ok(UtmVrt {
        utm: utm.utm.clone(),
        utm_vrt: Some(rel),
        utm_ovr: Some(ovr),
        built: true,
    })
}

/// Contributor rows of every fetched tile in the zone, merged by value.
fn contributor_table(root: &Path, registry: &Registry, utm: &str) -> Result<RasterAttributeTable> {
    let mut table = RasterAttributeTable::default();
    for tile in registry.tiles_in_utm(utm)? {
        if !tile.files_on_disk(root) {
            continue;
        }
        let Some(rat) = &tile.rat_disk else {
            continue;
        };
        table.merge(RasterAttributeTable::read_aux_xml(&root.join(rat))?);
    }
    Ok(table)
}
