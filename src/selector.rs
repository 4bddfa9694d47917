//! Choosing tiles: which catalog tiles the area of interest covers, and what each
//! tracked tile needs to be brought up to date.
use crate::aoi::AreaOfInterest;
use crate::catalog::{Catalog, TileAsset, TileRecord};
use crate::data_source::DataSource;
use crate::download_plan::{DownloadPlan, DownloadTask, TileTask};
use crate::geometry::BoundingBox;
use crate::registry::{Registry, TrackedTile};
use crate::subregion;
use anyhow::{anyhow, Result};
use std::path::Path;
use tracing::{info, warn};

/// Catalog tiles whose footprint touches or overlaps the area of interest.
pub fn select<'c>(aoi: &AreaOfInterest, catalog: &'c Catalog) -> Vec<&'c TileRecord> {
    let Some(aoi_bbox) = aoi.bbox() else {
        return vec![];
    };
    catalog
        .iter()
        .filter(|record| {
            !record.footprint.is_empty()
                && BoundingBox::of(&record.footprint).intersects(&aoi_bbox)
                && aoi.intersects(&record.footprint)
        })
        .collect()
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct TrackOutcome {
    pub intersected: usize,
    pub available: usize,
    pub newly_tracked: usize,
}

/// Adds the available tiles among `selected` to the registry.
pub fn track(registry: &Registry, selected: &[&TileRecord]) -> Result<TrackOutcome> {
    let available: Vec<&str> = selected
        .iter()
        .filter(|r| r.is_available())
        .map(|r| r.tile.as_str())
        .collect();
    let newly_tracked = registry.track(available.iter().copied())?;
    let outcome = TrackOutcome {
        intersected: selected.len(),
        available: available.len(),
        newly_tracked,
    };
    info!(
        "Tracking {} available tile(s) discovered in a total of {} intersected tile(s), {} new",
        outcome.available, outcome.intersected, outcome.newly_tracked
    );
    Ok(outcome)
}

/// Compares every tracked tile against the catalog.
pub fn plan(
    root: &Path,
    source: &DataSource,
    catalog: &Catalog,
    tracked: &[TrackedTile],
) -> DownloadPlan {
    let mut plan = DownloadPlan::new(&source.name);
    for tile in tracked {
        let name = &tile.tilename;
        let Some(record) = catalog.get(name) else {
            warn!("{} in registry appears to have been removed from the latest tile scheme", name);
            plan.untouched.push(name.clone());
            continue;
        };
        let Some(delivered) = &record.delivered_date else {
            warn!("Unexpected removal of delivered date for tile {}", name);
            plan.untouched.push(name.clone());
            continue;
        };

        let changed = tile.delivered_date.as_ref() != Some(delivered);
        if !changed && tile.files_on_disk(root) {
            plan.existing.push(name.clone());
            continue;
        }

        match tile_task(source, record, tile) {
            Ok(task) => plan.tasks.push(task),
            Err(e) => {
                warn!("Unable to schedule {}: {:#}", name, e);
                plan.untouched.push(name.clone());
            }
        }
    }
    plan
}

fn tile_task(source: &DataSource, record: &TileRecord, current: &TrackedTile) -> Result<TileTask> {
    let (Some(geotiff), Some(rat)) = (&record.geotiff, &record.rat) else {
        return Err(anyhow!("missing download links"));
    };
    let subregion = subregion::locate(&record.footprint)?;
    let utm = record.utm.clone().unwrap_or(subregion.utm_zone);

    let download = |asset: &TileAsset| -> Result<DownloadTask> {
        let file_name = asset
            .location
            .file_name()
            .ok_or(anyhow!("no file name in {}", asset.location.key))?;
        Ok(DownloadTask::new(
            &asset.location.bucket,
            &asset.location.key,
            &format!("{}/UTM{}/{}", source.name, utm, file_name),
            asset.checksum.as_deref(),
        ))
    };

    Ok(TileTask {
        record: TrackedTile {
            tilename: record.tile.clone(),
            geotiff_link: Some(geotiff.location.to_url()),
            rat_link: Some(rat.location.to_url()),
            delivered_date: record.delivered_date.clone(),
            resolution: record.resolution.clone(),
            utm: Some(utm.clone()),
            subregion: Some(subregion.name),
            geotiff_sha256_checksum: geotiff.checksum.clone(),
            rat_sha256_checksum: rat.checksum.clone(),
            ..Default::default()
        },
        geotiff: download(geotiff)?,
        rat: download(rat)?,
        superseded: current.disk_paths().map(str::to_string).collect(),
    })
}
