//! One `fetch_tiles` run: bring the project directory in line with the remote catalog.
use crate::aoi::AreaOfInterest;
use crate::catalog::CatalogReader;
use crate::data_source::DataSource;
use crate::download_plan::FetchReport;
use crate::registry::Registry;
use crate::s3::S3ObjOps;
use crate::selector::{self, TrackOutcome};
use anyhow::{anyhow, Context, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub root: PathBuf,
    /// Area of interest; new tiles are only tracked when given.
    pub geometry: Option<PathBuf>,
    pub untrack_missing: bool,
    pub dry_run: bool,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub tiles: usize,
    pub subregions: usize,
    pub utms: usize,
}

#[derive(Debug, Default)]
pub struct FetchSummary {
    pub swept: Option<SweepOutcome>,
    pub tracking: Option<TrackOutcome>,
    pub untouched: Vec<String>,
    pub report: FetchReport,
    /// Written instead of fetching on a dry run.
    pub plan_file: Option<PathBuf>,
}

pub fn plan_file_path(root: &Path, source: &DataSource) -> PathBuf {
    root.join(format!("{}_fetch_plan.json", source.slug()))
}

pub async fn fetch_tiles(
    store: &impl S3ObjOps,
    source: &DataSource,
    options: &FetchOptions,
) -> Result<FetchSummary> {
    let start = Instant::now();
    let root = options.root.as_path();
    info!("{}: Beginning work on {}", source.name, root.display());

    if let Some(geometry) = &options.geometry {
        if !geometry.is_file() {
            return Err(anyhow!(
                "The geometry {} for determining what to download does not exist.",
                geometry.display()
            ));
        }
    }

    fs::create_dir_all(root)
        .with_context(|| format!("Unable to create {}", root.display()))?;
    let registry = Registry::open(root, source)?;
    let catalog = CatalogReader::new(store, source).read(root, &registry).await?;
    let aoi = options
        .geometry
        .as_deref()
        .map(|path| AreaOfInterest::read(path, catalog.srs.as_ref()))
        .transpose()?;

    let mut summary = FetchSummary::default();
    if options.untrack_missing {
        let swept = sweep_files(root, &registry)?;
        info!(
            "Untracked {} tile(s), {} subregion vrt(s), {} utm vrt(s)",
            swept.tiles, swept.subregions, swept.utms
        );
        summary.swept = Some(swept);
    }

    if let Some(aoi) = &aoi {
        let selected = selector::select(aoi, &catalog);
        summary.tracking = Some(selector::track(&registry, &selected)?);
    }

    let mut plan = selector::plan(root, source, &catalog, &registry.tracked_tiles()?);
    summary.untouched = plan.untouched.clone();

    if options.dry_run {
        plan.resolve_sizes(store).await;
        let path = plan_file_path(root, source);
        plan.write(&path)?;
        info!(
            "Dry run: {} tile(s) would be fetched, {} already exist. Plan written to {}",
            plan.tasks.len(),
            plan.existing.len(),
            path.display()
        );
        summary.report.existing = plan.existing;
        summary.plan_file = Some(path);
        return Ok(summary);
    }

    info!("{} new or updated tile(s) being downloaded", plan.tasks.len());
    summary.report = plan.execute(store, root, &registry).await?;
    info!(
        "Operation complete after {:.1?} with {} already existing tiles, {} tiles downloaded ({} bytes) and {} failed",
        start.elapsed(),
        summary.report.existing.len(),
        summary.report.fetched.len(),
        summary.report.bytes,
        summary.report.failed.len()
    );
    Ok(summary)
}

/// Untracks tiles with a recorded file that no longer exists, deleting whatever
/// remains of them, then drops VRTs no longer backed by a fetched tile.
pub fn sweep_files(root: &Path, registry: &Registry) -> Result<SweepOutcome> {
    let mut outcome = SweepOutcome::default();
    for tile in registry.tracked_tiles()? {
        if !tile.has_missing_file(root) {
            continue;
        }
        if let Some(removed) = registry.untrack(&tile.tilename)? {
            outcome.tiles += 1;
            remove_all(root, removed.disk_paths());
        }
    }

    let (subregions, utms) = registry.prune_vrts()?;
    for subregion in &subregions {
        remove_all(root, subregion.paths());
    }
    for utm in &utms {
        remove_all(root, utm.paths());
    }
    outcome.subregions = subregions.len();
    outcome.utms = utms.len();
    Ok(outcome)
}

fn remove_all<'a>(root: &Path, paths: impl Iterator<Item = &'a str>) {
    for path in paths {
        let path = root.join(path);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Unable to remove {}: {}", path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download_plan::DownloadPlan;
    use crate::error::SyncError;
    use crate::geometry::Geometry;
    use crate::registry::{SubregionVrt, UtmVrt};
    use crate::test_support::{publish, rect, test_source, write_vector, FakeStore, FixtureTile, BUCKET};
    use gdal::vector::OGRFieldType;

    struct Project {
        dir: tempfile::TempDir,
        source: DataSource,
        store: FakeStore,
    }

    impl Project {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                source: test_source(),
                store: FakeStore::default(),
            }
        }

        fn root(&self) -> &Path {
            self.dir.path()
        }

        fn aoi(&self, name: &str, polygon: Geometry) -> PathBuf {
            let path = self.root().join(format!("{name}.geojson"));
            write_vector(
                &path,
                "GeoJSON",
                name,
                4326,
                &[("name", OGRFieldType::OFTString)],
                &[(polygon, vec![])],
            );
            path
        }

        fn options(&self, geometry: Option<PathBuf>) -> FetchOptions {
            FetchOptions {
                root: self.root().to_path_buf(),
                geometry,
                ..Default::default()
            }
        }

        async fn fetch(&self, options: FetchOptions) -> Result<FetchSummary> {
            fetch_tiles(&self.store, &self.source, &options).await
        }

        fn on_disk(&self, tile: &FixtureTile) -> bool {
            let name = |key: String| key.rsplit('/').next().unwrap().to_string();
            let dir = self.root().join("BlueTopo/UTM19");
            dir.join(name(tile.geotiff_key(&self.source))).is_file()
                && dir.join(name(tile.rat_key(&self.source))).is_file()
        }

        fn registry(&self) -> Registry {
            Registry::open(self.root(), &self.source).unwrap()
        }
    }

    fn tile_a() -> FixtureTile {
        FixtureTile::new("A", rect(-69.5, 41.0, -69.4, 41.1), "2024-01-01")
    }

    fn tile_b() -> FixtureTile {
        FixtureTile::new("B", rect(-69.4, 41.0, -69.3, 41.1), "2024-01-01")
    }

    fn tile_d() -> FixtureTile {
        FixtureTile::new("D", rect(-68.0, 41.0, -67.9, 41.1), "2024-01-01")
    }

    fn around_a_and_b() -> Geometry {
        rect(-69.45, 41.02, -69.35, 41.08)
    }

    fn around_d() -> Geometry {
        rect(-67.95, 41.02, -67.92, 41.05)
    }

    #[tokio::test]
    async fn test_fetches_only_intersecting_tiles_and_reruns_are_free() {
        let project = Project::new();
        publish(&project.store, &project.source, "1", &[tile_a(), tile_b(), tile_d()]);
        let aoi = project.aoi("aoi", around_a_and_b());

        let summary = project.fetch(project.options(Some(aoi.clone()))).await.unwrap();
        assert_eq!(summary.report.fetched, vec!["A", "B"]);
        assert_eq!(summary.tracking.unwrap().newly_tracked, 2);
        assert!(project.on_disk(&tile_a()) && project.on_disk(&tile_b()));
        assert!(!project.on_disk(&tile_d()));

        project.store.reset_gets();
        let summary = project.fetch(project.options(Some(aoi))).await.unwrap();
        assert!(project.store.gets().is_empty());
        assert!(summary.report.fetched.is_empty());
        assert_eq!(summary.report.existing, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_tiles_outside_new_aoi_are_left_alone() {
        let project = Project::new();
        publish(&project.store, &project.source, "1", &[tile_a(), tile_b(), tile_d()]);
        let first = project.aoi("first", around_a_and_b());
        project.fetch(project.options(Some(first))).await.unwrap();

        let second = project.aoi("second", around_d());
        let summary = project.fetch(project.options(Some(second))).await.unwrap();
        assert_eq!(summary.report.fetched, vec!["D"]);
        assert_eq!(summary.report.existing, vec!["A", "B"]);
        assert!(project.on_disk(&tile_a()) && project.on_disk(&tile_d()));
        assert_eq!(project.registry().tracked_tiles().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_tile_does_not_stop_the_rest() {
        let project = Project::new();
        publish(&project.store, &project.source, "1", &[tile_a(), tile_b()]);
        project.store.fail_key(&tile_a().geotiff_key(&project.source));
        let aoi = project.aoi("aoi", around_a_and_b());

        let summary = project.fetch(project.options(Some(aoi))).await.unwrap();
        assert_eq!(summary.report.fetched, vec!["B"]);
        assert!(matches!(
            &summary.report.failed[..],
            [SyncError::FetchFailed { tile, .. }] if tile == "A"
        ));
        assert!(project.registry().tile("A").unwrap().unwrap().geotiff_disk.is_none());

        project.store.clear_failures();
        let summary = project.fetch(project.options(None)).await.unwrap();
        assert_eq!(summary.report.fetched, vec!["A"]);
        assert!(project.on_disk(&tile_a()));
    }

    #[tokio::test]
    async fn test_new_version_replaces_old_files() {
        let project = Project::new();
        publish(&project.store, &project.source, "1", &[tile_a()]);
        let aoi = project.aoi("aoi", around_a_and_b());
        project.fetch(project.options(Some(aoi))).await.unwrap();
        assert!(project.on_disk(&tile_a()));

        let mut updated = tile_a();
        updated.delivered = Some("2024-06-01".to_string());
        publish(&project.store, &project.source, "2", &[updated.clone()]);

        let summary = project.fetch(project.options(None)).await.unwrap();
        assert_eq!(summary.report.fetched, vec!["A"]);
        assert!(project.on_disk(&updated));
        assert!(!project.on_disk(&tile_a()));
        assert!(!project
            .root()
            .join("BlueTopo/UTM19/BlueTopo_A_20240101.tiff")
            .exists());
        let tile = project.registry().tile("A").unwrap().unwrap();
        assert_eq!(tile.delivered_date.as_deref(), Some("2024-06-01"));
        assert_eq!(tile.geotiff_verified, Some(true));
    }

    #[tokio::test]
    async fn test_checksum_mismatch_leaves_no_files() {
        let project = Project::new();
        publish(&project.store, &project.source, "1", &[tile_a()]);
        project
            .store
            .put(BUCKET, &tile_a().geotiff_key(&project.source), b"tampered".to_vec());
        let aoi = project.aoi("aoi", around_a_and_b());

        let summary = project.fetch(project.options(Some(aoi))).await.unwrap();
        assert!(summary.report.fetched.is_empty());
        assert_eq!(summary.report.failed.len(), 1);
        let utm_dir = project.root().join("BlueTopo/UTM19");
        assert!(!utm_dir.join("BlueTopo_A_20240101.tiff").exists());
        assert!(!utm_dir.join("BlueTopo_A_20240101.tiff.aux.xml").exists());
    }

    #[tokio::test]
    async fn test_untrack_missing_files() {
        let project = Project::new();
        publish(&project.store, &project.source, "1", &[tile_a(), tile_b()]);
        let aoi = project.aoi("aoi", around_a_and_b());
        project.fetch(project.options(Some(aoi))).await.unwrap();

        let geotiff = project.root().join("BlueTopo/UTM19/BlueTopo_A_20240101.tiff");
        fs::remove_file(&geotiff).unwrap();
        let summary = project
            .fetch(FetchOptions {
                untrack_missing: true,
                ..project.options(None)
            })
            .await
            .unwrap();

        assert_eq!(summary.swept.unwrap().tiles, 1);
        assert!(summary.report.fetched.is_empty());
        assert!(project.registry().tile("A").unwrap().is_none());
        assert!(!project
            .root()
            .join("BlueTopo/UTM19/BlueTopo_A_20240101.tiff.aux.xml")
            .exists());
        assert!(project.on_disk(&tile_b()));
    }

    #[tokio::test]
    async fn test_untrack_removes_stale_vrt_files() {
        let project = Project::new();
        publish(&project.store, &project.source, "1", &[tile_a()]);
        let aoi = project.aoi("aoi", around_a_and_b());
        project.fetch(project.options(Some(aoi))).await.unwrap();

        let registry = project.registry();
        let region = registry.tile("A").unwrap().unwrap().subregion.unwrap();
        let vrt_dir = project.root().join("BlueTopo_VRT");
        fs::create_dir_all(&vrt_dir).unwrap();
        let built = SubregionVrt {
            region: region.clone(),
            utm: Some("19".into()),
            res_4_vrt: Some(format!("BlueTopo_VRT/{region}_4.vrt")),
            res_4_ovr: Some(format!("BlueTopo_VRT/{region}_4.vrt.ovr")),
            complete_vrt: Some(format!("BlueTopo_VRT/{region}_complete.vrt")),
            complete_ovr: Some(format!("BlueTopo_VRT/{region}_complete.vrt.ovr")),
            built: true,
            ..Default::default()
        };
        let utm = UtmVrt {
            utm: "19".into(),
            utm_vrt: Some("BlueTopo_VRT/BlueTopo_Fetched_UTM19.vrt".into()),
            utm_ovr: Some("BlueTopo_VRT/BlueTopo_Fetched_UTM19.vrt.ovr".into()),
            built: true,
        };
        registry.update_subregion(&built).unwrap();
        registry.update_utm(&utm).unwrap();
        let files: Vec<PathBuf> = built
            .paths()
            .chain(utm.paths())
            .map(|p| project.root().join(p))
            .collect();
        for file in &files {
            fs::write(file, "vrt").unwrap();
        }

        fs::remove_file(project.root().join("BlueTopo/UTM19/BlueTopo_A_20240101.tiff")).unwrap();
        let summary = project
            .fetch(FetchOptions {
                untrack_missing: true,
                ..project.options(None)
            })
            .await
            .unwrap();

        assert_eq!(
            summary.swept.unwrap(),
            SweepOutcome {
                tiles: 1,
                subregions: 1,
                utms: 1
            }
        );
        for file in &files {
            assert!(!file.exists(), "{} was left behind", file.display());
        }
        assert!(project.registry().subregions(true).unwrap().is_empty());
        assert!(project.registry().utms(true).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_geometry_is_reported_before_any_work() {
        let project = Project::new();
        publish(&project.store, &project.source, "1", &[tile_a()]);
        let missing = project.root().join("nope.gpkg");
        let err = project.fetch(project.options(Some(missing))).await.unwrap_err();
        assert!(err.to_string().contains("does not exist"));
        assert!(project.store.gets().is_empty());
    }

    #[tokio::test]
    async fn test_missing_catalog_is_fatal() {
        let project = Project::new();
        let err = project.fetch(project.options(None)).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SyncError>(),
            Some(SyncError::RemoteUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_dry_run_writes_plan_and_fetches_nothing() {
        let project = Project::new();
        publish(&project.store, &project.source, "1", &[tile_a(), tile_b()]);
        let aoi = project.aoi("aoi", around_a_and_b());

        let summary = project
            .fetch(FetchOptions {
                dry_run: true,
                ..project.options(Some(aoi))
            })
            .await
            .unwrap();

        let path = summary.plan_file.unwrap();
        assert_eq!(path, project.root().join("bluetopo_fetch_plan.json"));
        let plan = DownloadPlan::read(&path).unwrap();
        assert_eq!(plan.tasks.len(), 2);
        assert_eq!(plan.tasks[0].geotiff.size, Some(tile_a().geotiff_bytes().len() as u64));
        assert!(!project.on_disk(&tile_a()));
        assert!(project
            .store
            .gets()
            .iter()
            .all(|key| key.starts_with(&project.source.tile_scheme_prefix)));
    }
}
