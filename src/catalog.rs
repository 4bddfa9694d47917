//! The remote tile scheme: which tiles exist, where their assets live, and which
//! version of each is current.
use crate::data_source::DataSource;
use crate::download_plan::try_download;
use crate::error::SyncError;
use crate::geometry::{self, Geometry, SpatialRef};
use crate::registry::{Registry, TileScheme, TILE_SCHEME};
use crate::s3::S3ObjOps;
use crate::s3_operations::S3Object;
use anyhow::{anyhow, Context, Result};
use chrono::{SecondsFormat, Utc};
use gdal::vector::{Feature, FieldValue, LayerAccess};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct TileAsset {
    pub location: S3Object,
    pub checksum: Option<String>,
}

/// A tile as published in the tile scheme.
#[derive(Debug, Clone)]
pub struct TileRecord {
    pub tile: String,
    pub footprint: Geometry,
    /// Version token. Tiles without one have not been delivered yet.
    pub delivered_date: Option<String>,
    pub resolution: Option<String>,
    pub utm: Option<String>,
    pub geotiff: Option<TileAsset>,
    pub rat: Option<TileAsset>,
}

fn field_text(value: FieldValue) -> Option<String> {
    let text = match value {
        FieldValue::StringValue(s) => s,
        FieldValue::IntegerValue(v) => v.to_string(),
        FieldValue::Integer64Value(v) => v.to_string(),
        FieldValue::RealValue(v) => v.to_string(),
        FieldValue::DateValue(v) => v.to_string(),
        FieldValue::DateTimeValue(v) => v.to_string(),
        _ => return None,
    };
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

impl TileRecord {
    /// Field names are matched case-insensitively. Links outside `tile_prefix` are dropped.
    fn from_feature(feature: &Feature, tile_prefix: &str) -> Option<Self> {
        let fields: BTreeMap<String, String> = feature
            .fields()
            .filter_map(|(name, value)| Some((name.to_lowercase(), field_text(value?)?)))
            .collect();
        let text = |name: &str| fields.get(name).cloned();

        let tile = text("tile")?;
        let asset = |link: &str, checksum: &str| {
            let url = text(link)?;
            match S3Object::from_url(&url) {
                Ok(location) if location.key.starts_with(&format!("{}/", tile_prefix)) => {
                    Some(TileAsset {
                        location,
                        checksum: text(checksum),
                    })
                }
                Ok(location) => {
                    warn!(
                        "Ignoring {} of tile {}: {} is outside {}",
                        link, tile, location.key, tile_prefix
                    );
                    None
                }
                Err(e) => {
                    warn!("Ignoring {} of tile {}: {}", link, tile, e);
                    None
                }
            }
        };
        let geotiff = asset("geotiff_link", "geotiff_sha256_checksum");
        let rat = asset("rat_link", "rat_sha256_checksum");

        let footprint = match feature.geometry() {
            Some(geometry) => geometry.clone(),
            None => Geometry::from_wkt("POLYGON EMPTY").ok()?,
        };
        Some(Self {
            footprint,
            delivered_date: text("delivered_date"),
            resolution: text("resolution"),
            utm: text("utm"),
            geotiff,
            rat,
            tile,
        })
    }

    /// Delivered and downloadable.
    pub fn is_available(&self) -> bool {
        self.delivered_date.is_some() && self.geotiff.is_some() && self.rat.is_some()
    }
}

#[derive(Default)]
pub struct Catalog {
    records: BTreeMap<String, TileRecord>,
    /// Spatial reference of the tile footprints, when the scheme declares one.
    pub srs: Option<SpatialRef>,
}

impl fmt::Debug for Catalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Catalog")
            .field("records", &self.records)
            .field("srs", &self.srs.as_ref().and_then(|srs| srs.to_wkt().ok()))
            .finish()
    }
}

impl Catalog {
    pub fn from_records(records: impl IntoIterator<Item = TileRecord>) -> Result<Self> {
        let mut catalog = Self::default();
        for record in records {
            if catalog.records.contains_key(&record.tile) {
                return Err(anyhow!("Duplicate tile {} in tile scheme", record.tile));
            }
            catalog.records.insert(record.tile.clone(), record);
        }
        Ok(catalog)
    }

    /// Parses the first layer of a tile scheme. Asset links must live under `tile_prefix`.
    pub fn from_tile_scheme(path: &Path, tile_prefix: &str) -> Result<Self> {
        let dataset = geometry::open_vector(path)?;
        let mut layer = dataset
            .layer(0)
            .with_context(|| format!("No layer in tile scheme {}", path.display()))?;

        let mut records = vec![];
        for feature in layer.features() {
            match TileRecord::from_feature(&feature, tile_prefix) {
                Some(record) => records.push(record),
                None => warn!("Skipping tile scheme feature without a tile name"),
            }
        }
        let mut catalog = Self::from_records(records)?;
        catalog.srs = layer.spatial_ref();
        Ok(catalog)
    }

    pub fn get(&self, tile: &str) -> Option<&TileRecord> {
        self.records.get(tile)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TileRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Keeps the local copy of the tile scheme in step with the bucket.
pub struct CatalogReader<'a, S: S3ObjOps> {
    store: &'a S,
    source: &'a DataSource,
}

impl<'a, S: S3ObjOps> CatalogReader<'a, S> {
    pub fn new(store: &'a S, source: &'a DataSource) -> Self {
        Self { store, source }
    }

    /// Downloads the tile scheme if its ETag changed (or the local copy is gone) and parses it.
    pub async fn read(&self, root: &Path, registry: &Registry) -> Result<Catalog> {
        let path = self.sync_tile_scheme(root, registry).await?;
        let catalog = Catalog::from_tile_scheme(&path, &self.source.tile_prefix)?;
        info!("Tile scheme lists {} tiles", catalog.len());
        Ok(catalog)
    }

    async fn sync_tile_scheme(&self, root: &Path, registry: &Registry) -> Result<PathBuf> {
        let bucket = &self.source.bucket;
        let prefix = &self.source.tile_scheme_prefix;
        let unavailable = |reason: String| SyncError::RemoteUnavailable {
            bucket: bucket.clone(),
            prefix: prefix.clone(),
            reason,
        };

        let objects = self
            .store
            .list_objects(bucket, prefix)
            .await
            .map_err(|e| unavailable(format!("{:#}", e)))?;
        let object = objects
            .first()
            .ok_or_else(|| unavailable("no tile scheme found".to_string()))?;
        if objects.len() > 1 {
            warn!(
                "More than one tile scheme found under {}, using {}",
                prefix, object.key
            );
        }

        let current = registry.tile_scheme()?;
        if let Some(scheme) = &current {
            let local = root.join(&scheme.location);
            if object.e_tag.is_some() && scheme.e_tag == object.e_tag && local.is_file() {
                debug!("Tile scheme {} is up to date", scheme.location);
                return Ok(local);
            }
        }

        let file_name = Path::new(&object.key)
            .file_name()
            .and_then(|f| f.to_str())
            .ok_or(anyhow!("Invalid tile scheme key {}", object.key))?;
        let location = format!("{}/{}/{}", self.source.name, TILE_SCHEME, file_name);
        let local = root.join(&location);
        // The previous scheme stays usable until the new one is complete.
        let staging = root.join(format!("{}.new", location));
        if staging.is_file() {
            fs::remove_file(&staging)?;
        }

        info!("Downloading tile scheme {}", object.key);
        try_download(self.store, bucket, &object.key, &staging).await?;
        fs::rename(&staging, &local)?;
        registry.set_tile_scheme(&TileScheme {
            location: location.clone(),
            e_tag: object.e_tag.clone(),
            downloaded: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        })?;
        if let Some(previous) = current.filter(|scheme| scheme.location != location) {
            let previous = root.join(&previous.location);
            if previous.is_file() {
                fs::remove_file(&previous)?;
            }
        }
        Ok(local)
    }
}
