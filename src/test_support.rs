//! Fixtures shared by the unit tests: vector file writing and an in-memory object store.
use crate::data_source::{DataSource, DataSources};
use crate::geometry::{rectangle, Geometry, SpatialRef};
use crate::s3::{RemoteObject, S3ObjOps};
use anyhow::{anyhow, Result};
use aws_sdk_s3::operation::get_object::GetObjectOutput;
use aws_sdk_s3::operation::head_object::HeadObjectOutput;
use aws_sdk_s3::primitives::ByteStream;
use gdal::vector::{Feature, FieldDefn, FieldValue, LayerAccess, OGRFieldType, OGRwkbGeometryType};
use gdal::{Dataset, DriverManager, LayerOptions};
use sha2::{Digest, Sha256};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

pub const BUCKET: &str = "test-bucket";

pub fn test_source() -> DataSource {
    DataSource {
        bucket: BUCKET.to_string(),
        ..DataSources::builtin().unwrap().get("BlueTopo").unwrap()
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Quoted ETag the fake store reports for an object.
pub fn e_tag(bytes: &[u8]) -> String {
    format!("\"{}\"", &sha256_hex(bytes)[..32])
}

pub fn rect(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Geometry {
    rectangle(min_x, min_y, max_x, max_y).unwrap()
}

/// Writes one vector layer with the given fields. Fields missing from a feature stay null.
pub fn write_vector(
    path: &Path,
    driver: &str,
    layer_name: &str,
    epsg: u32,
    fields: &[(&str, OGRFieldType::Type)],
    features: &[(Geometry, Vec<(&str, FieldValue)>)],
) {
    let mut dataset = DriverManager::get_driver_by_name(driver)
        .unwrap()
        .create_vector_only(path)
        .unwrap();
    let srs = SpatialRef::from_epsg(epsg).unwrap();
    let layer = dataset
        .create_layer(LayerOptions {
            name: layer_name,
            srs: Some(&srs),
            ty: OGRwkbGeometryType::wkbUnknown,
            options: None,
        })
        .unwrap();
    for (name, ty) in fields {
        FieldDefn::new(name, *ty)
            .unwrap()
            .add_to_layer(&layer)
            .unwrap();
    }
    for (geometry, values) in features {
        let mut feature = Feature::new(layer.defn()).unwrap();
        for (name, value) in values {
            let _idx = fields.iter().position(|(f, _)| f == name).unwrap();
            feature.set_field(name, value).unwrap();
        }
        feature.set_geometry(geometry.clone()).unwrap();
        feature.create(&layer).unwrap();
    }
}

/// Lon/lat WGS 84 as GDAL reports it for a GeoPackage layer, so axis order matches the
/// spatial reference of a real tile scheme.
pub fn lon_lat_srs() -> SpatialRef {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("srs.gpkg");
    write_vector(&path, "GPKG", "srs", 4326, &[], &[(rect(0.0, 0.0, 1.0, 1.0), vec![])]);
    let dataset = Dataset::open(&path).unwrap();
    let layer = dataset.layer(0).unwrap();
    layer.spatial_ref().unwrap()
}

/// A tile as published in a fixture tile scheme.
#[derive(Debug, Clone)]
pub struct FixtureTile {
    pub tile: String,
    pub footprint: Geometry,
    pub delivered: Option<String>,
    pub resolution: String,
    pub utm: String,
    pub with_checksums: bool,
}

impl FixtureTile {
    pub fn new(tile: &str, footprint: Geometry, delivered: &str) -> Self {
        Self {
            tile: tile.to_string(),
            footprint,
            delivered: Some(delivered.to_string()),
            resolution: "4m".to_string(),
            utm: "19".to_string(),
            with_checksums: true,
        }
    }

    fn version(&self) -> String {
        self.delivered.clone().unwrap_or_default().replace('-', "")
    }

    pub fn geotiff_key(&self, source: &DataSource) -> String {
        format!(
            "{}/{}/{}_{}_{}.tiff",
            source.tile_prefix,
            self.tile,
            source.name,
            self.tile,
            self.version()
        )
    }

    pub fn rat_key(&self, source: &DataSource) -> String {
        format!("{}.aux.xml", self.geotiff_key(source))
    }

    pub fn geotiff_bytes(&self) -> Vec<u8> {
        format!("geotiff {} {}", self.tile, self.version()).into_bytes()
    }

    pub fn rat_bytes(&self) -> Vec<u8> {
        format!("rat {} {}", self.tile, self.version()).into_bytes()
    }
}

/// Publishes a tile scheme and every delivered tile's objects, replacing any previous scheme.
pub fn publish(store: &FakeStore, source: &DataSource, version: &str, tiles: &[FixtureTile]) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scheme.gpkg");
    let text = |s: String| FieldValue::StringValue(s);
    let features: Vec<(Geometry, Vec<(&str, FieldValue)>)> = tiles
        .iter()
        .map(|t| {
            let mut fields = vec![
                ("tile", text(t.tile.clone())),
                ("Resolution", text(t.resolution.clone())),
                ("UTM", FieldValue::IntegerValue(t.utm.parse().unwrap())),
            ];
            if let Some(delivered) = &t.delivered {
                fields.push(("Delivered_Date", text(delivered.clone())));
                fields.push((
                    "GeoTIFF_Link",
                    text(format!("https://{}.s3.amazonaws.com/{}", source.bucket, t.geotiff_key(source))),
                ));
                fields.push((
                    "RAT_Link",
                    text(format!("https://{}.s3.amazonaws.com/{}", source.bucket, t.rat_key(source))),
                ));
                if t.with_checksums {
                    fields.push(("GeoTIFF_SHA256_Checksum", text(sha256_hex(&t.geotiff_bytes()))));
                    fields.push(("RAT_SHA256_Checksum", text(sha256_hex(&t.rat_bytes()))));
                }
            }
            (t.footprint.clone(), fields)
        })
        .collect();
    write_vector(
        &path,
        "GPKG",
        "BlueTopo_Tile_Scheme",
        4326,
        &[
            ("tile", OGRFieldType::OFTString),
            ("GeoTIFF_Link", OGRFieldType::OFTString),
            ("RAT_Link", OGRFieldType::OFTString),
            ("Delivered_Date", OGRFieldType::OFTString),
            ("Resolution", OGRFieldType::OFTString),
            ("UTM", OGRFieldType::OFTInteger),
            ("GeoTIFF_SHA256_Checksum", OGRFieldType::OFTString),
            ("RAT_SHA256_Checksum", OGRFieldType::OFTString),
        ],
        &features,
    );

    store.remove_prefix(&source.bucket, &source.tile_scheme_prefix);
    store.put(
        &source.bucket,
        &format!("{}_{}.gpkg", source.tile_scheme_prefix, version),
        std::fs::read(&path).unwrap(),
    );
    for tile in tiles.iter().filter(|t| t.delivered.is_some()) {
        store.put(&source.bucket, &tile.geotiff_key(source), tile.geotiff_bytes());
        store.put(&source.bucket, &tile.rat_key(source), tile.rat_bytes());
    }
}

/// In-memory stand-in for the bucket.
#[derive(Default)]
pub struct FakeStore {
    objects: RefCell<BTreeMap<(String, String), Vec<u8>>>,
    failing: RefCell<HashSet<String>>,
    listing_down: Cell<bool>,
    gets: RefCell<Vec<String>>,
}

impl FakeStore {
    pub fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) {
        self.objects
            .borrow_mut()
            .insert((bucket.to_string(), key.to_string()), bytes);
    }

    pub fn remove_prefix(&self, bucket: &str, prefix: &str) {
        self.objects
            .borrow_mut()
            .retain(|(b, k), _| !(b == bucket && k.starts_with(prefix)));
    }

    /// Reads of this key fail until cleared.
    pub fn fail_key(&self, key: &str) {
        self.failing.borrow_mut().insert(key.to_string());
    }

    pub fn clear_failures(&self) {
        self.failing.borrow_mut().clear();
    }

    pub fn set_listing_down(&self, down: bool) {
        self.listing_down.set(down);
    }

    /// Keys read so far, in order.
    pub fn gets(&self) -> Vec<String> {
        self.gets.borrow().clone()
    }

    pub fn reset_gets(&self) {
        self.gets.borrow_mut().clear();
    }

    fn object(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        if self.failing.borrow().contains(key) {
            return Err(anyhow!("simulated transfer failure for {}", key));
        }
        self.objects
            .borrow()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or(anyhow!("NoSuchKey: {}", key))
    }
}

impl S3ObjOps for FakeStore {
    async fn list_objects(self: &Self, bucket: &str, prefix: &str) -> Result<Vec<RemoteObject>> {
        if self.listing_down.get() {
            return Err(anyhow!("dispatch failure"));
        }
        Ok(self
            .objects
            .borrow()
            .iter()
            .filter(|((b, k), _)| b == bucket && k.starts_with(prefix))
            .map(|((_, k), bytes)| RemoteObject {
                key: k.clone(),
                size: bytes.len() as u64,
                e_tag: Some(e_tag(bytes)),
            })
            .collect())
    }

    async fn head_object(self: &Self, bucket: &str, key: &str) -> Result<HeadObjectOutput> {
        let bytes = self.object(bucket, key)?;
        Ok(HeadObjectOutput::builder()
            .content_length(bytes.len() as i64)
            .e_tag(e_tag(&bytes))
            .build())
    }

    async fn get_object_range(
        self: &Self,
        bucket: &str,
        key: &str,
        start_byte: u64,
        end_byte: u64,
    ) -> Result<GetObjectOutput> {
        let bytes = self.object(bucket, key)?;
        self.gets.borrow_mut().push(key.to_string());
        let end = (end_byte as usize + 1).min(bytes.len());
        let slice = bytes[(start_byte as usize).min(end)..end].to_vec();
        Ok(GetObjectOutput::builder()
            .body(ByteStream::from(slice))
            .build())
    }
}
