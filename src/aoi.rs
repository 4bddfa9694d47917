//! The user supplied area of interest.
use crate::error::GeometryError;
use crate::geometry::{self, BoundingBox, CoordTransform, Geometry, SpatialRef};
use anyhow::{anyhow, Result};
use gdal::vector::LayerAccess;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct AreaOfInterest {
    /// Polygons and multipolygons in the tile scheme's spatial reference.
    pub polygons: Vec<Geometry>,
    pub source: PathBuf,
}

impl AreaOfInterest {
    /// Reads every polygon of every layer in any vector format GDAL can open, reprojecting
    /// layers into `target` when their spatial reference differs.
    pub fn read(path: &Path, target: Option<&SpatialRef>) -> Result<Self> {
        if !path.is_file() {
            return Err(anyhow!(
                "The geometry {} for determining what to download does not exist.",
                path.display()
            ));
        }
        let dataset = geometry::open_vector(path)?;

        let mut polygons = vec![];
        for mut layer in dataset.layers() {
            let transform = match (layer.spatial_ref(), target) {
                (Some(from), Some(to)) if from != *to => {
                    debug!("Reprojecting layer {} of {}", layer.name(), path.display());
                    Some(CoordTransform::new(&from, to).map_err(|e| {
                        GeometryError::Reprojection {
                            path: path.display().to_string(),
                            reason: e.to_string(),
                        }
                    })?)
                }
                (None, Some(_)) => {
                    warn!(
                        "Layer {} of {} has no spatial reference; assuming it matches the tile scheme",
                        layer.name(),
                        path.display()
                    );
                    None
                }
                _ => None,
            };

            let mut parts = vec![];
            for feature in layer.features() {
                if let Some(geometry) = feature.geometry() {
                    geometry::polygonal_parts(geometry, &mut parts);
                }
            }
            for mut part in parts {
                if let Some(transform) = &transform {
                    part.transform_inplace(transform)
                        .map_err(|e| GeometryError::Reprojection {
                            path: path.display().to_string(),
                            reason: e.to_string(),
                        })?;
                }
                polygons.push(part);
            }
        }

        if polygons.is_empty() {
            return Err(GeometryError::Empty(path.display().to_string()).into());
        }
        Ok(Self {
            polygons,
            source: path.to_path_buf(),
        })
    }

    pub fn bbox(&self) -> Option<BoundingBox> {
        self.polygons.iter().map(BoundingBox::of).reduce(|a, b| BoundingBox {
            min_x: a.min_x.min(b.min_x),
            min_y: a.min_y.min(b.min_y),
            max_x: a.max_x.max(b.max_x),
            max_y: a.max_y.max(b.max_y),
        })
    }

    /// Closed test: a footprint touching the area's boundary intersects it.
    pub fn intersects(&self, footprint: &Geometry) -> bool {
        self.polygons.iter().any(|polygon| polygon.intersects(footprint))
    }
}
