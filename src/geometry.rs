//! OGR helpers shared by the tile scheme, the area of interest and the subregion grid.
use anyhow::{Context, Result};
pub use gdal::spatial_ref::{CoordTransform, SpatialRef};
pub use gdal::vector::Geometry;
use gdal::Dataset;
use std::path::Path;

/// Axis aligned extent of a geometry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    pub fn of(geometry: &Geometry) -> Self {
        let envelope = geometry.envelope();
        Self {
            min_x: envelope.MinX,
            min_y: envelope.MinY,
            max_x: envelope.MaxX,
            max_y: envelope.MaxY,
        }
    }

    /// Closed test, so boxes sharing an edge intersect.
    pub fn intersects(&self, other: &Self) -> bool {
        self.min_x <= other.max_x
            && other.min_x <= self.max_x
            && self.min_y <= other.max_y
            && other.min_y <= self.max_y
    }
}

pub fn rectangle(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Result<Geometry> {
    let wkt = format!(
        "POLYGON (({min_x} {min_y}, {max_x} {min_y}, {max_x} {max_y}, {min_x} {max_y}, {min_x} {min_y}))"
    );
    Ok(Geometry::from_wkt(&wkt)?)
}

/// Pushes the polygons and multipolygons found in `geometry`, looking inside collections.
/// Other geometry types are skipped.
pub fn polygonal_parts(geometry: &Geometry, out: &mut Vec<Geometry>) {
    match geometry.geometry_name().as_str() {
        "POLYGON" | "MULTIPOLYGON" => out.push(geometry.clone()),
        "GEOMETRYCOLLECTION" => {
            for idx in 0..geometry.geometry_count() {
                polygonal_parts(&geometry.get_geometry(idx), out);
            }
        }
        _ => {}
    }
}

pub fn open_vector(path: &Path) -> Result<Dataset> {
    Dataset::open(path).with_context(|| format!("Unable to open {} as a vector dataset", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounding_box() {
        let square = rectangle(0.0, 0.0, 1.0, 2.0).unwrap();
        let bbox = BoundingBox::of(&square);
        assert_eq!(
            bbox,
            BoundingBox {
                min_x: 0.0,
                min_y: 0.0,
                max_x: 1.0,
                max_y: 2.0
            }
        );
        let touching = BoundingBox::of(&rectangle(1.0, 2.0, 3.0, 3.0).unwrap());
        let apart = BoundingBox::of(&rectangle(1.5, 0.0, 3.0, 3.0).unwrap());
        assert!(bbox.intersects(&touching));
        assert!(!bbox.intersects(&apart));
    }

    #[test]
    fn test_polygonal_parts_skip_other_types() {
        let collection = Geometry::from_wkt(
            "GEOMETRYCOLLECTION (POINT (1 1), POLYGON ((0 0, 1 0, 1 1, 0 0)), \
             MULTIPOLYGON (((5 5, 6 5, 6 6, 5 5))))",
        )
        .unwrap();
        let mut parts = vec![];
        polygonal_parts(&collection, &mut parts);
        let names: Vec<String> = parts.iter().map(|g| g.geometry_name()).collect();
        assert_eq!(names, vec!["POLYGON", "MULTIPOLYGON"]);

        let line = Geometry::from_wkt("LINESTRING (0 0, 1 1)").unwrap();
        polygonal_parts(&line, &mut parts);
        assert_eq!(parts.len(), 2);
    }

    #[test]
    fn test_closed_intersection_and_holes() {
        let a = rectangle(0.0, 0.0, 1.0, 1.0).unwrap();
        let edge = rectangle(1.0, 0.2, 2.0, 0.8).unwrap();
        assert!(a.intersects(&edge));

        let donut = Geometry::from_wkt(
            "POLYGON ((-1 -1, 3 -1, 3 3, -1 3, -1 -1), (-0.5 -0.5, 2 -0.5, 2 2, -0.5 2, -0.5 -0.5))",
        )
        .unwrap();
        assert!(!donut.intersects(&a));
    }
}
