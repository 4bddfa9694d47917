//! Assignment of tiles to the global 1.2 degree subregion grid used to group VRTs.
use crate::geometry::{rectangle, BoundingBox, Geometry};
use anyhow::{anyhow, Result};

const REGION_ALPHABET: &str = "BCDFGHJKLMNPQRSTVWXZ";
const CELL_ALPHABET: &str = "2456789BCDFGHJKLMNPQRSTVWXZ";
const TILESET_INDEX: u64 = 1;

/// Cell size in tenths of a degree.
const CELL_TENTHS: i64 = 12;
const COLUMNS: i64 = 3600 / CELL_TENTHS;
const ROWS: i64 = 1800 / CELL_TENTHS;
/// Cells are shrunk by this many degrees so tiles on a shared edge land in one cell.
const CELL_BUFFER: f64 = 0.002;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subregion {
    pub name: String,
    pub utm_zone: String,
}

/// Writes `input` in the base given by the length of `charset`, left padded to `minimum`
/// with the charset's first symbol.
pub fn convert_base(charset: &str, mut input: u64, minimum: usize) -> String {
    let symbols: Vec<char> = charset.chars().collect();
    let base = symbols.len() as u64;
    let mut digits = vec![];
    while input > 0 {
        digits.push(symbols[(input % base) as usize]);
        input /= base;
    }
    if digits.is_empty() {
        digits.push(symbols[0]);
    }
    while digits.len() < minimum {
        digits.push(symbols[0]);
    }
    digits.iter().rev().collect()
}

fn cell(column: i64, row: i64) -> Result<(Subregion, Geometry)> {
    let left = (-1800 + column * CELL_TENTHS) as f64 / 10.0;
    let bottom = (-900 + row * CELL_TENTHS) as f64 / 10.0;
    let right = left + CELL_TENTHS as f64 / 10.0;
    let top = bottom + CELL_TENTHS as f64 / 10.0;

    let utm = ((180.0 + left + 0.000_000_01) / 6.0).ceil() as i64;
    let name = format!(
        "{}{}{}",
        convert_base(REGION_ALPHABET, TILESET_INDEX, 2),
        convert_base(CELL_ALPHABET, column as u64, 3),
        convert_base(CELL_ALPHABET, row as u64, 3)
    );
    let footprint = rectangle(
        left + CELL_BUFFER,
        bottom + CELL_BUFFER,
        right - CELL_BUFFER,
        top - CELL_BUFFER,
    )?;
    Ok((
        Subregion {
            name,
            utm_zone: format!("{utm:02}"),
        },
        footprint,
    ))
}

fn index_range(min: f64, max: f64, origin: f64, count: i64) -> std::ops::RangeInclusive<i64> {
    let size = CELL_TENTHS as f64 / 10.0;
    let first = ((min - origin) / size).floor() as i64;
    let last = ((max - origin) / size).floor() as i64;
    first.clamp(0, count - 1)..=last.clamp(0, count - 1)
}

/// The single subregion a tile footprint falls in.
pub fn locate(footprint: &Geometry) -> Result<Subregion> {
    if footprint.is_empty() {
        return Err(anyhow!("Tile footprint has no geometry"));
    }
    let bbox = BoundingBox::of(footprint);

    let mut matches = vec![];
    for column in index_range(bbox.min_x, bbox.max_x, -180.0, COLUMNS) {
        for row in index_range(bbox.min_y, bbox.max_y, -90.0, ROWS) {
            let (subregion, cell_footprint) = cell(column, row)?;
            if footprint.intersects(&cell_footprint) {
                matches.push(subregion);
            }
        }
    }

    match matches.len() {
        1 => Ok(matches.remove(0)),
        n => Err(anyhow!(
            "Error getting subregion: footprint spans {} subregion(s)",
            n
        )),
    }
}
