//! The local manifest: a SQLite database in the project directory recording which tiles
//! are tracked, which version of each is on disk, and the build state of the VRTs.
mod schema;

use crate::data_source::DataSource;
use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const TILE_SCHEME: &str = "Tessellation";

/// The tile scheme GeoPackage most recently downloaded.
#[derive(Debug, Clone, PartialEq)]
pub struct TileScheme {
    pub location: String,
    pub e_tag: Option<String>,
    pub downloaded: String,
}

/// A tracked tile. Paths are relative to the project directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackedTile {
    pub tilename: String,
    pub geotiff_link: Option<String>,
    pub rat_link: Option<String>,
    pub delivered_date: Option<String>,
    pub resolution: Option<String>,
    pub utm: Option<String>,
    pub subregion: Option<String>,
    pub geotiff_disk: Option<String>,
    pub rat_disk: Option<String>,
    pub geotiff_sha256_checksum: Option<String>,
    pub rat_sha256_checksum: Option<String>,
    pub geotiff_verified: Option<bool>,
    pub rat_verified: Option<bool>,
}

impl TrackedTile {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            tilename: row.get("tilename")?,
            geotiff_link: row.get("geotiff_link")?,
            rat_link: row.get("rat_link")?,
            delivered_date: row.get("delivered_date")?,
            resolution: row.get("resolution")?,
            utm: row.get("utm")?,
            subregion: row.get("subregion")?,
            geotiff_disk: row.get("geotiff_disk")?,
            rat_disk: row.get("rat_disk")?,
            geotiff_sha256_checksum: row.get("geotiff_sha256_checksum")?,
            rat_sha256_checksum: row.get("rat_sha256_checksum")?,
            geotiff_verified: row.get("geotiff_verified")?,
            rat_verified: row.get("rat_verified")?,
        })
    }

    pub fn disk_paths(&self) -> impl Iterator<Item = &str> {
        self.geotiff_disk
            .as_deref()
            .into_iter()
            .chain(self.rat_disk.as_deref())
    }

    /// Both files recorded and present.
    pub fn files_on_disk(&self, root: &Path) -> bool {
        match (&self.geotiff_disk, &self.rat_disk) {
            (Some(geotiff), Some(rat)) => root.join(geotiff).is_file() && root.join(rat).is_file(),
            _ => false,
        }
    }

    /// A recorded path whose file is gone.
    pub fn has_missing_file(&self, root: &Path) -> bool {
        self.disk_paths().any(|p| !root.join(p).is_file())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubregionVrt {
    pub region: String,
    pub utm: Option<String>,
    pub res_2_vrt: Option<String>,
    pub res_2_ovr: Option<String>,
    pub res_4_vrt: Option<String>,
    pub res_4_ovr: Option<String>,
    pub res_8_vrt: Option<String>,
    pub res_8_ovr: Option<String>,
    pub complete_vrt: Option<String>,
    pub complete_ovr: Option<String>,
    pub built: bool,
}

impl SubregionVrt {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            region: row.get("region")?,
            utm: row.get("utm")?,
            res_2_vrt: row.get("res_2_vrt")?,
            res_2_ovr: row.get("res_2_ovr")?,
            res_4_vrt: row.get("res_4_vrt")?,
            res_4_ovr: row.get("res_4_ovr")?,
            res_8_vrt: row.get("res_8_vrt")?,
            res_8_ovr: row.get("res_8_ovr")?,
            complete_vrt: row.get("complete_vrt")?,
            complete_ovr: row.get("complete_ovr")?,
            built: row.get("built")?,
        })
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        [
            &self.res_2_vrt,
            &self.res_2_ovr,
            &self.res_4_vrt,
            &self.res_4_ovr,
            &self.res_8_vrt,
            &self.res_8_ovr,
            &self.complete_vrt,
            &self.complete_ovr,
        ]
        .into_iter()
        .filter_map(|p| p.as_deref())
    }

    /// Any recorded file missing, or the complete VRT and its overview not recorded at all.
    pub fn is_missing_files(&self, root: &Path) -> bool {
        self.complete_vrt.is_none()
            || self.complete_ovr.is_none()
            || self.paths().any(|p| !root.join(p).is_file())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UtmVrt {
    pub utm: String,
    pub utm_vrt: Option<String>,
    pub utm_ovr: Option<String>,
    pub built: bool,
}

impl UtmVrt {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            utm: row.get("utm")?,
            utm_vrt: row.get("utm_vrt")?,
            utm_ovr: row.get("utm_ovr")?,
            built: row.get("built")?,
        })
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.utm_vrt
            .as_deref()
            .into_iter()
            .chain(self.utm_ovr.as_deref())
    }

    pub fn is_missing_files(&self, root: &Path) -> bool {
        match (&self.utm_vrt, &self.utm_ovr) {
            (Some(vrt), Some(ovr)) => !root.join(vrt).is_file() || !root.join(ovr).is_file(),
            _ => true,
        }
    }
}

pub struct Registry {
    conn: Connection,
}

impl Registry {
    pub fn path(root: &Path, source: &DataSource) -> PathBuf {
        root.join(source.registry_file_name())
    }

    pub fn open(root: &Path, source: &DataSource) -> Result<Self> {
        let path = Self::path(root, source);
        let conn = Connection::open(&path)
            .with_context(|| format!("Failed to open registry {}", path.display()))?;
        Self::migrate(conn)
    }

    /// Open an in-memory registry (for testing).
    #[allow(dead_code)]
    pub fn open_in_memory() -> Result<Self> {
        Self::migrate(Connection::open_in_memory()?)
    }

    fn migrate(mut conn: Connection) -> Result<Self> {
        schema::migrations()
            .to_latest(&mut conn)
            .map_err(|e| anyhow!("Failed to migrate registry: {}", e))?;
        Ok(Self { conn })
    }

    pub fn tile_scheme(&self) -> Result<Option<TileScheme>> {
        let scheme = self
            .conn
            .query_row(
                "SELECT location, e_tag, downloaded FROM tileset WHERE tilescheme = ?1",
                [TILE_SCHEME],
                |row| {
                    Ok(TileScheme {
                        location: row.get(0)?,
                        e_tag: row.get(1)?,
                        downloaded: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(scheme)
    }

    pub fn set_tile_scheme(&self, scheme: &TileScheme) -> Result<()> {
        self.conn.execute(
            "REPLACE INTO tileset (tilescheme, location, e_tag, downloaded) VALUES (?1, ?2, ?3, ?4)",
            params![TILE_SCHEME, scheme.location, scheme.e_tag, scheme.downloaded],
        )?;
        Ok(())
    }

    /// Adds tiles to tracking. Already tracked tiles are left as they are.
    /// Returns the number of newly tracked tiles.
    pub fn track<'a>(&self, tilenames: impl IntoIterator<Item = &'a str>) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let mut inserted = 0;
        {
            let mut stmt =
                tx.prepare("INSERT INTO tiles (tilename) VALUES (?1) ON CONFLICT DO NOTHING")?;
            for name in tilenames {
                inserted += stmt.execute([name])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    pub fn tracked_tiles(&self) -> Result<Vec<TrackedTile>> {
        self.select_tiles("SELECT * FROM tiles ORDER BY tilename", [])
    }

    pub fn tile(&self, tilename: &str) -> Result<Option<TrackedTile>> {
        let tile = self
            .conn
            .query_row(
                "SELECT * FROM tiles WHERE tilename = ?1",
                [tilename],
                TrackedTile::from_row,
            )
            .optional()?;
        Ok(tile)
    }

    pub fn tiles_in_subregion(&self, region: &str) -> Result<Vec<TrackedTile>> {
        self.select_tiles(
            "SELECT * FROM tiles WHERE subregion = ?1 ORDER BY tilename",
            [region],
        )
    }

    pub fn tiles_in_utm(&self, utm: &str) -> Result<Vec<TrackedTile>> {
        self.select_tiles("SELECT * FROM tiles WHERE utm = ?1 ORDER BY tilename", [utm])
    }

    fn select_tiles<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<TrackedTile>> {
        let mut stmt = self.conn.prepare(sql)?;
        let tiles = stmt
            .query_map(params, TrackedTile::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tiles)
    }

    /// Stores a freshly fetched tile and queues its subregion and UTM zone for a VRT rebuild.
    pub fn record_fetch(&self, tile: &TrackedTile) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO tiles (tilename, geotiff_link, rat_link, delivered_date, resolution,
                utm, subregion, geotiff_disk, rat_disk, geotiff_sha256_checksum,
                rat_sha256_checksum, geotiff_verified, rat_verified)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(tilename) DO UPDATE SET
                geotiff_link = excluded.geotiff_link,
                rat_link = excluded.rat_link,
                delivered_date = excluded.delivered_date,
                resolution = excluded.resolution,
                utm = excluded.utm,
                subregion = excluded.subregion,
                geotiff_disk = excluded.geotiff_disk,
                rat_disk = excluded.rat_disk,
                geotiff_sha256_checksum = excluded.geotiff_sha256_checksum,
                rat_sha256_checksum = excluded.rat_sha256_checksum,
                geotiff_verified = excluded.geotiff_verified,
                rat_verified = excluded.rat_verified",
            params![
                tile.tilename,
                tile.geotiff_link,
                tile.rat_link,
                tile.delivered_date,
                tile.resolution,
                tile.utm,
                tile.subregion,
                tile.geotiff_disk,
                tile.rat_disk,
                tile.geotiff_sha256_checksum,
                tile.rat_sha256_checksum,
                tile.geotiff_verified,
                tile.rat_verified,
            ],
        )?;
        if let Some(region) = &tile.subregion {
            tx.execute(
                "INSERT INTO vrt_subregion (region, utm, built) VALUES (?1, ?2, 0)
                 ON CONFLICT(region) DO UPDATE SET
                    utm = excluded.utm,
                    res_2_vrt = NULL, res_2_ovr = NULL,
                    res_4_vrt = NULL, res_4_ovr = NULL,
                    res_8_vrt = NULL, res_8_ovr = NULL,
                    complete_vrt = NULL, complete_ovr = NULL,
                    built = 0",
                params![region, tile.utm],
            )?;
        }
        if let Some(utm) = &tile.utm {
            tx.execute(
                "INSERT INTO vrt_utm (utm, built) VALUES (?1, 0)
                 ON CONFLICT(utm) DO UPDATE SET utm_vrt = NULL, utm_ovr = NULL, built = 0",
                [utm],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Removes a tile from tracking, returning the removed record.
    pub fn untrack(&self, tilename: &str) -> Result<Option<TrackedTile>> {
        let tile = self.tile(tilename)?;
        if tile.is_some() {
            self.conn
                .execute("DELETE FROM tiles WHERE tilename = ?1", [tilename])?;
        }
        Ok(tile)
    }

    /// Deletes subregion and UTM VRT rows no longer backed by a fetched tile.
    pub fn prune_vrts(&self) -> Result<(Vec<SubregionVrt>, Vec<UtmVrt>)> {
        let tx = self.conn.unchecked_transaction()?;
        let subregions = {
            let mut stmt = tx.prepare(
                "SELECT * FROM vrt_subregion WHERE region NOT IN
                    (SELECT subregion FROM tiles
                     WHERE subregion IS NOT NULL
                     AND geotiff_disk IS NOT NULL AND rat_disk IS NOT NULL)",
            )?;
            let rows = stmt
                .query_map([], SubregionVrt::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        let utms = {
            let mut stmt = tx.prepare(
                "SELECT * FROM vrt_utm WHERE utm NOT IN
                    (SELECT utm FROM tiles
                     WHERE utm IS NOT NULL
                     AND geotiff_disk IS NOT NULL AND rat_disk IS NOT NULL)",
            )?;
            let rows = stmt
                .query_map([], UtmVrt::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        for subregion in &subregions {
            tx.execute(
                "DELETE FROM vrt_subregion WHERE region = ?1",
                [&subregion.region],
            )?;
        }
        for utm in &utms {
            tx.execute("DELETE FROM vrt_utm WHERE utm = ?1", [&utm.utm])?;
        }
        tx.commit()?;
        Ok((subregions, utms))
    }

    pub fn subregions(&self, built: bool) -> Result<Vec<SubregionVrt>> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM vrt_subregion WHERE built = ?1 ORDER BY region")?;
        let rows = stmt
            .query_map([built], SubregionVrt::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn built_subregions_in_utm(&self, utm: &str) -> Result<Vec<SubregionVrt>> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM vrt_subregion WHERE utm = ?1 AND built = 1 ORDER BY region",
        )?;
        let rows = stmt
            .query_map([utm], SubregionVrt::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn update_subregion(&self, subregion: &SubregionVrt) -> Result<()> {
        self.conn.execute(
            "UPDATE vrt_subregion
             SET res_2_vrt = ?1, res_2_ovr = ?2, res_4_vrt = ?3, res_4_ovr = ?4,
                 res_8_vrt = ?5, res_8_ovr = ?6, complete_vrt = ?7, complete_ovr = ?8,
                 built = 1
             WHERE region = ?9",
            params![
                subregion.res_2_vrt,
                subregion.res_2_ovr,
                subregion.res_4_vrt,
                subregion.res_4_ovr,
                subregion.res_8_vrt,
                subregion.res_8_ovr,
                subregion.complete_vrt,
                subregion.complete_ovr,
                subregion.region,
            ],
        )?;
        Ok(())
    }

    /// Marks a subregion, and the UTM zone containing it, as needing a rebuild.
    pub fn reset_subregion(&self, subregion: &SubregionVrt) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE vrt_subregion
             SET res_2_vrt = NULL, res_2_ovr = NULL, res_4_vrt = NULL, res_4_ovr = NULL,
                 res_8_vrt = NULL, res_8_ovr = NULL, complete_vrt = NULL, complete_ovr = NULL,
                 built = 0
             WHERE region = ?1",
            [&subregion.region],
        )?;
        if let Some(utm) = &subregion.utm {
            tx.execute(
                "UPDATE vrt_utm SET utm_vrt = NULL, utm_ovr = NULL, built = 0 WHERE utm = ?1",
                [utm],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn utms(&self, built: bool) -> Result<Vec<UtmVrt>> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM vrt_utm WHERE built = ?1 ORDER BY utm")?;
        let rows = stmt
            .query_map([built], UtmVrt::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn update_utm(&self, utm: &UtmVrt) -> Result<()> {
        self.conn.execute(
            "UPDATE vrt_utm SET utm_vrt = ?1, utm_ovr = ?2, built = 1 WHERE utm = ?3",
            params![utm.utm_vrt, utm.utm_ovr, utm.utm],
        )?;
        Ok(())
    }

    pub fn reset_utm(&self, utm: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE vrt_utm SET utm_vrt = NULL, utm_ovr = NULL, built = 0 WHERE utm = ?1",
            [utm],
        )?;
        Ok(())
    }
}
