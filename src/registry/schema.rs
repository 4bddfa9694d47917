use rusqlite_migration::{Migrations, M};

pub fn migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(
        "CREATE TABLE tileset (
            tilescheme  TEXT PRIMARY KEY,
            location    TEXT NOT NULL,
            e_tag       TEXT,
            downloaded  TEXT NOT NULL
        );

        CREATE TABLE tiles (
            tilename                 TEXT PRIMARY KEY,
            geotiff_link             TEXT,
            rat_link                 TEXT,
            delivered_date           TEXT,
            resolution               TEXT,
            utm                      TEXT,
            subregion                TEXT,
            geotiff_disk             TEXT,
            rat_disk                 TEXT,
            geotiff_sha256_checksum  TEXT,
            rat_sha256_checksum      TEXT,
            geotiff_verified         INTEGER,
            rat_verified             INTEGER
        );

        CREATE TABLE vrt_subregion (
            region        TEXT PRIMARY KEY,
            utm           TEXT,
            res_2_vrt     TEXT,
            res_2_ovr     TEXT,
            res_4_vrt     TEXT,
            res_4_ovr     TEXT,
            res_8_vrt     TEXT,
            res_8_ovr     TEXT,
            complete_vrt  TEXT,
            complete_ovr  TEXT,
            built         INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE vrt_utm (
            utm      TEXT PRIMARY KEY,
            utm_vrt  TEXT,
            utm_ovr  TEXT,
            built    INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX idx_tiles_subregion ON tiles(subregion);
        CREATE INDEX idx_tiles_utm ON tiles(utm);",
    )])
}
