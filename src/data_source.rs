use crate::s3::DEFAULT_REGION;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use toml;

/// A product published by the National Bathymetric Source, e.g. BlueTopo.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct DataSource {
    pub name: String,
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default)]
    pub profile: Option<String>,
    pub tile_scheme_prefix: String,
    pub tile_prefix: String,
}

fn default_region() -> String {
    DEFAULT_REGION.to_string()
}

impl DataSource {
    /// Lowercase form used for the registry and plan file names.
    pub fn slug(&self) -> String {
        self.name.to_lowercase()
    }

    pub fn registry_file_name(&self) -> String {
        format!("{}_registry.db", self.slug())
    }

    pub fn vrt_dir_name(&self) -> String {
        format!("{}_VRT", self.name)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct DataSources {
    sources: Vec<DataSource>,
}

pub fn data_sources_toml() -> toml::Table {
    toml::toml! {
        [[sources]]
        name = "BlueTopo"
        bucket = "noaa-ocs-nationalbathymetry-pds"
        region = "us-east-1"
        tile_scheme_prefix = "BlueTopo/_BlueTopo_Tile_Scheme/BlueTopo_Tile_Scheme"
        tile_prefix = "BlueTopo"

        [[sources]]
        name = "Modeling"
        bucket = "noaa-ocs-nationalbathymetry-pds"
        region = "us-east-1"
        tile_scheme_prefix = "Test-and-Evaluation/Modeling/_Modeling_Tile_Scheme/Modeling_Tile_Scheme"
        tile_prefix = "Test-and-Evaluation/Modeling"
    }
}

impl DataSources {
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let sources: Self = toml::from_str(&content)?;
        Ok(sources)
    }

    #[allow(dead_code)]
    pub fn write<P: AsRef<Path>>(self: &Self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn from_template(table: &toml::Table) -> Result<Self> {
        let sources: Self = toml::from_str(&table.to_string())?;
        Ok(sources)
    }

    pub fn builtin() -> Result<Self> {
        Self::from_template(&data_sources_toml())
    }

    /// Built-in sources, with entries from an optional config file replacing those of the same name.
    pub fn load(config: Option<&Path>) -> Result<Self> {
        let builtin = Self::builtin()?;
        match config {
            Some(path) => Ok(builtin.merge(Self::read(path)?)),
            None => Ok(builtin),
        }
    }

    pub fn merge(self: Self, overrides: Self) -> Self {
        let mut sources = self.sources;
        for source in overrides.sources {
            match sources
                .iter_mut()
                .find(|s| s.name.eq_ignore_ascii_case(&source.name))
            {
                Some(existing) => *existing = source,
                None => sources.push(source),
            }
        }
        Self { sources }
    }

    pub fn get(self: &Self, target: &str) -> Result<DataSource> {
        self.sources
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(target))
            .cloned()
            .ok_or(anyhow!("Invalid target data: {}", target))
    }

    pub fn names(self: &Self) -> Vec<&str> {
        self.sources.iter().map(|s| s.name.as_str()).collect()
    }
}
