use anyhow::{anyhow, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::OnceLock;

/// Location of an object in a bucket, parsed from the links published in the tile scheme.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Object {
    pub region: Option<String>,
    pub bucket: String,
    pub key: String,
}

fn link_patterns() -> &'static [Regex; 2] {
    static PATTERNS: OnceLock<[Regex; 2]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            Regex::new(
                r"^https?://(?<bucket>[\w.-]+?)\.s3(?:[.-](?<region>[\w-]+))?\.amazonaws\.com/(?<key>.+)$",
            )
            .expect("Regex pattern should always compile"),
            Regex::new(r"^s3://(?<bucket>[\w.-]+)/(?<key>.+)$")
                .expect("Regex pattern should always compile"),
        ]
    })
}

impl S3Object {
    pub fn new(bucket: &str, key: &str) -> Self {
        Self {
            region: None,
            bucket: bucket.to_owned(),
            key: key.to_owned(),
        }
    }

    /// Accepts virtual-hosted style https links (with or without a region) and `s3://` urls.
    pub fn from_url(url: &str) -> Result<Self> {
        let url = url.trim();
        let captures = link_patterns()
            .iter()
            .find_map(|re| re.captures(url))
            .ok_or(anyhow!("No regex matches found for: {}", url))?;

        Ok(Self {
            region: captures.name("region").map(|m| m.as_str().to_string()),
            bucket: captures["bucket"].to_string(),
            key: captures["key"].to_string(),
        })
    }

    pub fn file_name(&self) -> Option<&str> {
        Path::new(&self.key).file_name()?.to_str()
    }

    pub fn to_url(&self) -> String {
        format!("https://{}.s3.amazonaws.com/{}", self.bucket, self.key)
    }
}
