use crate::error::SyncError;
use crate::registry::{Registry, TrackedTile};
use crate::s3::S3ObjOps;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// One object to fetch. `output` is relative to the project directory.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct DownloadTask {
    pub bucket: String,
    pub key: String,
    pub output: String,
    pub checksum: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

impl DownloadTask {
    pub fn new(bucket: &str, key: &str, output: &str, checksum: Option<&str>) -> Self {
        DownloadTask {
            bucket: bucket.to_string(),
            key: key.to_string(),
            output: output.to_string(),
            checksum: checksum.map(str::to_string),
            size: None,
        }
    }
}

/// Both assets of a tile, with the manifest entry to store once they are on disk.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct TileTask {
    pub record: TrackedTile,
    pub geotiff: DownloadTask,
    pub rat: DownloadTask,
    /// Files of the version being replaced, removed after a successful fetch.
    #[serde(default)]
    pub superseded: Vec<String>,
}

#[derive(Deserialize, Serialize, Debug, Default)]
pub struct DownloadPlan {
    pub target: String,
    /// Tracked tiles already up to date.
    pub existing: Vec<String>,
    /// Tracked tiles left alone because the catalog has no usable entry for them.
    pub untouched: Vec<String>,
    pub tasks: Vec<TileTask>,
}

/// Outcome of executing a plan.
#[derive(Debug, Default)]
pub struct FetchReport {
    pub existing: Vec<String>,
    pub fetched: Vec<String>,
    pub failed: Vec<SyncError>,
    pub bytes: u64,
}

impl DownloadPlan {
    pub fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            ..Default::default()
        }
    }

    #[allow(dead_code)]
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let plan: Self = serde_json::from_str(&content)?;
        Ok(plan)
    }

    pub fn write<P: AsRef<Path>>(self: &Self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Fills in object sizes from the store. Objects that cannot be reached keep `None`.
    pub async fn resolve_sizes(self: &mut Self, provider: &impl S3ObjOps) {
        for task in self.tasks.iter_mut() {
            for asset in [&mut task.geotiff, &mut task.rat] {
                match provider.head_object(&asset.bucket, &asset.key).await {
                    Ok(head) => asset.size = head.content_length().map(|l| l.max(0) as u64),
                    Err(e) => warn!("Unable to read size of {}: {}", asset.key, e),
                }
            }
        }
    }

    /// Fetches every task in order. A failing tile is reported and skipped.
    pub async fn execute(
        self: &Self,
        provider: &impl S3ObjOps,
        root: &Path,
        registry: &Registry,
    ) -> Result<FetchReport> {
        let mut report = FetchReport {
            existing: self.existing.clone(),
            ..Default::default()
        };
        for (idx, task) in self.tasks.iter().enumerate() {
            let tile = &task.record.tilename;
            info!("Fetching {} ({}/{})", tile, idx + 1, self.tasks.len());
            match fetch_tile(provider, root, task).await {
                Ok((record, bytes)) => {
                    registry.record_fetch(&record)?;
                    remove_superseded(root, task);
                    report.bytes += bytes;
                    report.fetched.push(tile.clone());
                }
                Err(e) => {
                    let err = SyncError::FetchFailed {
                        tile: tile.clone(),
                        reason: format!("{:#}", e),
                    };
                    warn!("{}", err);
                    report.failed.push(err);
                }
            }
        }
        Ok(report)
    }
}

async fn fetch_tile(
    provider: &impl S3ObjOps,
    root: &Path,
    task: &TileTask,
) -> Result<(TrackedTile, u64)> {
    // A new version published under the same name must not be mistaken for a finished download.
    for output in [&task.geotiff.output, &task.rat.output] {
        if task.superseded.contains(output) {
            remove_file(&root.join(output));
        }
    }

    let (geotiff_bytes, geotiff_verified) = fetch_asset(provider, root, &task.geotiff).await?;
    let (rat_bytes, rat_verified) = match fetch_asset(provider, root, &task.rat).await {
        Ok(fetched) => fetched,
        Err(e) => {
            if let Some(SyncError::ChecksumMismatch { .. }) = e.downcast_ref::<SyncError>() {
                remove_file(&root.join(&task.geotiff.output));
            }
            return Err(e);
        }
    };

    let record = TrackedTile {
        geotiff_disk: Some(task.geotiff.output.clone()),
        rat_disk: Some(task.rat.output.clone()),
        geotiff_verified,
        rat_verified,
        ..task.record.clone()
    };
    Ok((record, geotiff_bytes + rat_bytes))
}

/// Downloads and verifies one asset. Returns the bytes transferred and whether a
/// checksum was checked.
async fn fetch_asset(
    provider: &impl S3ObjOps,
    root: &Path,
    task: &DownloadTask,
) -> Result<(u64, Option<bool>)> {
    let dst = root.join(&task.output);
    let bytes = try_download(provider, &task.bucket, &task.key, &dst).await?;
    let Some(expected) = &task.checksum else {
        return Ok((bytes, None));
    };

    let found = sha256_file(&dst)?;
    if !found.eq_ignore_ascii_case(expected) {
        remove_file(&dst);
        return Err(SyncError::ChecksumMismatch {
            path: task.output.clone(),
            expected: expected.clone(),
            found,
        }
        .into());
    }
    Ok((bytes, Some(true)))
}

fn remove_superseded(root: &Path, task: &TileTask) {
    for path in &task.superseded {
        if *path != task.geotiff.output && *path != task.rat.output {
            remove_file(&root.join(path));
        }
    }
}

fn remove_file(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("Removed {}", path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!("Unable to remove {}: {}", path.display(), e),
    }
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Identifies the remote object version a partial download belongs to.
fn version_stamp(e_tag: Option<&str>, size: u64) -> String {
    format!("{} {}", e_tag.unwrap_or("-"), size)
}

fn sidecar(dst: &Path, suffix: &str) -> PathBuf {
    let mut path = dst.as_os_str().to_owned();
    path.push(suffix);
    PathBuf::from(path)
}

/// Downloads an object to `dst`, resuming from `<dst>.partial` if an earlier attempt
/// was interrupted. The partial is only resumed when `<dst>.partial.version` matches the
/// remote ETag and size, otherwise it starts over. Returns the number of bytes
/// transferred, 0 if `dst` already exists.
pub async fn try_download(
    provider: &impl S3ObjOps,
    bucket: &str,
    key: &str,
    dst: &Path,
) -> Result<u64> {
    if dst.exists() {
        debug!("{} already exists", dst.display());
        return Ok(0);
    }

    let parent_dir = dst
        .parent()
        .ok_or(anyhow!("No parent directory for {}", dst.display()))?;
    if !parent_dir.exists() {
        fs::create_dir_all(parent_dir)?;
    }

    let partial = sidecar(dst, ".partial");
    let stamp_path = sidecar(dst, ".partial.version");
    let mut partial_file = OpenOptions::new()
        .read(true)
        .create(true)
        .append(true)
        .open(&partial)?;
    let mut byte_count = partial_file.metadata()?.len();
    let mut resumed_from = byte_count;

    let head_object = provider.head_object(bucket, key).await?;
    let total_size = head_object
        .content_length()
        .ok_or(anyhow!("Error reading size of remote object"))? as u64;

    let stamp = version_stamp(head_object.e_tag(), total_size);
    let recorded = fs::read_to_string(&stamp_path).ok();
    if byte_count > 0 && (byte_count > total_size || recorded.as_deref() != Some(stamp.as_str())) {
        debug!("Discarding partial download of another version of {}", key);
        partial_file.set_len(0)?;
        byte_count = 0;
        resumed_from = 0;
    } else if byte_count > 0 {
        let progress = (byte_count as f64 / total_size as f64) * 100.;
        info!("Resuming {} from {:.2}% completion", key, progress);
    }

    if recorded.as_deref() != Some(stamp.as_str()) {
        fs::write(&stamp_path, &stamp)?;
    }

    if byte_count < total_size {
        debug!("Downloading s3://{}/{}", bucket, key);
        let mut response = provider
            .get_object_range(bucket, key, byte_count, total_size - 1)
            .await?;

        while let Some(bytes) = response.body.try_next().await? {
            partial_file.write_all(&bytes)?;
            byte_count += bytes.len() as u64;
        }
    }

    if byte_count != total_size {
        return Err(anyhow!(
            "Incomplete download of {}: {} of {} bytes",
            key,
            byte_count,
            total_size
        ));
    }

    fs::rename(&partial, dst)?;
    if let Err(e) = fs::remove_file(&stamp_path) {
        warn!("Unable to remove {}: {}", stamp_path.display(), e);
    }
    Ok(byte_count - resumed_from)
}
