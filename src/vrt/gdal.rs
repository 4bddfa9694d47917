//! Raster operations delegated to the GDAL command line utilities.
use crate::error::VrtError;
use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Component, Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, warn};

pub trait RasterTools {
    /// Mosaics `inputs` into a VRT at `vrt`. Paths inside the VRT are written relative to
    /// the VRT when `relative_to_vrt` is set, absolute otherwise.
    async fn build_vrt(self: &Self, inputs: &[PathBuf], vrt: &Path, relative_to_vrt: bool)
        -> Result<()>;

    /// Builds an external `.ovr` overview file next to `vrt`.
    async fn build_overviews(self: &Self, vrt: &Path, levels: &[u32]) -> Result<()>;
}

/// Runs `gdalbuildvrt` and `gdaladdo` from the `PATH`.
pub struct GdalCli {
    gdalbuildvrt: String,
    gdaladdo: String,
}

impl Default for GdalCli {
    fn default() -> Self {
        Self {
            gdalbuildvrt: "gdalbuildvrt".to_string(),
            gdaladdo: "gdaladdo".to_string(),
        }
    }
}

impl GdalCli {
    /// Fails early when the utilities are not installed.
    pub async fn check(self: &Self) -> Result<()> {
        let output = Command::new(&self.gdalbuildvrt)
            .arg("--version")
            .output()
            .await
            .with_context(|| format!("Unable to run {}; is GDAL installed?", self.gdalbuildvrt))?;
        debug!("{}", String::from_utf8_lossy(&output.stdout).trim());
        Ok(())
    }

    async fn run(self: &Self, command: &mut Command, tool: &str) -> Result<()> {
        let output = command
            .output()
            .await
            .with_context(|| format!("Unable to run {}", tool))?;
        if !output.status.success() {
            return Err(VrtError::Tool {
                tool: tool.to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .into());
        }
        Ok(())
    }
}

impl RasterTools for GdalCli {
    async fn build_vrt(
        self: &Self,
        inputs: &[PathBuf],
        vrt: &Path,
        relative_to_vrt: bool,
    ) -> Result<()> {
        let vrt_dir = vrt
            .parent()
            .ok_or(anyhow!("No parent directory for {}", vrt.display()))?;
        let vrt_name = vrt
            .file_name()
            .ok_or(anyhow!("Invalid VRT path {}", vrt.display()))?;

        let listed: Vec<String> = inputs
            .iter()
            .map(|input| {
                let path = if relative_to_vrt {
                    relative_path(vrt_dir, input)
                } else {
                    input.clone()
                };
                path.to_string_lossy().into_owned()
            })
            .collect();
        let mut file_list = vrt.as_os_str().to_owned();
        file_list.push(".inputs.txt");
        fs::write(&file_list, listed.join("\n"))?;

        debug!("gdalbuildvrt {} from {} input(s)", vrt.display(), inputs.len());
        // Run from the VRT's directory so relative inputs resolve against it
        let result = self
            .run(
                Command::new(&self.gdalbuildvrt)
                    .current_dir(vrt_dir)
                    .args(["-srcnodata", "nan", "-vrtnodata", "nan"])
                    .args(["-r", "near", "-resolution", "highest", "-overwrite"])
                    .arg("-input_file_list")
                    .arg(&file_list)
                    .arg(vrt_name),
                "gdalbuildvrt",
            )
            .await;
        if let Err(e) = fs::remove_file(&file_list) {
            warn!("Unable to remove {}: {}", Path::new(&file_list).display(), e);
        }
        result
    }

    async fn build_overviews(self: &Self, vrt: &Path, levels: &[u32]) -> Result<()> {
        debug!("gdaladdo {} {:?}", vrt.display(), levels);
        self.run(
            Command::new(&self.gdaladdo)
                .args(["-ro", "-r", "nearest"])
                .args(["--config", "COMPRESS_OVERVIEW", "DEFLATE"])
                .args(["--config", "GDAL_NUM_THREADS", "ALL_CPUS"])
                .arg(vrt)
                .args(levels.iter().map(|l| l.to_string())),
            "gdaladdo",
        )
        .await
    }
}

/// Path of `target` as seen from directory `base`. Both must be absolute.
pub fn relative_path(base: &Path, target: &Path) -> PathBuf {
    let base: Vec<Component> = base.components().collect();
    let target: Vec<Component> = target.components().collect();
    let common = base
        .iter()
        .zip(&target)
        .take_while(|(a, b)| a == b)
        .count();

    let mut relative = PathBuf::new();
    for _ in common..base.len() {
        relative.push("..");
    }
    for component in &target[common..] {
        relative.push(component.as_os_str());
    }
    relative
}
