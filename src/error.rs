use thiserror::Error;

/// Errors raised while syncing the local project directory with the remote catalog.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The catalog could not be listed. Fatal for the run.
    #[error("Unable to list s3://{bucket}/{prefix}: {reason}")]
    RemoteUnavailable {
        bucket: String,
        prefix: String,
        reason: String,
    },

    /// A single tile could not be transferred. The run continues with the next tile.
    #[error("Failed to fetch tile {tile}: {reason}")]
    FetchFailed { tile: String, reason: String },

    #[error("Checksum mismatch for {path}: expected {expected}, found {found}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        found: String,
    },
}

#[derive(Error, Debug)]
pub enum GeometryError {
    #[error("No polygons found in {0}")]
    Empty(String),

    #[error("Unable to reproject {path} to the tile scheme spatial reference: {reason}")]
    Reprojection { path: String, reason: String },
}

#[derive(Error, Debug)]
pub enum VrtError {
    #[error("{tool} exited with {status}: {stderr}")]
    Tool {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("Overview was not created for {0}")]
    MissingOverview(String),

    #[error("Unexpected raster attribute table field order in {path}: expected {expected}, found {found}")]
    FieldOrder {
        path: String,
        expected: String,
        found: String,
    },

    #[error("Malformed VRT {0}: {1}")]
    Malformed(String, String),
}
