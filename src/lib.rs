#![allow(async_fn_in_trait)]
pub mod aoi;
pub mod catalog;
pub mod data_source;
pub mod download_plan;
pub mod error;
pub mod geometry;
pub mod logging;
pub mod registry;
pub mod s3;
pub mod s3_operations;
pub mod selector;
pub mod subregion;
pub mod sync;
pub mod vrt;

#[cfg(test)]
mod test_support;
