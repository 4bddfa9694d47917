//! Utility functions for creating s3 clients and the object operations the syncer relies on
use crate::data_source::DataSource;
use anyhow::Result;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::operation::get_object::GetObjectOutput;
use aws_sdk_s3::operation::head_object::HeadObjectOutput;
use aws_sdk_s3::Client;

pub const DEFAULT_REGION: &str = "us-east-1";

/// An object returned by a bucket listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub key: String,
    pub size: u64,
    pub e_tag: Option<String>,
}

pub async fn client_from_profile(
    profile_name: &str,
    region: &str,
    endpoint_url: Option<&str>,
) -> Client {
    let base_config = aws_config::from_env()
        .profile_name(profile_name)
        .load()
        .await;

    let mut s3_config = aws_sdk_s3::config::Builder::from(&base_config)
        .region(Region::new(region.to_owned()))
        .force_path_style(true);
    if let Some(url) = endpoint_url {
        s3_config = s3_config.endpoint_url(url);
    }

    Client::from_conf(s3_config.build())
}

/// The NBS bucket is public, so requests go out unsigned.
pub async fn anon_client(region: &str, endpoint_url: Option<&str>) -> Client {
    let region = Region::new(region.to_owned());
    let mut loader = aws_config::defaults(BehaviorVersion::latest())
        .no_credentials()
        .region(region);
    if let Some(url) = endpoint_url {
        loader = loader.endpoint_url(url);
    }
    let config = loader.load().await;
    Client::new(&config)
}

pub trait S3ObjOps {
    async fn list_objects(self: &Self, bucket: &str, prefix: &str) -> Result<Vec<RemoteObject>>;

    async fn head_object(self: &Self, bucket: &str, key: &str) -> Result<HeadObjectOutput>;

    async fn get_object_range(
        self: &Self,
        bucket: &str,
        key: &str,
        start_byte: u64,
        end_byte: u64,
    ) -> Result<GetObjectOutput>;
}

pub struct Provider {
    client: Client,
}

impl Provider {
    /// Anonymous client unless the data source names a credentials profile.
    pub async fn for_source(source: &DataSource) -> Self {
        let endpoint = source.endpoint_url.as_deref();
        let client = match source.profile.as_deref() {
            Some(profile) => client_from_profile(profile, &source.region, endpoint).await,
            None => anon_client(&source.region, endpoint).await,
        };
        Self { client }
    }
}

impl S3ObjOps for Provider {
    async fn list_objects(self: &Self, bucket: &str, prefix: &str) -> Result<Vec<RemoteObject>> {
        let pages = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .into_paginator()
            .send()
            .try_collect()
            .await?;

        let objects = pages
            .iter()
            .flat_map(|page| page.contents())
            .filter_map(|object| {
                Some(RemoteObject {
                    key: object.key()?.to_owned(),
                    size: object.size().unwrap_or(0).max(0) as u64,
                    e_tag: object.e_tag().map(str::to_owned),
                })
            })
            .collect();
        Ok(objects)
    }

    async fn head_object(self: &Self, bucket: &str, key: &str) -> Result<HeadObjectOutput> {
        let head = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await?;
        Ok(head)
    }

    async fn get_object_range(
        self: &Self,
        bucket: &str,
        key: &str,
        start_byte: u64,
        end_byte: u64,
    ) -> Result<GetObjectOutput> {
        let range = format!("bytes={}-{}", start_byte, end_byte);
        let object = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .range(range)
            .send()
            .await?;
        Ok(object)
    }
}
