//! S3 implementation of [`ObjectStore`]

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use objsweep_common::ObjectDescriptor;
use tracing::{debug, info, instrument};

use crate::config::StorageConfig;
use crate::store::{ObjectBody, ObjectPage, ObjectStore};

#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
}

impl S3ObjectStore {
    /// Build a client from explicit keys if given, otherwise from the named
    /// profile or the default provider chain
    pub async fn new(config: &StorageConfig) -> Result<Self> {
        debug!(
            endpoint = ?config.endpoint,
            region = %config.region,
            profile = ?config.profile,
            "Initializing S3 client"
        );

        let region = Region::new(config.region.clone());

        let mut builder = match (&config.access_key, &config.secret_key) {
            (Some(access_key), Some(secret_key)) => {
                let credentials =
                    Credentials::new(access_key, secret_key, None, None, "objsweep-config");
                aws_sdk_s3::Config::builder()
                    .behavior_version(BehaviorVersion::latest())
                    .credentials_provider(credentials)
                    .region(region)
            },
            (Some(_), None) | (None, Some(_)) => {
                anyhow::bail!("S3 access key and secret key must be set together")
            },
            (None, None) => {
                let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(region);
                if let Some(profile) = &config.profile {
                    loader = loader.profile_name(profile);
                }
                let shared = loader.load().await;
                aws_sdk_s3::config::Builder::from(&shared)
            },
        };

        builder = builder.force_path_style(config.path_style);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(builder.build());
        info!(region = %config.region, "S3 client initialized");

        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

fn to_chrono(timestamp: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(timestamp.secs(), timestamp.subsec_nanos())
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self))]
    async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        token: Option<String>,
    ) -> Result<ObjectPage> {
        let response = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .set_continuation_token(token)
            .send()
            .await
            .with_context(|| format!("Failed to list s3://{}/{}", bucket, prefix))?;

        let objects = response
            .contents()
            .iter()
            .filter_map(|object| {
                let key = object.key()?;
                let mut descriptor =
                    ObjectDescriptor::new(bucket, key, object.size().unwrap_or_default());
                if let Some(modified) = object.last_modified().and_then(to_chrono) {
                    descriptor = descriptor.with_last_modified(modified);
                }
                Some(descriptor)
            })
            .collect();

        let next_token = if response.is_truncated().unwrap_or(false) {
            response.next_continuation_token().map(str::to_string)
        } else {
            None
        };

        Ok(ObjectPage {
            objects,
            next_token,
        })
    }

    #[instrument(skip(self))]
    async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectBody> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("Failed to download s3://{}/{}", bucket, key))?;

        Ok(Box::new(Box::pin(response.body.into_async_read())))
    }
}
