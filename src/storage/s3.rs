//! S3 implementation of [`ObjectStore`].

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::ObjectStore;
use crate::config::StorageConfig;
use crate::error::{DesubError, Result};

pub struct S3ObjectStore {
    client: Client,
}

impl S3ObjectStore {
    /// Builds a client from the default credential chain.
    ///
    /// Unless validation is disabled, credentials are checked with a bucket
    /// listing; any failure is reported as `RemoteUnavailable`.
    pub async fn connect(config: &StorageConfig) -> Result<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        let shared = loader.load().await;

        if shared.credentials_provider().is_none() {
            return Err(DesubError::RemoteUnavailable(
                "no credentials provider configured".to_string(),
            ));
        }

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        let client = Client::from_conf(builder.build());

        if !config.skip_validation {
            client.list_buckets().send().await.map_err(|e| {
                DesubError::RemoteUnavailable(format!(
                    "credential check failed: {}",
                    DisplayErrorContext(&e)
                ))
            })?;
        }

        Ok(Self { client })
    }
}

fn transfer_error<E: std::error::Error>(bucket: &str, key: &str, e: E) -> DesubError {
    DesubError::Transfer {
        location: format!("s3://{}/{}", bucket, key),
        detail: DisplayErrorContext(e).to_string(),
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn get_to_path(&self, bucket: &str, key: &str, path: &Path) -> Result<()> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| transfer_error(bucket, key, e))?;

        if let Some(size) = response.content_length() {
            debug!("s3://{}/{} is {} bytes", bucket, key, size);
        }

        let mut body = response.body.into_async_read();
        let mut file = tokio::fs::File::create(path).await?;
        tokio::io::copy(&mut body, &mut file).await?;
        file.flush().await?;
        Ok(())
    }

    async fn put_from_path(&self, bucket: &str, key: &str, path: &Path) -> Result<()> {
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| transfer_error(bucket, key, e))?;

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| transfer_error(bucket, key, e))?;
        Ok(())
    }

    async fn head(&self, bucket: &str, key: &str) -> Result<bool> {
        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error().is_some_and(|se| se.is_not_found()) {
                    Ok(false)
                } else {
                    Err(transfer_error(bucket, key, e))
                }
            }
        }
    }

    async fn list_keys(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| transfer_error(bucket, prefix, e))?;
            keys.extend(
                page.contents()
                    .iter()
                    .filter_map(|obj| obj.key().map(str::to_string)),
            );
        }

        Ok(keys)
    }
}
