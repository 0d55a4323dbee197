// S3 implementation of the archive object store
// Works against AWS S3 or an S3-compatible endpoint (LocalStack/MinIO)

use super::{ArchiveObject, ObjectRef, ObjectStore, UploadRequest};
use crate::error::{BackupError, Result, UploadError};
use async_trait::async_trait;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ObjectCannedAcl;
use aws_sdk_s3::Client;
use aws_types::SdkConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Error codes S3 returns for conditions that clear up on their own
const TRANSIENT_CODES: &[&str] = &["SlowDown", "RequestTimeout", "InternalError", "ServiceUnavailable"];

/// S3 client options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Options {
    pub endpoint_url: Option<String>,
    pub force_path_style: bool,
}

impl Default for S3Options {
    fn default() -> Self {
        Self {
            endpoint_url: None,
            force_path_style: true,
        }
    }
}

pub struct S3ObjectStore {
    client: Client,
}

impl S3ObjectStore {
    pub fn new(sdk_config: &SdkConfig, options: &S3Options) -> Self {
        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(sdk_config);

        if let Some(ref endpoint) = options.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }
        if options.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        Self {
            client: Client::from_conf(s3_config_builder.build()),
        }
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

fn to_chrono(dt: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ArchiveObject>> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        let mut objects = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| {
                BackupError::Storage(format!("Failed to list {}/{}: {}", bucket, prefix, DisplayErrorContext(&e)))
            })?;

            for object in page.contents() {
                match (object.key(), object.last_modified().and_then(to_chrono)) {
                    (Some(key), Some(last_modified)) => objects.push(ArchiveObject {
                        key: key.to_string(),
                        last_modified,
                    }),
                    _ => debug!(object = ?object.key(), "Skipping listed object without key or timestamp"),
                }
            }
        }

        Ok(objects)
    }

    async fn put_object(&self, request: &UploadRequest) -> std::result::Result<ObjectRef, UploadError> {
        let body = ByteStream::from_path(&request.local_path)
            .await
            .map_err(|e| UploadError::Io(format!("{}: {}", request.local_path.display(), e)))?;

        let mut put = self
            .client
            .put_object()
            .bucket(&request.bucket)
            .key(&request.key)
            .content_type(&request.content_type)
            .body(body);

        if request.acl_private {
            put = put.acl(ObjectCannedAcl::Private);
        }
        for (name, value) in &request.metadata {
            put = put.metadata(name, value);
        }

        let response = put.send().await.map_err(|e| {
            let message = DisplayErrorContext(&e).to_string();
            match &e {
                SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
                    UploadError::Transport(message)
                }
                SdkError::ServiceError(service) => {
                    let code = service.err().code().unwrap_or_default();
                    if service.raw().status().is_server_error() || TRANSIENT_CODES.contains(&code) {
                        UploadError::Transport(message)
                    } else {
                        UploadError::Rejected(message)
                    }
                }
                _ => UploadError::Rejected(message),
            }
        })?;

        Ok(ObjectRef {
            bucket: request.bucket.clone(),
            key: request.key.clone(),
            etag: response.e_tag().map(str::to_string),
        })
    }

    async fn delete_object(&self, object: &ObjectRef) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&object.bucket)
            .key(&object.key)
            .send()
            .await
            .map_err(|e| {
                BackupError::Storage(format!(
                    "Failed to delete {}/{}: {}",
                    object.bucket,
                    object.key,
                    DisplayErrorContext(&e)
                ))
            })?;

        Ok(())
    }
}
