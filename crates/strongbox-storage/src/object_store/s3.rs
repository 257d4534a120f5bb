//! AWS SDK client for S3 and S3-compatible services (MinIO, Wasabi, DigitalOcean Spaces)

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier};
use aws_sdk_s3::Client;
use tracing::debug;

use strongbox_core::types::S3StorageConfig;
use strongbox_core::{Error, Result};

use super::{ObjectInfo, ObjectStoreClient, UploadedPart};

/// DeleteObjects accepts at most this many keys per request
const DELETE_BATCH: usize = 1000;

pub struct S3ObjectStore {
    name: String,
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    /// Create a client for the configured bucket
    pub async fn connect(name: &str, config: &S3StorageConfig) -> Result<Self> {
        let client = Self::create_client(config).await;
        Ok(Self {
            name: name.to_string(),
            client,
            bucket: config.bucket.clone(),
        })
    }

    async fn create_client(config: &S3StorageConfig) -> Client {
        let region = Region::new(config.region.clone());

        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(region)
            .load()
            .await;

        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&sdk_config);

        if let (Some(key_id), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
            s3_config_builder = s3_config_builder.credentials_provider(Credentials::new(
                key_id.clone(),
                secret.clone(),
                None,
                None,
                "strongbox-config",
            ));
        }

        if let Some(endpoint_url) = &config.endpoint {
            debug!("Using custom S3 endpoint: {}", endpoint_url);
            s3_config_builder = s3_config_builder
                .endpoint_url(endpoint_url)
                .force_path_style(true);
        }

        Client::from_conf(s3_config_builder.build())
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn transfer_error<E>(&self, action: &str, err: SdkError<E, HttpResponse>) -> Error
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let message = format!(
            "{} s3://{}: {}",
            action,
            self.bucket,
            DisplayErrorContext(&err)
        );
        if is_transient(&err) {
            Error::transient(&self.name, message)
        } else {
            Error::permanent(&self.name, message)
        }
    }
}

/// Timeouts, dispatch failures, throttling and 5xx are worth retrying
fn is_transient<E>(err: &SdkError<E, HttpResponse>) -> bool {
    match err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            true
        }
        SdkError::ServiceError(_) => err
            .raw_response()
            .map(|r| {
                let status = r.status().as_u16();
                status == 429 || status >= 500
            })
            .unwrap_or(false),
        _ => false,
    }
}

#[async_trait]
impl ObjectStoreClient for S3ObjectStore {
    async fn create_multipart(&self, key: &str) -> Result<String> {
        let resp = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/octet-stream")
            .send()
            .await
            .map_err(|e| self.transfer_error("create multipart upload in", e))?;

        resp.upload_id()
            .map(str::to_string)
            .ok_or_else(|| Error::permanent(&self.name, "response carried no upload id"))
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Vec<u8>,
    ) -> Result<UploadedPart> {
        let resp = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| self.transfer_error("upload part to", e))?;

        let etag = resp
            .e_tag()
            .ok_or_else(|| Error::transient(&self.name, "part response carried no ETag"))?;
        Ok(UploadedPart {
            part_number,
            etag: etag.to_string(),
        })
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<UploadedPart>,
    ) -> Result<()> {
        let completed: Vec<CompletedPart> = parts
            .into_iter()
            .map(|p| {
                CompletedPart::builder()
                    .part_number(p.part_number)
                    .e_tag(p.etag)
                    .build()
            })
            .collect();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| self.transfer_error("complete multipart upload in", e))?;
        Ok(())
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| self.transfer_error("abort multipart upload in", e))?;
        Ok(())
    }

    async fn put_object(&self, key: &str, body: Vec<u8>) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| self.transfer_error("put object to", e))?;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Vec<u8>> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| self.transfer_error("get object from", e))?;

        let body = resp.body.collect().await.map_err(|e| {
            Error::transient(&self.name, format!("failed to read {}: {}", key, e))
        })?;
        Ok(body.into_bytes().to_vec())
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        debug!("Listing s3://{}/{}", self.bucket, prefix);

        let mut objects = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);

            if let Some(token) = continuation_token {
                request = request.continuation_token(token);
            }

            let resp = request
                .send()
                .await
                .map_err(|e| self.transfer_error("list objects in", e))?;

            if let Some(contents) = resp.contents {
                for object in contents {
                    if let Some(key) = object.key {
                        objects.push(ObjectInfo {
                            key,
                            size: object.size.unwrap_or(0).max(0) as u64,
                        });
                    }
                }
            }

            if resp.is_truncated == Some(true) {
                continuation_token = resp.next_continuation_token;
            } else {
                break;
            }
        }

        debug!("Found {} objects", objects.len());
        Ok(objects)
    }

    async fn delete_objects(&self, keys: Vec<String>) -> Result<()> {
        for batch in keys.chunks(DELETE_BATCH) {
            let identifiers = batch
                .iter()
                .map(|key| ObjectIdentifier::builder().key(key).build())
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| Error::permanent(&self.name, e.to_string()))?;
            let delete = Delete::builder()
                .set_objects(Some(identifiers))
                .quiet(true)
                .build()
                .map_err(|e| Error::permanent(&self.name, e.to_string()))?;

            let resp = self
                .client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|e| self.transfer_error("delete objects in", e))?;

            if let Some(failure) = resp.errors().first() {
                return Err(Error::transient(
                    &self.name,
                    format!(
                        "could not delete {}: {}",
                        failure.key().unwrap_or("?"),
                        failure.message().unwrap_or("unknown error")
                    ),
                ));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for S3ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3ObjectStore")
            .field("name", &self.name)
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}
