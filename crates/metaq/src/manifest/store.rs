use bytes::Bytes;
use futures::StreamExt;
use object_store::aws::{AmazonS3Builder, S3ConditionalPut};
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::prefix::PrefixStore;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload, UpdateVersion, WriteMultipart};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::common::config::BucketConfig;
use crate::common::error::config_error;
use crate::manifest::Manifest;
use crate::manifest::layout::{
    AGENT_LOG_PREFIX, cancel_path, job_object, manifest_path,
};

/// Files larger than this are uploaded in several parts.
const MULTIPART_THRESHOLD: u64 = 16 * 1024 * 1024;
const MULTIPART_CHUNK_SIZE: usize = 8 * 1024 * 1024;
const MULTIPART_MAX_CONCURRENCY: usize = 4;

/// Manifest together with the version of the object it was read from.
#[derive(Debug)]
pub struct VersionedManifest {
    pub manifest: Manifest,
    pub version: Option<UpdateVersion>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The claim was written.
    Claimed,
    /// The manifest was modified by somebody else since it was read.
    Lost,
}

/// Access to job folders in the shared bucket.
///
/// There is no locking, all updates are whole-object overwrites. Callers have to read a
/// manifest within the same task before they write it back.
#[derive(Clone)]
pub struct JobStore {
    store: Arc<dyn ObjectStore>,
    conditional_claims: bool,
}

pub fn open_object_store(config: &BucketConfig) -> crate::Result<Arc<dyn ObjectStore>> {
    let url = config.url.trim();
    if let Some(location) = url.strip_prefix("s3://") {
        let (bucket, prefix) = match location.split_once('/') {
            Some((bucket, prefix)) => (bucket, prefix.trim_matches('/')),
            None => (location, ""),
        };
        if bucket.is_empty() {
            return config_error(format!("Missing bucket name in `{url}`"));
        }
        let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
        if let Some(endpoint) = &config.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }
        if let Some(region) = &config.region {
            builder = builder.with_region(region);
        }
        if config.conditional_claims {
            builder = builder.with_conditional_put(S3ConditionalPut::ETagMatch);
        }
        let store = builder.build()?;
        if prefix.is_empty() {
            Ok(Arc::new(store))
        } else {
            Ok(Arc::new(PrefixStore::new(store, prefix)))
        }
    } else if let Some(path) = url.strip_prefix("file://") {
        let store = LocalFileSystem::new_with_prefix(path).map_err(|e| {
            crate::Error::ConfigError(format!("Cannot open bucket directory {path}: {e}"))
        })?;
        Ok(Arc::new(store))
    } else if url == "memory://" {
        Ok(Arc::new(InMemory::new()))
    } else {
        config_error(format!(
            "Unsupported bucket url `{url}`, expected s3://, file:// or memory://"
        ))
    }
}

fn is_not_found(error: &object_store::Error) -> bool {
    matches!(error, object_store::Error::NotFound { .. })
}

impl JobStore {
    pub fn new(store: Arc<dyn ObjectStore>, conditional_claims: bool) -> Self {
        Self {
            store,
            conditional_claims,
        }
    }

    pub fn from_config(config: &BucketConfig) -> crate::Result<Self> {
        Ok(Self::new(
            open_object_store(config)?,
            config.conditional_claims,
        ))
    }

    /// Returns the UUIDs of all job folders in the bucket.
    pub async fn list_job_ids(&self) -> crate::Result<Vec<String>> {
        let listing = self.store.list_with_delimiter(None).await?;
        Ok(listing
            .common_prefixes
            .iter()
            .filter_map(|prefix| prefix.filename())
            .filter(|name| *name != AGENT_LOG_PREFIX)
            .map(|name| name.to_string())
            .collect())
    }

    /// Reads the manifest of a job. Returns `None` if the job has no manifest.
    pub async fn read_manifest(&self, uuid: &str) -> crate::Result<Option<VersionedManifest>> {
        let result = match self.store.get(&manifest_path(uuid)).await {
            Ok(result) => result,
            Err(error) if is_not_found(&error) => return Ok(None),
            Err(error) => return Err(error.into()),
        };
        let version = result.meta.e_tag.as_ref().map(|e_tag| UpdateVersion {
            e_tag: Some(e_tag.clone()),
            version: result.meta.version.clone(),
        });
        let data = result.bytes().await?;
        let manifest = Manifest::from_json(&data)?;
        Ok(Some(VersionedManifest { manifest, version }))
    }

    pub async fn write_manifest(&self, manifest: &Manifest) -> crate::Result<()> {
        let data = manifest.to_json()?;
        self.store
            .put(&manifest_path(&manifest.uuid), PutPayload::from(data))
            .await?;
        Ok(())
    }

    /// Writes a manifest only if it was not changed since `version` was read.
    ///
    /// Falls back to an unconditional write when conditional claims are disabled or the
    /// store does not support them.
    pub async fn claim_manifest(
        &self,
        manifest: &Manifest,
        version: Option<&UpdateVersion>,
    ) -> crate::Result<ClaimOutcome> {
        let version = match version {
            Some(version) if self.conditional_claims => version.clone(),
            _ => {
                self.write_manifest(manifest).await?;
                return Ok(ClaimOutcome::Claimed);
            }
        };
        let data = manifest.to_json()?;
        let options = PutOptions::from(PutMode::Update(version));
        match self
            .store
            .put_opts(
                &manifest_path(&manifest.uuid),
                PutPayload::from(data),
                options,
            )
            .await
        {
            Ok(_) => Ok(ClaimOutcome::Claimed),
            Err(object_store::Error::Precondition { .. }) => Ok(ClaimOutcome::Lost),
            Err(object_store::Error::NotImplemented)
            | Err(object_store::Error::NotSupported { .. }) => {
                log::debug!(
                    "[{}] Conditional writes are not supported by the bucket, claiming unconditionally",
                    manifest.uuid
                );
                self.write_manifest(manifest).await?;
                Ok(ClaimOutcome::Claimed)
            }
            Err(error) => Err(error.into()),
        }
    }

    pub async fn exists(&self, location: &ObjectPath) -> crate::Result<bool> {
        match self.store.head(location).await {
            Ok(_) => Ok(true),
            Err(error) if is_not_found(&error) => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    pub async fn read_bytes(&self, location: &ObjectPath) -> crate::Result<Option<Bytes>> {
        match self.store.get(location).await {
            Ok(result) => Ok(Some(result.bytes().await?)),
            Err(error) if is_not_found(&error) => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    pub async fn put_bytes(&self, location: &ObjectPath, data: impl Into<Bytes>) -> crate::Result<()> {
        self.store
            .put(location, PutPayload::from(data.into()))
            .await?;
        Ok(())
    }

    /// Returns the content of the cancellation marker, or `None` if there is no marker.
    pub async fn read_cancel_marker(&self, uuid: &str) -> crate::Result<Option<String>> {
        Ok(self
            .read_bytes(&cancel_path(uuid))
            .await?
            .map(|data| String::from_utf8_lossy(&data).trim().to_string()))
    }

    pub async fn write_cancel_marker(&self, uuid: &str, content: &str) -> crate::Result<()> {
        self.put_bytes(&cancel_path(uuid), content.to_string()).await
    }

    /// Downloads `<uuid>/<name>` into `dest`. Returns `None` if the object does not exist,
    /// otherwise the number of downloaded bytes.
    pub async fn download_job_file(
        &self,
        uuid: &str,
        name: &str,
        dest: &Path,
    ) -> crate::Result<Option<u64>> {
        let result = match self.store.get(&job_object(uuid, name)).await {
            Ok(result) => result,
            Err(error) if is_not_found(&error) => return Ok(None),
            Err(error) => return Err(error.into()),
        };
        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = result.into_stream();
        let mut size = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            size += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(Some(size))
    }

    /// Uploads a local file, returns its size.
    pub async fn upload_file(&self, location: &ObjectPath, path: &Path) -> crate::Result<u64> {
        let size = tokio::fs::metadata(path).await?.len();
        if size <= MULTIPART_THRESHOLD {
            let data = tokio::fs::read(path).await?;
            self.store.put(location, PutPayload::from(data)).await?;
            return Ok(size);
        }

        let mut file = tokio::fs::File::open(path).await?;
        let upload = self.store.put_multipart(location).await?;
        let mut writer = WriteMultipart::new(upload);
        let result: crate::Result<()> = async {
            let mut buffer = vec![0; MULTIPART_CHUNK_SIZE];
            loop {
                let read = file.read(&mut buffer).await?;
                if read == 0 {
                    break;
                }
                writer.wait_for_capacity(MULTIPART_MAX_CONCURRENCY).await?;
                writer.write(&buffer[..read]);
            }
            Ok(())
        }
        .await;
        match result {
            Ok(()) => {
                writer.finish().await?;
                Ok(size)
            }
            Err(error) => {
                if let Err(abort_error) = writer.abort().await {
                    log::warn!("Cannot abort upload of {location}: {abort_error}");
                }
                Err(error)
            }
        }
    }
}
