//! Blob (object) storage client.
//!
//! S3-flavored buckets and keys behind the platform gateway. Listings are
//! paginated and streamed; uploads carry a `Content-MD5` so the gateway can
//! reject corrupted bodies, and whole-file attempts are retried under a
//! [`RetryPolicy`] because the gateway sheds load with 502/503.

pub mod retry;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::DateTime;
use futures::future::BoxFuture;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Method, Url};
use serde::Deserialize;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::warn;

use crate::config::ClientConfig;
use crate::core::{Core, Error, OsCode, OsError, RequestOpts, Result};
use crate::progress::{ProgressSink, TransferEvent};
use crate::storage::glob::translate;
use crate::transfer::{display_path, file_body, file_md5, run_concurrently};

pub use retry::RetryPolicy;

/// Cap on concurrently open local files during blob transfers.
pub const MAX_OPEN_FILES: usize = 20;

const DEFAULT_MAX_KEYS: usize = 10_000;

/// Paths within a bucket may accept a user-supplied predicate to prune the
/// tree walk.
pub type KeyFilter = dyn Fn(&str) -> bool + Send + Sync;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketEntry {
    pub name: String,
    /// Unix seconds.
    pub creation_time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ObjectEntry {
    pub key: String,
    pub size: u64,
    /// Unix seconds.
    #[serde(rename = "last_modified")]
    pub modification_time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PrefixEntry {
    pub prefix: String,
}

/// One row of a non-recursive listing: an object or a "directory" prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListEntry {
    Object(ObjectEntry),
    Prefix(PrefixEntry),
}

/// Metadata from a HEAD request.
#[derive(Debug, Clone)]
pub struct ObjectStatus {
    pub size: u64,
    /// Unix seconds.
    pub modification_time: i64,
    pub etag: Option<String>,
}

#[derive(Deserialize)]
struct BucketWire {
    name: String,
    creation_date: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct ListPage {
    contents: Vec<ObjectEntry>,
    common_prefixes: Vec<PrefixEntry>,
    is_truncated: bool,
}

pub struct Blob {
    core: Arc<Core>,
    config: Arc<ClientConfig>,
    file_sem: Arc<Semaphore>,
    max_keys: usize,
    retry: RetryPolicy,
}

impl Blob {
    pub fn new(core: Arc<Core>, config: Arc<ClientConfig>) -> Self {
        Self {
            core,
            config,
            file_sem: Arc::new(Semaphore::new(MAX_OPEN_FILES)),
            max_keys: DEFAULT_MAX_KEYS,
            retry: RetryPolicy::default(),
        }
    }

    fn buckets_url(&self) -> Url {
        let mut url = self.config.blob_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("b");
        }
        url
    }

    fn object_url(&self, bucket: &str, key: &str) -> Url {
        let mut url = self.config.blob_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("o").push(bucket);
            segments.extend(key.split('/').filter(|s| !s.is_empty()));
        }
        url
    }

    pub async fn list_buckets(&self) -> Result<Vec<BucketEntry>> {
        let response = self
            .core
            .request(
                Method::GET,
                self.buckets_url(),
                &self.config.auth(),
                RequestOpts::default(),
            )
            .await?;
        let wire: Vec<BucketWire> = response.json().await?;
        let mut buckets = Vec::with_capacity(wire.len());
        for bucket in wire {
            let creation_time = DateTime::parse_from_rfc3339(&bucket.creation_date)
                .map_err(|err| {
                    Error::IllegalArgument(format!(
                        "bad bucket creation date {:?}: {err}",
                        bucket.creation_date
                    ))
                })?
                .timestamp();
            buckets.push(BucketEntry {
                name: bucket.name,
                creation_time,
            });
        }
        Ok(buckets)
    }

    async fn list_page(
        &self,
        bucket: &str,
        prefix: Option<&str>,
        recursive: bool,
        start_after: Option<&str>,
    ) -> Result<ListPage> {
        let mut params = vec![
            ("recursive".to_string(), recursive.to_string()),
            ("max_keys".to_string(), self.max_keys.to_string()),
        ];
        if let Some(prefix) = prefix {
            params.push(("prefix".to_string(), prefix.to_string()));
        }
        if let Some(start_after) = start_after {
            params.push(("start_after".to_string(), start_after.to_string()));
        }
        let opts = RequestOpts {
            params,
            ..Default::default()
        };
        let response = self
            .core
            .request(
                Method::GET,
                self.object_url(bucket, ""),
                &self.config.auth(),
                opts,
            )
            .await?;
        Ok(response.json().await?)
    }

    /// Stream a bucket listing, issuing follow-up page requests lazily as
    /// the consumer drains the channel. Dropping the receiver stops the
    /// pagination.
    pub fn list_objects(
        self: &Arc<Self>,
        bucket: &str,
        prefix: Option<String>,
        recursive: bool,
    ) -> mpsc::Receiver<Result<ListEntry>> {
        let (tx, rx) = mpsc::channel(64);
        let this = self.clone();
        let bucket = bucket.to_string();
        tokio::spawn(async move {
            let mut start_after: Option<String> = None;
            loop {
                let page = match this
                    .list_page(&bucket, prefix.as_deref(), recursive, start_after.as_deref())
                    .await
                {
                    Ok(page) => page,
                    Err(err) => {
                        let _ = tx.send(Err(err)).await;
                        return;
                    }
                };
                let truncated = page.is_truncated;
                let next_after = page.contents.last().map(|entry| entry.key.clone());
                for prefix_entry in page.common_prefixes {
                    if tx.send(Ok(ListEntry::Prefix(prefix_entry))).await.is_err() {
                        return;
                    }
                }
                for object in page.contents {
                    if tx.send(Ok(ListEntry::Object(object))).await.is_err() {
                        return;
                    }
                }
                if !truncated {
                    return;
                }
                // A truncated page without contents cannot advance the cursor.
                let Some(next_after) = next_after else {
                    warn!("truncated listing page for {bucket} has no contents, stopping");
                    return;
                };
                start_after = Some(next_after);
            }
        });
        rx
    }

    /// Glob over object keys. The literal key prefix before the first magic
    /// component narrows the server-side scan; full keys are then matched
    /// against the whole pattern.
    pub fn glob_objects(
        self: &Arc<Self>,
        bucket: &str,
        pattern: &str,
    ) -> mpsc::Receiver<Result<ObjectEntry>> {
        let (tx, rx) = mpsc::channel(64);
        let this = self.clone();
        let bucket = bucket.to_string();
        let pattern = pattern.to_string();
        tokio::spawn(async move {
            if let Err(err) = this.glob_objects_into(&bucket, &pattern, &tx).await {
                let _ = tx.send(Err(err)).await;
            }
        });
        rx
    }

    async fn glob_objects_into(
        &self,
        bucket: &str,
        pattern: &str,
        tx: &mpsc::Sender<Result<ObjectEntry>>,
    ) -> Result<()> {
        let scan_prefix = literal_prefix(pattern);
        let matcher = regex::Regex::new(&translate(pattern))
            .map_err(|err| Error::IllegalArgument(format!("bad glob pattern: {err}")))?;
        let scan_prefix = if scan_prefix.is_empty() {
            None
        } else {
            Some(scan_prefix)
        };
        let mut start_after: Option<String> = None;
        loop {
            let page = self
                .list_page(bucket, scan_prefix.as_deref(), true, start_after.as_deref())
                .await?;
            let truncated = page.is_truncated;
            let next_after = page.contents.last().map(|entry| entry.key.clone());
            for object in page.contents {
                if matcher.is_match(&object.key) && tx.send(Ok(object)).await.is_err() {
                    return Ok(());
                }
            }
            if !truncated || tx.is_closed() {
                return Ok(());
            }
            let Some(next_after) = next_after else {
                warn!("truncated listing page for {bucket} has no contents, stopping");
                return Ok(());
            };
            start_after = Some(next_after);
        }
    }

    pub async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectStatus> {
        let response = self
            .core
            .request(
                Method::HEAD,
                self.object_url(bucket, key),
                &self.config.auth(),
                RequestOpts::default(),
            )
            .await?;
        let headers = response.headers();
        let size = headers
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let modification_time = headers
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
            .map(|t| t.timestamp())
            .unwrap_or(0);
        let etag = headers
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        Ok(ObjectStatus {
            size,
            modification_time,
            etag,
        })
    }

    pub async fn get_object(&self, bucket: &str, key: &str) -> Result<reqwest::Response> {
        self.core
            .request(
                Method::GET,
                self.object_url(bucket, key),
                &self.config.auth(),
                RequestOpts::default(),
            )
            .await
    }

    /// Store an object from a streaming body; returns the new ETag when the
    /// gateway reports one.
    pub async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: reqwest::Body,
        size: u64,
        content_md5: Option<&str>,
    ) -> Result<Option<String>> {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&size.to_string()) {
            headers.insert("X-Content-Length", value);
        }
        if let Some(md5) = content_md5 {
            let value = HeaderValue::from_str(md5)
                .map_err(|_| Error::IllegalArgument("invalid Content-MD5 value".into()))?;
            headers.insert("Content-MD5", value);
        }
        let opts = RequestOpts {
            body: Some(body),
            headers: Some(headers),
            ..Default::default()
        };
        let response = self
            .core
            .request(Method::PUT, self.object_url(bucket, key), &self.config.auth(), opts)
            .await?;
        Ok(response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned))
    }

    pub async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.core
            .request(
                Method::DELETE,
                self.object_url(bucket, key),
                &self.config.auth(),
                RequestOpts::default(),
            )
            .await?;
        Ok(())
    }

    /// Upload a single local file as an object.
    pub async fn upload_file(
        &self,
        src: &Path,
        bucket: &str,
        key: &str,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<()> {
        let meta = match tokio::fs::metadata(src).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(OsError::new(
                    OsCode::Enoent,
                    "No such file or directory",
                    display_path(src),
                )
                .into());
            }
            Err(err) => return Err(err.into()),
        };
        if meta.is_dir() {
            return Err(OsError::new(
                OsCode::Eisdir,
                "Is a directory, use recursive copy",
                display_path(src),
            )
            .into());
        }
        self.upload_object_inner(src.to_owned(), bucket.to_string(), key.to_string(), progress)
            .await
    }

    /// Retrying body of an object upload: a fresh MD5-tagged attempt per
    /// retry, since the body stream cannot be rewound.
    ///
    /// The whole upload sits inside a single `Start`/`Complete` (or `Fail`)
    /// envelope; `Step` offsets restart from zero when an attempt is retried.
    async fn upload_object_inner(
        &self,
        src: PathBuf,
        bucket: String,
        key: String,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<()> {
        let md5 = file_md5(&src).await?;
        let size = tokio::fs::metadata(&src).await?.len();
        let src_label = display_path(&src);
        let dst_label = object_label(&bucket, &key);
        progress.send(TransferEvent::Start {
            src: src_label.clone(),
            dst: dst_label.clone(),
            size,
        });
        let steps: Arc<dyn ProgressSink> = Arc::new(StepSink(progress.clone()));
        let mut attempt = 0;
        loop {
            let (size, body) = file_body(
                self.file_sem.clone(),
                src.clone(),
                dst_label.clone(),
                steps.clone(),
            )
            .await?;
            match self
                .put_object(&bucket, &key, body, size, Some(&md5))
                .await
            {
                Ok(_etag) => {
                    progress.send(TransferEvent::Complete {
                        src: src_label,
                        dst: dst_label,
                        size,
                    });
                    return Ok(());
                }
                Err(err) if self.retry.should_retry(&err, attempt) => {
                    warn!("upload of {dst_label} failed, retrying: {err}");
                    tokio::time::sleep(self.retry.backoff(attempt)).await;
                    attempt += 1;
                }
                Err(err) => {
                    progress.send(TransferEvent::Fail {
                        src: src_label,
                        dst: dst_label,
                        message: err.to_string(),
                    });
                    return Err(err);
                }
            }
        }
    }

    /// Download a single object to a local file.
    pub async fn download_file(
        &self,
        bucket: &str,
        key: &str,
        dst: &Path,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<()> {
        let stat = self.head_object(bucket, key).await?;
        self.download_object_inner(
            bucket.to_string(),
            key.to_string(),
            dst.to_owned(),
            stat.size,
            progress,
        )
        .await
    }

    async fn download_object_inner(
        &self,
        bucket: String,
        key: String,
        dst: PathBuf,
        size: u64,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<()> {
        let _permit = self
            .file_sem
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::IllegalArgument("transfer semaphore closed".into()))?;
        let src_label = object_label(&bucket, &key);
        let dst_label = display_path(&dst);
        let mut file = tokio::fs::File::create(&dst).await?;
        progress.send(TransferEvent::Start {
            src: src_label.clone(),
            dst: dst_label.clone(),
            size,
        });
        let mut attempt = 0;
        loop {
            match self
                .fetch_into(&bucket, &key, &mut file, size, &src_label, &dst_label, &progress)
                .await
            {
                Ok(()) => {
                    progress.send(TransferEvent::Complete {
                        src: src_label,
                        dst: dst_label,
                        size,
                    });
                    return Ok(());
                }
                Err(err) if self.retry.should_retry(&err, attempt) => {
                    warn!("download of {src_label} failed, retrying: {err}");
                    tokio::time::sleep(self.retry.backoff(attempt)).await;
                    attempt += 1;
                    // Restart the object from scratch.
                    file.seek(std::io::SeekFrom::Start(0)).await?;
                    file.set_len(0).await?;
                }
                Err(err) => {
                    progress.send(TransferEvent::Fail {
                        src: src_label,
                        dst: dst_label,
                        message: err.to_string(),
                    });
                    return Err(err);
                }
            }
        }
    }

    async fn fetch_into(
        &self,
        bucket: &str,
        key: &str,
        file: &mut tokio::fs::File,
        size: u64,
        src_label: &str,
        dst_label: &str,
        progress: &Arc<dyn ProgressSink>,
    ) -> Result<()> {
        let mut response = self.get_object(bucket, key).await?;
        let mut pos = 0u64;
        while let Some(chunk) = response.chunk().await? {
            pos += chunk.len() as u64;
            file.write_all(&chunk).await?;
            progress.send(TransferEvent::Step {
                src: src_label.to_string(),
                dst: dst_label.to_string(),
                current: pos,
                size,
            });
        }
        file.flush().await?;
        Ok(())
    }

    /// Recursively upload a local directory under a key prefix. `filter`
    /// receives the relative key of each candidate and prunes the walk.
    pub async fn upload_dir(
        self: &Arc<Self>,
        src: &Path,
        bucket: &str,
        prefix: &str,
        filter: Option<Arc<KeyFilter>>,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<()> {
        let meta = match tokio::fs::metadata(src).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(OsError::new(
                    OsCode::Enoent,
                    "No such file or directory",
                    display_path(src),
                )
                .into());
            }
            Err(err) => return Err(err.into()),
        };
        if !meta.is_dir() {
            return Err(
                OsError::new(OsCode::Enotdir, "Not a directory", display_path(src)).into(),
            );
        }
        self.clone()
            .upload_dir_inner(
                src.to_owned(),
                bucket.to_string(),
                trim_prefix(prefix),
                filter,
                progress,
            )
            .await
    }

    fn upload_dir_inner(
        self: Arc<Self>,
        src: PathBuf,
        bucket: String,
        prefix: String,
        filter: Option<Arc<KeyFilter>>,
        progress: Arc<dyn ProgressSink>,
    ) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            let src_label = display_path(&src);
            let dst_label = object_label(&bucket, &prefix);
            progress.send(TransferEvent::EnterDir {
                src: src_label.clone(),
                dst: dst_label.clone(),
            });
            let mut tasks: JoinSet<Result<()>> = JoinSet::new();
            let mut reader = tokio::fs::read_dir(&src).await?;
            while let Some(entry) = reader.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                let child_key = join_key(&prefix, &name);
                if let Some(filter) = &filter {
                    if !filter(&child_key) {
                        continue;
                    }
                }
                let file_type = entry.file_type().await?;
                let child_src = src.join(&name);
                if file_type.is_file() {
                    let this = self.clone();
                    let bucket = bucket.clone();
                    let child_progress = progress.clone();
                    tasks.spawn(async move {
                        this.upload_object_inner(child_src, bucket, child_key, child_progress)
                            .await
                    });
                } else if file_type.is_dir() {
                    tasks.spawn(self.clone().upload_dir_inner(
                        child_src,
                        bucket.clone(),
                        child_key,
                        filter.clone(),
                        progress.clone(),
                    ));
                } else {
                    progress.send(TransferEvent::Fail {
                        src: display_path(&child_src),
                        dst: object_label(&bucket, &child_key),
                        message: format!(
                            "Cannot upload {}, not a regular file or directory",
                            child_src.display()
                        ),
                    });
                }
            }
            run_concurrently(tasks).await?;
            progress.send(TransferEvent::LeaveDir {
                src: src_label,
                dst: dst_label,
            });
            Ok(())
        })
    }

    /// Recursively download all objects under a key prefix into a local
    /// directory tree.
    pub async fn download_dir(
        self: &Arc<Self>,
        bucket: &str,
        prefix: &str,
        dst: &Path,
        filter: Option<Arc<KeyFilter>>,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<()> {
        self.clone()
            .download_dir_inner(
                bucket.to_string(),
                trim_prefix(prefix),
                dst.to_owned(),
                filter,
                progress,
            )
            .await
    }

    fn download_dir_inner(
        self: Arc<Self>,
        bucket: String,
        prefix: String,
        dst: PathBuf,
        filter: Option<Arc<KeyFilter>>,
        progress: Arc<dyn ProgressSink>,
    ) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            tokio::fs::create_dir_all(&dst).await?;
            let src_label = object_label(&bucket, &prefix);
            let dst_label = display_path(&dst);
            progress.send(TransferEvent::EnterDir {
                src: src_label.clone(),
                dst: dst_label.clone(),
            });
            let scan_prefix = if prefix.is_empty() {
                None
            } else {
                Some(format!("{prefix}/"))
            };
            let mut entries = Vec::new();
            let mut start_after: Option<String> = None;
            loop {
                let page = self
                    .list_page(&bucket, scan_prefix.as_deref(), false, start_after.as_deref())
                    .await?;
                let truncated = page.is_truncated;
                let next_after = page.contents.last().map(|entry| entry.key.clone());
                entries.extend(page.common_prefixes.into_iter().map(ListEntry::Prefix));
                entries.extend(page.contents.into_iter().map(ListEntry::Object));
                if !truncated {
                    break;
                }
                let Some(next_after) = next_after else {
                    warn!("truncated listing page for {bucket} has no contents, stopping");
                    break;
                };
                start_after = Some(next_after);
            }
            let mut tasks: JoinSet<Result<()>> = JoinSet::new();
            for entry in entries {
                match entry {
                    ListEntry::Object(object) => {
                        if let Some(filter) = &filter {
                            if !filter(&object.key) {
                                continue;
                            }
                        }
                        let name = key_name(&object.key).to_string();
                        let this = self.clone();
                        let bucket = bucket.clone();
                        let child_dst = dst.join(&name);
                        let child_progress = progress.clone();
                        tasks.spawn(async move {
                            this.download_object_inner(
                                bucket,
                                object.key,
                                child_dst,
                                object.size,
                                child_progress,
                            )
                            .await
                        });
                    }
                    ListEntry::Prefix(subdir) => {
                        let child_prefix = trim_prefix(&subdir.prefix);
                        if let Some(filter) = &filter {
                            if !filter(&child_prefix) {
                                continue;
                            }
                        }
                        let name = key_name(&child_prefix).to_string();
                        tasks.spawn(self.clone().download_dir_inner(
                            bucket.clone(),
                            child_prefix,
                            dst.join(&name),
                            filter.clone(),
                            progress.clone(),
                        ));
                    }
                }
            }
            run_concurrently(tasks).await?;
            progress.send(TransferEvent::LeaveDir {
                src: src_label,
                dst: dst_label,
            });
            Ok(())
        })
    }
}

/// Forwards only `Step` events; the retry loop owns the envelope.
struct StepSink(Arc<dyn ProgressSink>);

impl ProgressSink for StepSink {
    fn send(&self, event: TransferEvent) {
        if matches!(event, TransferEvent::Step { .. }) {
            self.0.send(event);
        }
    }
}

fn object_label(bucket: &str, key: &str) -> String {
    if key.is_empty() {
        format!("object://{bucket}")
    } else {
        format!("object://{bucket}/{key}")
    }
}

fn trim_prefix(prefix: &str) -> String {
    prefix.trim_matches('/').to_string()
}

fn join_key(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

/// Last component of an object key.
fn key_name(key: &str) -> &str {
    key.trim_end_matches('/').rsplit('/').next().unwrap_or(key)
}

/// The literal key prefix before the first magic character, used to narrow
/// server-side scans.
fn literal_prefix(pattern: &str) -> String {
    let end = pattern
        .find(['*', '?', '['])
        .unwrap_or(pattern.len());
    pattern[..end].to_string()
}
