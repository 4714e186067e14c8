//! Remote storage service client.
//!
//! Speaks the platform's WebHDFS-flavored REST API (`?op=...` query verbs)
//! and implements the bulk transfer engine: bounded-concurrency uploads and
//! downloads of files and whole directory trees with progress reporting.

pub mod glob;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use reqwest::{Method, Url};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

use crate::config::ClientConfig;
use crate::core::{Core, Error, OsCode, OsError, RequestOpts, Result};
use crate::progress::{ProgressSink, TransferEvent};
use crate::transfer::{
    display_path, file_body, join_remote, mtime_secs, remote_parent, run_concurrently,
};

/// Upper bound on simultaneously open local files across all transfer tasks.
pub const MAX_OPEN_FILES: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FileKind {
    File,
    Directory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Read,
    Write,
    Manage,
}

/// Remote file metadata. In directory listings `path` is the bare entry
/// name; for a single stat it may carry the full path.
#[derive(Debug, Clone, Deserialize)]
pub struct FileStatus {
    pub path: String,
    #[serde(rename = "length")]
    pub size: u64,
    #[serde(rename = "type")]
    pub kind: FileKind,
    /// Unix seconds.
    #[serde(rename = "modificationTime")]
    pub modification_time: i64,
    pub permission: Action,
}

impl FileStatus {
    pub fn is_file(&self) -> bool {
        self.kind == FileKind::File
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    /// Last path component.
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

#[derive(Deserialize)]
struct FileStatusesPayload {
    #[serde(rename = "FileStatus")]
    file_status: Vec<FileStatus>,
}

#[derive(Deserialize)]
struct ListStatusResponse {
    #[serde(rename = "FileStatuses")]
    file_statuses: FileStatusesPayload,
}

#[derive(Deserialize)]
struct GetFileStatusResponse {
    #[serde(rename = "FileStatus")]
    file_status: FileStatus,
}

pub struct Storage {
    core: Arc<Core>,
    config: Arc<ClientConfig>,
    file_sem: Arc<Semaphore>,
}

impl Storage {
    pub fn new(core: Arc<Core>, config: Arc<ClientConfig>) -> Self {
        Self {
            core,
            config,
            file_sem: Arc::new(Semaphore::new(MAX_OPEN_FILES)),
        }
    }

    fn op_url(&self, path: &str, op: &str) -> Url {
        let mut url = self.config.storage_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty();
            segments.extend(path.split('/').filter(|s| !s.is_empty()));
        }
        url.query_pairs_mut().append_pair("op", op);
        url
    }

    pub async fn ls(&self, path: &str) -> Result<Vec<FileStatus>> {
        let url = self.op_url(path, "LISTSTATUS");
        let response = self
            .core
            .request(Method::GET, url, &self.config.auth(), RequestOpts::default())
            .await?;
        let body: ListStatusResponse = response.json().await?;
        Ok(body.file_statuses.file_status)
    }

    pub async fn stats(&self, path: &str) -> Result<FileStatus> {
        let url = self.op_url(path, "GETFILESTATUS");
        let response = self
            .core
            .request(Method::GET, url, &self.config.auth(), RequestOpts::default())
            .await?;
        let body: GetFileStatusResponse = response.json().await?;
        Ok(body.file_status)
    }

    /// Create a directory.
    ///
    /// Without `parents` the immediate parent must already exist; without
    /// `exist_ok` an existing target is an `EEXIST` error.
    pub async fn mkdir(&self, path: &str, parents: bool, exist_ok: bool) -> Result<()> {
        if !exist_ok {
            match self.stats(path).await {
                Ok(_) => {
                    return Err(OsError::new(OsCode::Eexist, "File exists", path).into());
                }
                Err(Error::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        if !parents {
            if let Some(parent) = remote_parent(path) {
                match self.stats(&parent).await {
                    Ok(stat) if stat.is_dir() => {}
                    Ok(_) => {
                        return Err(
                            OsError::new(OsCode::Enotdir, "Not a directory", &parent).into()
                        );
                    }
                    Err(Error::NotFound(_)) => {
                        return Err(OsError::new(
                            OsCode::Enoent,
                            "No such file or directory",
                            &parent,
                        )
                        .into());
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        let url = self.op_url(path, "MKDIRS");
        self.core
            .request(Method::PUT, url, &self.config.auth(), RequestOpts::default())
            .await?;
        Ok(())
    }

    /// Create (or overwrite) a remote file from a streaming body.
    pub async fn create(&self, path: &str, body: reqwest::Body) -> Result<()> {
        let url = self.op_url(path, "CREATE");
        let opts = RequestOpts {
            body: Some(body),
            ..Default::default()
        };
        self.core
            .request(Method::PUT, url, &self.config.auth(), opts)
            .await?;
        Ok(())
    }

    /// Open a remote file for reading; the caller drains the response in
    /// chunks.
    pub async fn open(&self, path: &str) -> Result<reqwest::Response> {
        let url = self.op_url(path, "OPEN");
        self.core
            .request(Method::GET, url, &self.config.auth(), RequestOpts::default())
            .await
    }

    /// Remove a file or, with `recursive`, a directory tree.
    pub async fn rm(&self, path: &str, recursive: bool) -> Result<()> {
        if !recursive {
            let stat = self.stats(path).await?;
            if stat.is_dir() {
                return Err(OsError::new(
                    OsCode::Eisdir,
                    "Is a directory, use recursive remove",
                    path,
                )
                .into());
            }
        }
        let url = self.op_url(path, "DELETE");
        self.core
            .request(Method::DELETE, url, &self.config.auth(), RequestOpts::default())
            .await?;
        Ok(())
    }

    pub async fn mv(&self, src: &str, dst: &str) -> Result<()> {
        let mut url = self.op_url(src, "RENAME");
        let destination = if dst.starts_with('/') {
            dst.to_string()
        } else {
            format!("/{dst}")
        };
        url.query_pairs_mut().append_pair("destination", &destination);
        self.core
            .request(Method::POST, url, &self.config.auth(), RequestOpts::default())
            .await?;
        Ok(())
    }

    /// Upload a single local file.
    ///
    /// A destination that already matches (same size and a modification time
    /// at least as new) is skipped without any request for the data and
    /// without progress events.
    pub async fn upload_file(
        &self,
        src: &Path,
        dst: &str,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<()> {
        let src_meta = match tokio::fs::metadata(src).await {
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
        if src_meta.is_dir() {
            return Err(OsError::new(
                OsCode::Eisdir,
                "Is a directory, use recursive copy",
                display_path(src),
            )
            .into());
        }
        match self.stats(dst).await {
            Ok(dst_stat) => {
                if dst_stat.is_dir() {
                    return Err(OsError::new(OsCode::Eisdir, "Is a directory", dst).into());
                }
                if src_meta.is_file()
                    && dst_stat.size == src_meta.len()
                    && dst_stat.modification_time >= mtime_secs(&src_meta)
                {
                    debug!("skipping up-to-date upload: {dst}");
                    return Ok(());
                }
            }
            Err(Error::NotFound(_)) => {
                // Target absent: the parent must exist and be a directory.
                if let Some(parent) = remote_parent(dst) {
                    match self.stats(&parent).await {
                        Ok(stat) if stat.is_dir() => {}
                        Ok(_) => {
                            return Err(
                                OsError::new(OsCode::Enotdir, "Not a directory", &parent).into()
                            );
                        }
                        Err(Error::NotFound(_)) => {
                            return Err(
                                OsError::new(OsCode::Enotdir, "Not a directory", &parent).into()
                            );
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
            Err(err) => return Err(err),
        }
        self.upload_file_inner(src.to_owned(), dst.to_string(), progress)
            .await
    }

    async fn upload_file_inner(
        &self,
        src: PathBuf,
        dst: String,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<()> {
        let (_size, body) = file_body(self.file_sem.clone(), src, dst.clone(), progress).await?;
        self.create(&dst, body).await
    }

    /// Recursively upload a directory tree. Child transfers of one directory
    /// run concurrently; the first failure aborts the remaining ones.
    pub async fn upload_dir(
        self: &Arc<Self>,
        src: &Path,
        dst: &str,
        update: bool,
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
            .upload_dir_inner(src.to_owned(), dst.to_string(), update, progress)
            .await
    }

    fn upload_dir_inner(
        self: Arc<Self>,
        src: PathBuf,
        dst: String,
        update: bool,
        progress: Arc<dyn ProgressSink>,
    ) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            match self.mkdir(&dst, true, true).await {
                Ok(()) => {}
                Err(Error::IllegalArgument(_)) => {
                    return Err(OsError::new(OsCode::Enotdir, "Not a directory", &dst).into());
                }
                Err(err) => return Err(err),
            }
            let src_label = display_path(&src);
            progress.send(TransferEvent::EnterDir {
                src: src_label.clone(),
                dst: dst.clone(),
            });
            let existing: HashMap<String, FileStatus> = if update {
                self.ls(&dst)
                    .await?
                    .into_iter()
                    .map(|stat| (stat.name().to_string(), stat))
                    .collect()
            } else {
                HashMap::new()
            };
            let children = self.list_local_dir(&src).await?;
            let mut tasks: JoinSet<Result<()>> = JoinSet::new();
            for child in children {
                let child_src = src.join(&child.name);
                let child_dst = join_remote(&dst, &child.name);
                if child.is_file {
                    if let Some(stat) = existing.get(&child.name) {
                        if stat.is_file()
                            && stat.size == child.size
                            && stat.modification_time >= child.mtime
                        {
                            continue;
                        }
                    }
                    let this = self.clone();
                    let child_progress = progress.clone();
                    tasks.spawn(async move {
                        this.upload_file_inner(child_src, child_dst, child_progress)
                            .await
                    });
                } else if child.is_dir {
                    tasks.spawn(self.clone().upload_dir_inner(
                        child_src,
                        child_dst,
                        update,
                        progress.clone(),
                    ));
                } else {
                    progress.send(TransferEvent::Fail {
                        src: display_path(&child_src),
                        dst: child_dst,
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
                dst,
            });
            Ok(())
        })
    }

    /// Enumerate a local directory while holding a file permit.
    async fn list_local_dir(&self, dir: &Path) -> Result<Vec<LocalEntry>> {
        let _permit = self
            .file_sem
            .acquire()
            .await
            .map_err(|_| Error::IllegalArgument("transfer semaphore closed".into()))?;
        let mut entries = Vec::new();
        let mut reader = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = reader.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let file_type = entry.file_type().await?;
            let (size, mtime) = if file_type.is_file() {
                let meta = entry.metadata().await?;
                (meta.len(), mtime_secs(&meta))
            } else {
                (0, 0)
            };
            entries.push(LocalEntry {
                name,
                is_file: file_type.is_file(),
                is_dir: file_type.is_dir(),
                size,
                mtime,
            });
        }
        // Files first, then directories, each sorted by name.
        entries.sort_by(|a, b| (a.is_dir, &a.name).cmp(&(b.is_dir, &b.name)));
        Ok(entries)
    }

    /// Download a single remote file, with the same up-to-date skip rule as
    /// [`Storage::upload_file`].
    pub async fn download_file(
        &self,
        src: &str,
        dst: &Path,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<()> {
        let src_stat = self.stats(src).await?;
        if !src_stat.is_file() {
            return Err(OsError::new(OsCode::Eisdir, "Is a directory", src).into());
        }
        if let Ok(meta) = tokio::fs::metadata(dst).await {
            if meta.is_file()
                && meta.len() == src_stat.size
                && mtime_secs(&meta) >= src_stat.modification_time
            {
                debug!("skipping up-to-date download: {}", dst.display());
                return Ok(());
            }
        }
        self.download_file_inner(src.to_string(), dst.to_owned(), src_stat.size, progress)
            .await
    }

    async fn download_file_inner(
        &self,
        src: String,
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
        let mut file = tokio::fs::File::create(&dst).await?;
        let dst_label = display_path(&dst);
        progress.send(TransferEvent::Start {
            src: src.clone(),
            dst: dst_label.clone(),
            size,
        });
        let mut response = self.open(&src).await?;
        let mut pos = 0u64;
        while let Some(chunk) = response.chunk().await? {
            pos += chunk.len() as u64;
            file.write_all(&chunk).await?;
            progress.send(TransferEvent::Step {
                src: src.clone(),
                dst: dst_label.clone(),
                current: pos,
                size,
            });
        }
        file.flush().await?;
        progress.send(TransferEvent::Complete {
            src,
            dst: dst_label,
            size,
        });
        Ok(())
    }

    /// Recursively download a directory tree.
    pub async fn download_dir(
        self: &Arc<Self>,
        src: &str,
        dst: &Path,
        update: bool,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<()> {
        self.clone()
            .download_dir_inner(src.to_string(), dst.to_owned(), update, progress)
            .await
    }

    fn download_dir_inner(
        self: Arc<Self>,
        src: String,
        dst: PathBuf,
        update: bool,
        progress: Arc<dyn ProgressSink>,
    ) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            tokio::fs::create_dir_all(&dst).await?;
            let dst_label = display_path(&dst);
            progress.send(TransferEvent::EnterDir {
                src: src.clone(),
                dst: dst_label.clone(),
            });
            let existing: HashMap<String, std::fs::Metadata> = if update {
                self.list_local_metadata(&dst).await?
            } else {
                HashMap::new()
            };
            let mut children = self.ls(&src).await?;
            children.sort_by(|a, b| {
                (a.is_dir(), a.name().to_string()).cmp(&(b.is_dir(), b.name().to_string()))
            });
            let mut tasks: JoinSet<Result<()>> = JoinSet::new();
            for child in children {
                let name = child.name().to_string();
                let child_src = join_remote(&src, &name);
                let child_dst = dst.join(&name);
                if child.is_file() {
                    if let Some(meta) = existing.get(&name) {
                        if meta.is_file()
                            && meta.len() == child.size
                            && mtime_secs(meta) >= child.modification_time
                        {
                            continue;
                        }
                    }
                    let this = self.clone();
                    let child_progress = progress.clone();
                    let size = child.size;
                    tasks.spawn(async move {
                        this.download_file_inner(child_src, child_dst, size, child_progress)
                            .await
                    });
                } else {
                    tasks.spawn(self.clone().download_dir_inner(
                        child_src,
                        child_dst,
                        update,
                        progress.clone(),
                    ));
                }
            }
            run_concurrently(tasks).await?;
            progress.send(TransferEvent::LeaveDir {
                src,
                dst: dst_label,
            });
            Ok(())
        })
    }

    async fn list_local_metadata(&self, dir: &Path) -> Result<HashMap<String, std::fs::Metadata>> {
        let _permit = self
            .file_sem
            .acquire()
            .await
            .map_err(|_| Error::IllegalArgument("transfer semaphore closed".into()))?;
        let mut out = HashMap::new();
        let mut reader = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = reader.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            out.insert(name, entry.metadata().await?);
        }
        Ok(out)
    }
}

struct LocalEntry {
    name: String,
    is_file: bool,
    is_dir: bool,
    size: u64,
    mtime: i64,
}
