//! Shared plumbing for the file-transfer engine.
//!
//! Storage and blob transfers both fan out over a [`JoinSet`], stream file
//! bodies in fixed-size chunks under a semaphore that bounds open file
//! handles, and report through a [`ProgressSink`]. The pieces common to both
//! live here.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use md5::{Digest, Md5};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;

use crate::core::{Error, Result};
use crate::progress::{ProgressSink, TransferEvent};

/// Chunk size for streaming file bodies.
pub const READ_SIZE: usize = 1 << 20;

/// Await every task in the set, aborting the remainder as soon as one fails.
///
/// Aborted siblings are drained before returning so no task outlives the
/// call; the first error wins. Panics inside tasks are resumed here.
pub(crate) async fn run_concurrently(mut tasks: JoinSet<Result<()>>) -> Result<()> {
    let mut first_err: Option<Error> = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                if first_err.is_none() {
                    first_err = Some(err);
                    tasks.abort_all();
                }
            }
            Err(join_err) => {
                if join_err.is_panic() {
                    std::panic::resume_unwind(join_err.into_panic());
                }
                // Cancelled siblings are drained silently.
            }
        }
    }
    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

struct BodyState {
    file: File,
    pos: u64,
    size: u64,
    src: String,
    dst: String,
    progress: Arc<dyn ProgressSink>,
    _permit: OwnedSemaphorePermit,
}

/// Open a local file and wrap it as a chunked request body.
///
/// Holds a semaphore permit for the lifetime of the stream, emits `Start`
/// up front, a `Step` per chunk and `Complete` at EOF. Returns the file
/// size alongside the body so callers can set length headers.
pub(crate) async fn file_body(
    sem: Arc<Semaphore>,
    src: PathBuf,
    dst: String,
    progress: Arc<dyn ProgressSink>,
) -> Result<(u64, reqwest::Body)> {
    let permit = sem
        .acquire_owned()
        .await
        .map_err(|_| Error::IllegalArgument("transfer semaphore closed".into()))?;
    let file = File::open(&src).await?;
    let size = file.metadata().await?.len();
    let src_label = display_path(&src);
    progress.send(TransferEvent::Start {
        src: src_label.clone(),
        dst: dst.clone(),
        size,
    });
    let state = BodyState {
        file,
        pos: 0,
        size,
        src: src_label,
        dst,
        progress,
        _permit: permit,
    };
    let stream = futures::stream::unfold(Some(state), |state| async move {
        let mut state = state?;
        let mut buf = vec![0u8; READ_SIZE];
        match state.file.read(&mut buf).await {
            Ok(0) => {
                state.progress.send(TransferEvent::Complete {
                    src: state.src.clone(),
                    dst: state.dst.clone(),
                    size: state.size,
                });
                None
            }
            Ok(n) => {
                buf.truncate(n);
                state.pos += n as u64;
                state.progress.send(TransferEvent::Step {
                    src: state.src.clone(),
                    dst: state.dst.clone(),
                    current: state.pos,
                    size: state.size,
                });
                Some((Ok(buf), Some(state)))
            }
            Err(err) => Some((Err(err), None)),
        }
    });
    Ok((size, reqwest::Body::wrap_stream(stream)))
}

/// Base64-encoded MD5 of a file, suitable for a `Content-MD5` header.
/// Hashing is offloaded to a blocking thread.
pub(crate) async fn file_md5(path: &Path) -> Result<String> {
    let path = path.to_owned();
    let digest = tokio::task::spawn_blocking(move || -> std::io::Result<[u8; 16]> {
        use std::io::Read;
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Md5::new();
        let mut buf = vec![0u8; READ_SIZE];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finalize().into())
    })
    .await
    .map_err(|err| Error::IllegalArgument(format!("md5 task failed: {err}")))??;
    Ok(BASE64.encode(digest))
}

/// Modification time as whole unix seconds, the granularity the platform
/// reports for remote files.
pub(crate) fn mtime_secs(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub(crate) fn display_path(path: &Path) -> String {
    path.display().to_string()
}

/// Join a child name onto a remote slash-separated path.
pub(crate) fn join_remote(parent: &str, name: &str) -> String {
    let trimmed = parent.trim_end_matches('/');
    if trimmed.is_empty() {
        format!("/{name}")
    } else {
        format!("{trimmed}/{name}")
    }
}

/// Parent of a remote path, or None at the root.
pub(crate) fn remote_parent(path: &str) -> Option<String> {
    let trimmed = path.trim_end_matches('/');
    let (parent, _) = trimmed.rsplit_once('/')?;
    if parent.is_empty() {
        None
    } else {
        Some(parent.to_string())
    }
}
