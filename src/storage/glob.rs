//! Shell-style glob over remote storage.
//!
//! Patterns use `*`, `?` and `[seq]` within a path component and `**` for a
//! recursive descent. Hidden entries (dot-prefixed) only match when the
//! pattern component itself starts with a dot. Matches stream through a
//! channel so huge trees never materialize in memory; dropping the receiver
//! stops the walk.

use std::sync::Arc;

use futures::future::BoxFuture;
use regex::Regex;
use tokio::sync::mpsc;

use crate::core::{Error, Result};
use crate::transfer::join_remote;

use super::Storage;

pub(crate) fn has_magic(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

pub(crate) fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

fn is_recursive(pattern: &str) -> bool {
    pattern == "**"
}

/// Translate a glob pattern into an anchored regular expression, matching
/// whole names only.
pub(crate) fn translate(pattern: &str) -> String {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::from("^");
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        i += 1;
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => {
                let mut j = i;
                if j < chars.len() && chars[j] == '!' {
                    j += 1;
                }
                if j < chars.len() && chars[j] == ']' {
                    j += 1;
                }
                while j < chars.len() && chars[j] != ']' {
                    j += 1;
                }
                if j >= chars.len() {
                    out.push_str("\\[");
                } else {
                    let mut inner: String = chars[i..j].iter().collect();
                    inner = inner.replace('\\', "\\\\");
                    out.push('[');
                    if let Some(rest) = inner.strip_prefix('!') {
                        out.push('^');
                        out.push_str(rest);
                    } else {
                        out.push_str(&inner);
                    }
                    out.push(']');
                    i = j + 1;
                }
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    out
}

fn split_pattern(pattern: &str) -> (String, String) {
    match pattern.rsplit_once('/') {
        Some((parent, basename)) => (parent.to_string(), basename.to_string()),
        None => (String::new(), pattern.to_string()),
    }
}

impl Storage {
    /// Expand a glob pattern against remote storage, streaming matches in
    /// listing order. A pattern without magic characters is checked for
    /// existence and yielded as-is.
    pub fn glob(self: &Arc<Self>, pattern: &str) -> mpsc::Receiver<Result<String>> {
        let (tx, rx) = mpsc::channel(64);
        let this = self.clone();
        let pattern = pattern.to_string();
        tokio::spawn(async move {
            if let Err(err) = this.glob_rec(pattern, false, tx.clone()).await {
                let _ = tx.send(Err(err)).await;
            }
        });
        rx
    }

    fn glob_rec(
        self: Arc<Self>,
        pattern: String,
        dironly: bool,
        tx: mpsc::Sender<Result<String>>,
    ) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            if tx.is_closed() {
                return Ok(());
            }
            if !has_magic(&pattern) {
                let _ = tx.send(Ok(pattern)).await;
                return Ok(());
            }
            let (parent, basename) = split_pattern(&pattern);
            if !has_magic(&parent) {
                self.glob_in_dir(&parent, &basename, dironly, &tx).await
            } else {
                let (parent_tx, mut parent_rx) = mpsc::channel::<Result<String>>(16);
                let producer = self.clone().glob_rec(parent, true, parent_tx);
                let consumer = async {
                    while let Some(item) = parent_rx.recv().await {
                        let matched_parent = item?;
                        self.glob_in_dir(&matched_parent, &basename, dironly, &tx)
                            .await?;
                    }
                    Ok(())
                };
                tokio::try_join!(producer, consumer)?;
                Ok(())
            }
        })
    }

    async fn glob_in_dir(
        &self,
        parent: &str,
        basename: &str,
        dironly: bool,
        tx: &mpsc::Sender<Result<String>>,
    ) -> Result<()> {
        if is_recursive(basename) {
            // `**` matches the directory itself plus everything under it.
            let self_uri = if parent.is_empty() {
                "/".to_string()
            } else {
                parent.to_string()
            };
            if tx.send(Ok(self_uri)).await.is_err() {
                return Ok(());
            }
            return self.rlistdir(parent.to_string(), dironly, tx.clone()).await;
        }
        if has_magic(basename) {
            let matcher = Regex::new(&translate(basename))
                .map_err(|err| Error::IllegalArgument(format!("bad glob pattern: {err}")))?;
            let allow_hidden = is_hidden(basename);
            for stat in self.ls(parent).await? {
                let name = stat.name();
                if !allow_hidden && is_hidden(name) {
                    continue;
                }
                if dironly && !stat.is_dir() {
                    continue;
                }
                if matcher.is_match(name)
                    && tx.send(Ok(join_remote(parent, name))).await.is_err()
                {
                    return Ok(());
                }
            }
            return Ok(());
        }
        // Literal basename under an expanded parent: yield on existence.
        let target = if basename.is_empty() {
            parent.to_string()
        } else {
            join_remote(parent, basename)
        };
        match self.stats(&target).await {
            Ok(stat) => {
                if !dironly || stat.is_dir() {
                    let _ = tx.send(Ok(target)).await;
                }
                Ok(())
            }
            Err(Error::NotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn rlistdir(
        &self,
        dir: String,
        dironly: bool,
        tx: mpsc::Sender<Result<String>>,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if tx.is_closed() {
                return Ok(());
            }
            for stat in self.ls(&dir).await? {
                let name = stat.name();
                if is_hidden(name) {
                    continue;
                }
                if dironly && !stat.is_dir() {
                    continue;
                }
                let child = join_remote(&dir, name);
                if tx.send(Ok(child.clone())).await.is_err() {
                    return Ok(());
                }
                if stat.is_dir() {
                    self.rlistdir(child, dironly, tx.clone()).await?;
                }
            }
            Ok(())
        })
    }
}
