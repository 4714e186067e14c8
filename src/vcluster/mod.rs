//! Virtual-cluster service accounts.
//!
//! A service account is a kubeconfig bundle minted by the platform for a
//! vcluster scoped to (cluster, org, project). Bundles are written under the
//! local config directory with tight permissions, and `activate` merges one
//! into the user's kubeconfig via [`crate::kubeconfig::merge`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::DateTime;
use reqwest::{Method, Url};
use serde::Deserialize;
use tracing::info;

use crate::config::ClientConfig;
use crate::core::{Core, Error, OsCode, OsError, RequestOpts, Result};
use crate::kubeconfig;

pub const DEFAULT_TTL_DAYS: u64 = 365;

fn ttl_secs(ttl_days: Option<u64>) -> u64 {
    ttl_days.unwrap_or(DEFAULT_TTL_DAYS) * 24 * 60 * 60
}

#[derive(Debug, Clone, Deserialize)]
pub struct KubeServiceAccount {
    pub user: String,
    pub name: String,
    /// RFC 3339 timestamps as reported by the platform.
    pub created_at: String,
    pub expired_at: String,
}

impl KubeServiceAccount {
    /// Expiry as unix seconds, when the timestamp parses.
    pub fn expires_at_unix(&self) -> Option<i64> {
        DateTime::parse_from_rfc3339(&self.expired_at)
            .ok()
            .map(|t| t.timestamp())
    }
}

pub struct VCluster {
    core: Arc<Core>,
    config: Arc<ClientConfig>,
}

impl VCluster {
    pub fn new(core: Arc<Core>, config: Arc<ClientConfig>) -> Self {
        Self { core, config }
    }

    /// Scope URL: `<vcluster>/kube/cluster/<c>/org/<o>/project/<p>`. Falls
    /// back to the configured defaults when org or project are not given.
    fn scope_url(&self, org: Option<&str>, project: Option<&str>) -> Result<(Url, Scope)> {
        let base = self
            .config
            .vcluster_url
            .clone()
            .ok_or_else(|| Error::IllegalArgument("vcluster_url is not configured".into()))?;
        let org = org
            .map(str::to_owned)
            .or_else(|| self.config.org_name.clone())
            .ok_or_else(|| Error::IllegalArgument("org is not specified or configured".into()))?;
        let project = project
            .map(str::to_owned)
            .or_else(|| self.config.project_name.clone())
            .ok_or_else(|| {
                Error::IllegalArgument("project is not specified or configured".into())
            })?;
        let mut url = base;
        url.path_segments_mut()
            .map_err(|_| Error::IllegalArgument("vcluster_url cannot be a base".into()))?
            .pop_if_empty()
            .extend([
                "kube",
                "cluster",
                self.config.cluster_name.as_str(),
                "org",
                org.as_str(),
                "project",
                project.as_str(),
            ]);
        Ok((
            url,
            Scope {
                cluster: self.config.cluster_name.clone(),
                org,
                project,
            },
        ))
    }

    /// Mint a service account and write its kubeconfig bundle to the local
    /// config directory. Returns the bundle path.
    pub async fn create_service_account(
        &self,
        name: &str,
        ttl_days: Option<u64>,
        org: Option<&str>,
        project: Option<&str>,
    ) -> Result<PathBuf> {
        let (scope_url, scope) = self.scope_url(org, project)?;
        let mut url = scope_url;
        url.path_segments_mut()
            .map_err(|_| Error::IllegalArgument("vcluster_url cannot be a base".into()))?
            .push("config");
        let opts = RequestOpts {
            json: Some(serde_json::json!({
                "name": name,
                "ttl": ttl_secs(ttl_days),
            })),
            ..Default::default()
        };
        let response = self
            .core
            .request(Method::POST, url, &self.config.auth(), opts)
            .await?;
        let bundle = response.text().await?;
        let path = self.write_bundle(&scope, name, &bundle).await?;
        info!("wrote service account bundle to {}", path.display());
        Ok(path)
    }

    /// Re-mint the credentials of an existing service account, refreshing
    /// the local bundle.
    pub async fn regenerate_service_account(
        &self,
        name: &str,
        ttl_days: Option<u64>,
        org: Option<&str>,
        project: Option<&str>,
    ) -> Result<PathBuf> {
        let (scope_url, scope) = self.scope_url(org, project)?;
        let mut url = scope_url;
        url.path_segments_mut()
            .map_err(|_| Error::IllegalArgument("vcluster_url cannot be a base".into()))?
            .extend(["config", name]);
        let opts = RequestOpts {
            json: Some(serde_json::json!({ "ttl": ttl_secs(ttl_days) })),
            ..Default::default()
        };
        let response = self
            .core
            .request(Method::PUT, url, &self.config.auth(), opts)
            .await?;
        let bundle = response.text().await?;
        let path = self.write_bundle(&scope, name, &bundle).await?;
        Ok(path)
    }

    /// List service accounts in the scope; without `all_users` only the
    /// caller's own accounts are returned.
    pub async fn list_service_accounts(
        &self,
        all_users: bool,
        org: Option<&str>,
        project: Option<&str>,
    ) -> Result<Vec<KubeServiceAccount>> {
        let (scope_url, _scope) = self.scope_url(org, project)?;
        let mut url = scope_url;
        url.path_segments_mut()
            .map_err(|_| Error::IllegalArgument("vcluster_url cannot be a base".into()))?
            .push("config");
        let response = self
            .core
            .request(Method::GET, url, &self.config.auth(), RequestOpts::default())
            .await?;
        let mut accounts: Vec<KubeServiceAccount> = response.json().await?;
        if !all_users {
            accounts.retain(|account| account.user == self.config.username);
        }
        Ok(accounts)
    }

    pub async fn delete_service_account(
        &self,
        name: &str,
        org: Option<&str>,
        project: Option<&str>,
    ) -> Result<KubeServiceAccount> {
        let (scope_url, _scope) = self.scope_url(org, project)?;
        let mut url = scope_url;
        url.path_segments_mut()
            .map_err(|_| Error::IllegalArgument("vcluster_url cannot be a base".into()))?
            .extend(["config", name]);
        let response = self
            .core
            .request(Method::DELETE, url, &self.config.auth(), RequestOpts::default())
            .await?;
        Ok(response.json().await?)
    }

    /// Merge a previously written bundle into the user's kubeconfig. The
    /// bundle must exist locally; create or regenerate it first.
    pub async fn activate_service_account(
        &self,
        name: &str,
        org: Option<&str>,
        project: Option<&str>,
        kube_config: Option<&Path>,
    ) -> Result<PathBuf> {
        let (_url, scope) = self.scope_url(org, project)?;
        let bundle_path = self.bundle_path(&scope, name);
        let bundle_text = match tokio::fs::read_to_string(&bundle_path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(OsError::new(
                    OsCode::Enoent,
                    "No such service account bundle",
                    bundle_path.display().to_string(),
                )
                .into());
            }
            Err(err) => return Err(err.into()),
        };
        let incoming: serde_yaml::Mapping = serde_yaml::from_str(&bundle_text)?;
        let kube_config_path = match kube_config {
            Some(path) => path.to_owned(),
            None => default_kube_config()?,
        };
        let mut base = kubeconfig::load(&kube_config_path).await?;
        kubeconfig::merge(&mut base, &incoming);
        kubeconfig::save(&kube_config_path, &base).await?;
        info!("activated service account {name} in {}", kube_config_path.display());
        Ok(kube_config_path)
    }

    fn bundle_dir(&self, scope: &Scope) -> PathBuf {
        self.config
            .config_path
            .join(&scope.cluster)
            .join(&scope.org)
            .join(&scope.project)
    }

    fn bundle_path(&self, scope: &Scope, name: &str) -> PathBuf {
        self.bundle_dir(scope)
            .join(format!("{}-{name}.yaml", self.config.username))
    }

    async fn write_bundle(&self, scope: &Scope, name: &str, bundle: &str) -> Result<PathBuf> {
        let dir = self.bundle_dir(scope);
        tokio::fs::create_dir_all(&dir).await?;
        let path = self.bundle_path(scope, name);
        tokio::fs::write(&path, bundle).await?;
        restrict_permissions(&dir, &path).await?;
        Ok(path)
    }
}

struct Scope {
    cluster: String,
    org: String,
    project: String,
}

fn default_kube_config() -> Result<PathBuf> {
    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .ok_or_else(|| Error::IllegalArgument("cannot determine home directory".into()))?;
    Ok(home.join(".kube").join("config"))
}

#[cfg(unix)]
async fn restrict_permissions(dir: &Path, file: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).await?;
    tokio::fs::set_permissions(file, std::fs::Permissions::from_mode(0o600)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn restrict_permissions(_dir: &Path, _file: &Path) -> Result<()> {
    Ok(())
}
