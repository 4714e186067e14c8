mod file_config;

pub use file_config::FileConfig;

use anyhow::{anyhow, bail, Context, Result};
use reqwest::Url;
use std::path::PathBuf;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub api_url: Option<String>,
    pub storage_url: Option<String>,
    pub blob_url: Option<String>,
    pub vcluster_url: Option<String>,
    pub token: Option<String>,
    pub username: Option<String>,
    pub cluster: Option<String>,
    pub org: Option<String>,
    pub project: Option<String>,
    pub config_dir: Option<PathBuf>,
    pub trace_id: Option<String>,
    pub trace_sampled: Option<bool>,
}

/// Fully resolved client configuration; everything a [`crate::Client`]
/// needs, with all URLs validated as absolute.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_url: Url,
    pub storage_url: Url,
    pub blob_url: Url,
    pub vcluster_url: Option<Url>,
    pub token: String,
    pub username: String,
    pub cluster_name: String,
    pub org_name: Option<String>,
    pub project_name: Option<String>,
    /// Local state directory: session cookie db, service-account bundles.
    pub config_path: PathBuf,
    pub trace_id: Option<String>,
    pub trace_sampled: Option<bool>,
}

impl ClientConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let api_url = file
            .api_url
            .or_else(|| cli.api_url.clone())
            .ok_or_else(|| anyhow!("api_url must be specified via --api-url or in config file"))?;
        let api_url = parse_url("api_url", &api_url)?;

        let storage_url = match file.storage_url.or_else(|| cli.storage_url.clone()) {
            Some(raw) => parse_url("storage_url", &raw)?,
            None => join_base(&api_url, "storage")?,
        };
        let blob_url = match file.blob_url.or_else(|| cli.blob_url.clone()) {
            Some(raw) => parse_url("blob_url", &raw)?,
            None => join_base(&api_url, "blob")?,
        };
        let vcluster_url = file
            .vcluster_url
            .or_else(|| cli.vcluster_url.clone())
            .map(|raw| parse_url("vcluster_url", &raw))
            .transpose()?;

        let token = file
            .token
            .or_else(|| cli.token.clone())
            .ok_or_else(|| anyhow!("token must be specified via --token or in config file"))?;
        let username = file
            .username
            .or_else(|| cli.username.clone())
            .ok_or_else(|| anyhow!("username must be specified via --username or in config file"))?;
        let cluster_name = file
            .cluster
            .or_else(|| cli.cluster.clone())
            .ok_or_else(|| anyhow!("cluster must be specified via --cluster or in config file"))?;
        let org_name = file.org.or_else(|| cli.org.clone());
        let project_name = file.project.or_else(|| cli.project.clone());

        let config_path = match &cli.config_dir {
            Some(dir) => dir.clone(),
            None => default_config_dir()?,
        };

        let trace_id = file.trace_id.or_else(|| cli.trace_id.clone());
        let trace_sampled = file.trace_sampled.or(cli.trace_sampled);

        Ok(Self {
            api_url,
            storage_url,
            blob_url,
            vcluster_url,
            token,
            username,
            cluster_name,
            org_name,
            project_name,
            config_path,
            trace_id,
            trace_sampled,
        })
    }

    pub fn auth(&self) -> String {
        format!("Bearer {}", self.token)
    }

    pub fn cookie_db_path(&self) -> PathBuf {
        self.config_path.join("session.db")
    }
}

fn parse_url(name: &str, raw: &str) -> Result<Url> {
    let url = Url::parse(raw).with_context(|| format!("Invalid {name}: {raw}"))?;
    if !url.has_host() {
        bail!("{name} must be an absolute URL with a host: {raw}");
    }
    Ok(url)
}

/// Join a service path onto the API base, keeping any base path prefix.
fn join_base(api_url: &Url, service: &str) -> Result<Url> {
    let mut url = api_url.clone();
    url.path_segments_mut()
        .map_err(|_| anyhow!("api_url cannot be a base: {api_url}"))?
        .pop_if_empty()
        .push(service);
    Ok(url)
}

fn default_config_dir() -> Result<PathBuf> {
    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .ok_or_else(|| anyhow!("cannot determine home directory, pass --config-dir"))?;
    Ok(home.join(".skylift"))
}
