//! Installed-apps service client.
//!
//! Read side of the platform app catalog: list the app instances installed
//! in a (cluster, org, project) scope and uninstall one by id. Listings are
//! streamed through a channel so callers can stop early.

use std::sync::Arc;

use reqwest::{Method, Url};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::config::ClientConfig;
use crate::core::{Core, Error, RequestOpts, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct App {
    pub id: String,
    pub name: String,
    pub display_name: String,
    pub template_name: String,
    pub template_version: String,
    pub project_name: String,
    pub org_name: String,
    pub state: String,
}

#[derive(Deserialize)]
struct AppsPage {
    items: Vec<App>,
}

pub struct Apps {
    core: Arc<Core>,
    config: Arc<ClientConfig>,
}

impl Apps {
    pub fn new(core: Arc<Core>, config: Arc<ClientConfig>) -> Self {
        Self { core, config }
    }

    /// Instances endpoint for the requested scope; org and project default
    /// to the configured ones.
    fn instances_url(&self, org: Option<&str>, project: Option<&str>) -> Result<Url> {
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
        let mut url = self.config.api_url.clone();
        url.set_path("");
        url.path_segments_mut()
            .map_err(|_| Error::IllegalArgument("api_url cannot be a base".into()))?
            .pop_if_empty()
            .extend([
                "apis",
                "apps",
                "v1",
                "cluster",
                self.config.cluster_name.as_str(),
                "org",
                org.as_str(),
                "project",
                project.as_str(),
                "instances",
            ]);
        Ok(url)
    }

    /// Stream the installed app instances in the scope.
    pub fn list(
        self: &Arc<Self>,
        org: Option<&str>,
        project: Option<&str>,
    ) -> mpsc::Receiver<Result<App>> {
        let (tx, rx) = mpsc::channel(64);
        let this = self.clone();
        let url = self.instances_url(org, project);
        tokio::spawn(async move {
            let url = match url {
                Ok(url) => url,
                Err(err) => {
                    let _ = tx.send(Err(err)).await;
                    return;
                }
            };
            let page = async {
                let response = this
                    .core
                    .request(Method::GET, url, &this.config.auth(), RequestOpts::default())
                    .await?;
                let page: AppsPage = response.json().await?;
                Ok::<_, Error>(page)
            }
            .await;
            match page {
                Ok(page) => {
                    for app in page.items {
                        if tx.send(Ok(app)).await.is_err() {
                            return;
                        }
                    }
                }
                Err(err) => {
                    let _ = tx.send(Err(err)).await;
                }
            }
        });
        rx
    }

    pub async fn uninstall(
        &self,
        app_id: &str,
        org: Option<&str>,
        project: Option<&str>,
    ) -> Result<()> {
        let mut url = self.instances_url(org, project)?;
        url.path_segments_mut()
            .map_err(|_| Error::IllegalArgument("api_url cannot be a base".into()))?
            .push(app_id);
        self.core
            .request(Method::DELETE, url, &self.config.auth(), RequestOpts::default())
            .await?;
        Ok(())
    }
}
