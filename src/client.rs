//! Top-level platform client.
//!
//! Builds the shared [`Core`] (connection pool, cookie jar, trace config),
//! seeds session cookies from the local database and hands out the service
//! clients. `close` persists the session cookies back; it is idempotent.

use std::sync::Arc;

use reqwest::cookie::Jar;
use rusqlite::Connection;

use crate::apps::Apps;
use crate::blob::Blob;
use crate::config::ClientConfig;
use crate::core::{Core, Result, CONNECT_TIMEOUT};
use crate::storage::Storage;
use crate::vcluster::VCluster;

pub struct Client {
    core: Arc<Core>,
    config: Arc<ClientConfig>,
    storage: Arc<Storage>,
    blob: Arc<Blob>,
    vcluster: Arc<VCluster>,
    apps: Arc<Apps>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let config = Arc::new(config);
        let jar = Arc::new(Jar::default());
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .cookie_provider(jar.clone())
            .build()?;
        let core = Arc::new(Core::new(
            http,
            jar,
            config.api_url.clone(),
            config.trace_id.clone(),
            config.trace_sampled,
        ));
        std::fs::create_dir_all(&config.config_path)?;
        let conn = Connection::open(config.cookie_db_path())?;
        core.load_cookies(&conn)?;
        let storage = Arc::new(Storage::new(core.clone(), config.clone()));
        let blob = Arc::new(Blob::new(core.clone(), config.clone()));
        let vcluster = Arc::new(VCluster::new(core.clone(), config.clone()));
        let apps = Arc::new(Apps::new(core.clone(), config.clone()));
        Ok(Self {
            core,
            config,
            storage,
            blob,
            vcluster,
            apps,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn core(&self) -> &Arc<Core> {
        &self.core
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn blob(&self) -> &Arc<Blob> {
        &self.blob
    }

    pub fn vcluster(&self) -> &Arc<VCluster> {
        &self.vcluster
    }

    pub fn apps(&self) -> &Arc<Apps> {
        &self.apps
    }

    /// Persist session cookies and release the transport. Only the first
    /// call does anything.
    pub fn close(&self) -> Result<()> {
        if self.core.is_closed() {
            return Ok(());
        }
        let conn = Connection::open(self.config.cookie_db_path())?;
        self.core.save_cookies(&conn)?;
        self.core.close();
        Ok(())
    }
}
