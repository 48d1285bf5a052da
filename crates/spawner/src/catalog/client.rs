//! Catalog HTTP client and snapshot cache
//!
//! Fetches the image list on a timer, independent of any spawn request,
//! and keeps the last-known-good snapshot. A spawn only ever consults
//! the cache; it fails fast with `CatalogUnavailable` if no fetch has
//! ever succeeded.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{CatalogSnapshot, ImageClass, ImageReference, ImageSelection};
use crate::error::SpawnError;

/// One entry as the catalog service serializes it
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogEntry {
    /// Full docker reference
    pub image_url: String,
    /// Display name
    pub name: String,
    /// Layer digest, absent when unknown
    #[serde(default)]
    pub image_hash: Option<String>,
    /// Recommended-default flag
    #[serde(default)]
    pub recommended: bool,
}

/// The catalog service response body
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogPage {
    /// Images pre-pulled onto cluster nodes
    pub images: Vec<CatalogEntry>,
    /// Every available image
    #[serde(default)]
    pub all: Vec<CatalogEntry>,
}

impl From<CatalogEntry> for ImageReference {
    fn from(entry: CatalogEntry) -> Self {
        let tag = super::tag_of(&entry.image_url);
        Self {
            reference: entry.image_url,
            class: ImageClass::from_tag(&tag),
            tag,
            digest: entry.image_hash.unwrap_or_default(),
            display_name: entry.name,
            recommended: entry.recommended,
        }
    }
}

impl CatalogPage {
    pub fn into_snapshot(self) -> CatalogSnapshot {
        CatalogSnapshot::new(
            self.images.into_iter().map(Into::into).collect(),
            self.all.into_iter().map(Into::into).collect(),
        )
    }
}

/// Cached catalog client
pub struct CatalogClient {
    url: String,
    http: reqwest::Client,
    snapshot: RwLock<Option<Arc<CatalogSnapshot>>>,
}

impl CatalogClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            http: reqwest::Client::new(),
            snapshot: RwLock::new(None),
        }
    }

    /// Fetch the catalog once and replace the cached snapshot
    pub async fn refresh(&self) -> Result<(), SpawnError> {
        let page: CatalogPage = self
            .http
            .get(&self.url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| SpawnError::Internal(e.into()))?
            .json()
            .await
            .map_err(|e| SpawnError::Internal(e.into()))?;

        let snapshot = page.into_snapshot();
        debug!(
            cached = snapshot.cached.len(),
            all = snapshot.all.len(),
            "Refreshed image catalog"
        );
        *self.snapshot.write().await = Some(Arc::new(snapshot));
        Ok(())
    }

    /// Spawn the periodic refresh task
    ///
    /// A failed refresh keeps the previous snapshot; the catalog is
    /// advisory and last-known-good is always preferred over nothing.
    pub fn start_refresh_task(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = client.refresh().await {
                    warn!(error = %e, url = %client.url, "Catalog refresh failed, keeping previous snapshot");
                }
            }
        })
    }

    /// The last-known-good snapshot, if any fetch ever succeeded
    pub async fn snapshot(&self) -> Result<Arc<CatalogSnapshot>, SpawnError> {
        self.snapshot
            .read()
            .await
            .clone()
            .ok_or(SpawnError::CatalogUnavailable)
    }

    /// Resolve a selection against the cached snapshot (no network I/O)
    pub async fn resolve(&self, selection: &ImageSelection) -> Result<ImageReference, SpawnError> {
        self.snapshot().await?.resolve(selection)
    }

    /// Inject a snapshot directly; used by tests and warm starts
    pub async fn install_snapshot(&self, snapshot: CatalogSnapshot) {
        *self.snapshot.write().await = Some(Arc::new(snapshot));
    }
}
