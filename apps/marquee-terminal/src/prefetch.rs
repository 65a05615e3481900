//! Offline media cache warmer.
//!
//! Extracts every media reference from a state snapshot and fetches the
//! same-origin content URLs the terminal has not cached yet, a few at a
//! time. Failures stay un-cached and are picked up opportunistically by the
//! next warm pass.

use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use futures_util::stream::{self, StreamExt};
use reqwest::Client;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::{debug, warn};
use url::Url;

use marquee_proto::ScreenState;

use crate::conn::ConnState;

pub const PREFETCH_CONCURRENCY: usize = 4;
const CONTENT_PATH_PREFIX: &str = "/content/";
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ContentPrefetcher {
    client: Client,
    origin: Url,
    cache_dir: PathBuf,
    cached: Mutex<HashSet<String>>,
    in_flight: Mutex<HashSet<String>>,
    connectivity: watch::Receiver<ConnState>,
}

impl ContentPrefetcher {
    pub fn new(
        origin: Url,
        cache_dir: PathBuf,
        connectivity: watch::Receiver<ConnState>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&cache_dir)?;
        let client = Client::builder().timeout(FETCH_TIMEOUT).build()?;
        Ok(Self {
            client,
            origin,
            cache_dir,
            cached: Mutex::new(HashSet::new()),
            in_flight: Mutex::new(HashSet::new()),
            connectivity,
        })
    }

    /// Resolve a media reference against the origin, keeping only
    /// same-origin content paths.
    fn resolve(&self, reference: &str) -> Option<Url> {
        let url = self.origin.join(reference).ok()?;
        if url.origin() != self.origin.origin() {
            debug!(reference, "skipping cross-origin media reference");
            return None;
        }
        if !url.path().starts_with(CONTENT_PATH_PREFIX) {
            debug!(reference, "skipping non-content media reference");
            return None;
        }
        Some(url)
    }

    /// Cache files are keyed by the digest of the full URL, so the same
    /// reference always lands on the same file.
    fn cache_path(&self, url: &Url) -> PathBuf {
        let digest = Sha256::digest(url.as_str().as_bytes());
        let name: String = digest.iter().map(|byte| format!("{:02x}", byte)).collect();
        self.cache_dir.join(name)
    }

    pub fn is_cached(&self, url: &Url) -> bool {
        if self.cached.lock().unwrap().contains(url.as_str()) {
            return true;
        }
        self.cache_path(url).exists()
    }

    /// Warm the cache for everything a snapshot references. No-op while the
    /// connectivity signal reports the terminal offline.
    pub async fn warm(&self, states: &[ScreenState]) {
        if *self.connectivity.borrow() != ConnState::Connected {
            debug!("no connectivity; skipping content warm");
            return;
        }

        let mut references = BTreeSet::new();
        for state in states {
            for reference in state.media_refs() {
                references.insert(reference.to_string());
            }
        }

        let mut batch = Vec::new();
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            for reference in references {
                let Some(url) = self.resolve(&reference) else {
                    continue;
                };
                if self.is_cached(&url) || in_flight.contains(url.as_str()) {
                    continue;
                }
                in_flight.insert(url.to_string());
                batch.push(url);
            }
        }
        if batch.is_empty() {
            return;
        }

        debug!(count = batch.len(), "warming content cache");
        stream::iter(batch)
            .for_each_concurrent(PREFETCH_CONCURRENCY, |url| async move {
                match self.fetch_one(&url).await {
                    Ok(()) => {
                        self.cached.lock().unwrap().insert(url.to_string());
                    }
                    Err(err) => {
                        warn!(url = %url, error = %err, "content prefetch failed");
                    }
                }
                self.in_flight.lock().unwrap().remove(url.as_str());
            })
            .await;
    }

    async fn fetch_one(&self, url: &Url) -> Result<()> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await?
            .error_for_status()?;
        let bytes = response.bytes().await?;
        tokio::fs::write(self.cache_path(url), &bytes).await?;
        debug!(url = %url, bytes = bytes.len(), "cached content");
        Ok(())
    }
}
