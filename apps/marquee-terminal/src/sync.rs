//! Pull-based sync cycle: the resilience path behind the push channel.
//!
//! One cycle pulls three independent resource sets through an injected
//! source, each fetch wrapped in the retry policy on its own, and commits
//! whatever succeeded. Partial success is the designed outcome: a terminal
//! with stale screen geometry but healthy state delivery still gets its
//! images updated.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use marquee_proto::{CacheMetadata, Display, Screen, ScreenState, CACHE_SCHEMA_VERSION};

use crate::retry::RetryPolicy;
use crate::store::{LocalStore, StoreError};

pub const RESOURCE_DISPLAYS: &str = "displays";
pub const RESOURCE_SCREENS: &str = "screens";
pub const RESOURCE_STATES: &str = "states";

/// Substrings that mark an error message as transient. Anything else fails
/// without retry.
const TRANSIENT_MARKERS: &[&str] = &["network", "fetch", "timeout", "connection"];

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("network error: {0}")]
    Network(String),
    #[error("server returned status {0}")]
    Status(u16),
    #[error("malformed response: {0}")]
    Decode(String),
    #[error("circuit breaker open")]
    Suspended,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SyncError {
    pub fn from_request(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return SyncError::Status(status.as_u16());
        }
        if err.is_timeout() {
            SyncError::Network(format!("timeout: {}", err))
        } else {
            SyncError::Network(err.to_string())
        }
    }

    /// Heuristic retry classification: server errors and anything whose
    /// message smells like a connectivity problem.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Status(code) => *code >= 500,
            other => {
                let message = other.to_string().to_lowercase();
                TRANSIENT_MARKERS
                    .iter()
                    .any(|marker| message.contains(marker))
            }
        }
    }
}

/// Fetch boundary injected into the orchestrator; the HTTP implementation
/// lives in [`crate::fetch`], tests substitute their own.
#[async_trait]
pub trait SyncSource: Send + Sync {
    async fn fetch_displays(&self) -> Result<Vec<Display>, SyncError>;
    async fn fetch_screens(&self, display_id: &str) -> Result<Vec<Screen>, SyncError>;
    async fn fetch_states(&self) -> Result<Vec<ScreenState>, SyncError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncStatus {
    pub is_syncing: bool,
    pub last_sync: Option<chrono::DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl SyncStatus {
    fn idle() -> Self {
        Self {
            is_syncing: false,
            last_sync: None,
            last_error: None,
        }
    }
}

pub struct SyncOrchestrator {
    store: Arc<LocalStore>,
    retry: RetryPolicy,
    in_flight: AtomicBool,
    status_tx: watch::Sender<SyncStatus>,
}

struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SyncOrchestrator {
    pub fn new(store: Arc<LocalStore>, retry: RetryPolicy) -> Self {
        let (status_tx, _) = watch::channel(SyncStatus::idle());
        Self {
            store,
            retry,
            in_flight: AtomicBool::new(false),
            status_tx,
        }
    }

    /// Subscribe to sync-status updates. Dropping the receiver is the
    /// unsubscribe.
    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.status_tx.subscribe()
    }

    /// Run one sync cycle. Single-flight: a call that finds another cycle in
    /// progress performs no fetches and returns the current status
    /// unchanged.
    pub async fn sync(&self, display_id: &str, source: &dyn SyncSource) -> SyncStatus {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("sync already in flight; ignoring request");
            return self.status_tx.borrow().clone();
        }
        let _guard = InFlightGuard(&self.in_flight);
        self.run_cycle(display_id, source).await
    }

    async fn run_cycle(&self, display_id: &str, source: &dyn SyncSource) -> SyncStatus {
        let mut status = self.status_tx.borrow().clone();
        status.is_syncing = true;
        self.status_tx.send_replace(status);

        let transient = |err: &SyncError| err.is_transient();
        let (displays, screens, states) = tokio::join!(
            self.retry
                .run(RESOURCE_DISPLAYS, transient, || source.fetch_displays()),
            self.retry
                .run(RESOURCE_SCREENS, transient, || source.fetch_screens(display_id)),
            self.retry
                .run(RESOURCE_STATES, transient, || source.fetch_states()),
        );

        let mut failures: Vec<&'static str> = Vec::new();
        let mut updated = false;

        let displays = match displays {
            Ok(displays) => Some(displays),
            Err(err) => {
                warn!(error = %err, "display fetch failed after retries");
                failures.push(RESOURCE_DISPLAYS);
                None
            }
        };
        if let Some(displays) = &displays {
            match self.store.replace_displays(displays) {
                Ok(()) => updated = true,
                Err(err) => {
                    warn!(error = %err, "caching displays failed");
                    failures.push(RESOURCE_DISPLAYS);
                }
            }
        }

        match screens {
            Ok(screens) => match self.store.replace_screens(display_id, &screens) {
                Ok(()) => updated = true,
                Err(err) => {
                    warn!(error = %err, "caching screens failed");
                    failures.push(RESOURCE_SCREENS);
                }
            },
            Err(err) => {
                warn!(error = %err, "screen fetch failed after retries");
                failures.push(RESOURCE_SCREENS);
            }
        }

        match states {
            Ok(states) => match self.store.replace_states(&states) {
                Ok(()) => updated = true,
                Err(err) => {
                    warn!(error = %err, "caching states failed");
                    failures.push(RESOURCE_STATES);
                }
            },
            Err(err) => {
                warn!(error = %err, "state fetch failed after retries");
                failures.push(RESOURCE_STATES);
            }
        }

        if updated {
            let mut display_ids: BTreeSet<String> = self
                .store
                .metadata()
                .map(|meta| meta.display_ids.into_iter().collect())
                .unwrap_or_default();
            if let Some(displays) = &displays {
                display_ids.extend(displays.iter().map(|d| d.id.clone()));
            }
            display_ids.insert(display_id.to_string());
            let metadata = CacheMetadata {
                version: CACHE_SCHEMA_VERSION,
                last_updated: Utc::now(),
                display_ids: display_ids.into_iter().collect(),
            };
            if let Err(err) = self.store.put_metadata(&metadata) {
                warn!(error = %err, "metadata update failed");
            }
        }

        let status = SyncStatus {
            is_syncing: false,
            last_sync: if updated { Some(Utc::now()) } else { None },
            last_error: if failures.is_empty() {
                None
            } else {
                Some(format!("Sync issues: {}", failures.join(", ")))
            },
        };
        if failures.is_empty() {
            info!("sync cycle complete");
        } else {
            info!(failures = ?failures, "sync cycle complete with partial failures");
        }
        self.status_tx.send_replace(status.clone());
        status
    }
}
