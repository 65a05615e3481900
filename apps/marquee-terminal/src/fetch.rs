//! HTTP implementation of the sync source, fronted by the circuit breaker.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use url::Url;

use marquee_proto::{Display, Screen, ScreenState};

use crate::retry::CircuitBreaker;
use crate::sync::{SyncError, SyncSource};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const BREAKER_THRESHOLD: u32 = 5;
const BREAKER_COOLDOWN: Duration = Duration::from_secs(60);

pub struct HttpSyncSource {
    client: Client,
    base: Url,
    breaker: CircuitBreaker,
}

impl HttpSyncSource {
    pub fn new(base: Url) -> Result<Self> {
        let client = Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            client,
            base,
            breaker: CircuitBreaker::new(BREAKER_THRESHOLD, BREAKER_COOLDOWN),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, SyncError> {
        if !self.breaker.allow() {
            return Err(SyncError::Suspended);
        }
        let url = self
            .base
            .join(path)
            .map_err(|err| SyncError::Decode(err.to_string()))?;
        let result = self.request(url).await;
        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(_) => self.breaker.record_failure(),
        }
        result
    }

    async fn request<T: DeserializeOwned>(&self, url: Url) -> Result<T, SyncError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(SyncError::from_request)?
            .error_for_status()
            .map_err(SyncError::from_request)?;
        response.json::<T>().await.map_err(|err| {
            if err.is_decode() {
                SyncError::Decode(err.to_string())
            } else {
                SyncError::from_request(err)
            }
        })
    }
}

#[async_trait]
impl SyncSource for HttpSyncSource {
    async fn fetch_displays(&self) -> Result<Vec<Display>, SyncError> {
        self.get_json("/api/displays").await
    }

    async fn fetch_screens(&self, display_id: &str) -> Result<Vec<Screen>, SyncError> {
        self.get_json(&format!("/api/displays/{}/screens", display_id))
            .await
    }

    async fn fetch_states(&self) -> Result<Vec<ScreenState>, SyncError> {
        self.get_json("/api/states").await
    }
}
