//! Authoritative display-state storage.
//!
//! The broadcaster holds no state of its own: every snapshot is a fresh read
//! through this trait. Catalog mutation (display/screen CRUD) happens in the
//! management endpoints outside this service; the one write path here is the
//! screen-state upsert driven by terminal commands.

use anyhow::Result;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use std::sync::RwLock;

use marquee_proto::{Display, Screen, ScreenState};

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn list_displays(&self) -> Result<Vec<Display>>;
    async fn list_screens(&self, display_id: &str) -> Result<Vec<Screen>>;
    async fn list_states(&self) -> Result<Vec<ScreenState>>;
    async fn upsert_state(&self, state: ScreenState) -> Result<()>;
}

fn display_screens_key(display_id: &str) -> String {
    format!("display-screens:{}", display_id)
}

fn screen_key(id: &str) -> String {
    format!("screen:{}", id)
}

fn state_key(screen_id: &str) -> String {
    format!("state:{}", screen_id)
}

/// Redis-backed store for multi-process deployments.
#[derive(Clone)]
pub struct RedisStateStore {
    redis: ConnectionManager,
}

impl RedisStateStore {
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self { redis })
    }

    async fn scan_values<T: serde::de::DeserializeOwned>(&self, pattern: &str) -> Result<Vec<T>> {
        let mut conn = self.redis.clone();
        let mut cursor: u64 = 0;
        let mut results = Vec::new();
        loop {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .cursor_arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100u32)
                .query_async(&mut conn)
                .await?;
            cursor = next_cursor;
            if !keys.is_empty() {
                let values: Vec<Option<String>> =
                    redis::cmd("MGET").arg(keys).query_async(&mut conn).await?;
                for value in values.into_iter().flatten() {
                    match serde_json::from_str::<T>(&value) {
                        Ok(record) => results.push(record),
                        Err(err) => {
                            tracing::warn!(error = %err, "skipping undecodable record");
                        }
                    }
                }
            }
            if cursor == 0 {
                break;
            }
        }
        Ok(results)
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn list_displays(&self) -> Result<Vec<Display>> {
        self.scan_values("display:*").await
    }

    async fn list_screens(&self, display_id: &str) -> Result<Vec<Screen>> {
        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn.smembers(display_screens_key(display_id)).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = ids.iter().map(|id| screen_key(id)).collect();
        let values: Vec<Option<String>> =
            redis::cmd("MGET").arg(keys).query_async(&mut conn).await?;
        let mut screens = Vec::with_capacity(values.len());
        for value in values.into_iter().flatten() {
            match serde_json::from_str::<Screen>(&value) {
                Ok(screen) => screens.push(screen),
                Err(err) => tracing::warn!(error = %err, "skipping undecodable screen"),
            }
        }
        Ok(screens)
    }

    async fn list_states(&self) -> Result<Vec<ScreenState>> {
        self.scan_values("state:*").await
    }

    async fn upsert_state(&self, state: ScreenState) -> Result<()> {
        let mut conn = self.redis.clone();
        let value = serde_json::to_string(&state)?;
        conn.set::<_, _, ()>(state_key(&state.screen_id), value)
            .await?;
        Ok(())
    }
}

/// In-process store for single-binary deployments and tests.
#[derive(Default)]
pub struct MemoryStateStore {
    displays: RwLock<HashMap<String, Display>>,
    screens: RwLock<HashMap<String, Screen>>,
    states: RwLock<HashMap<String, ScreenState>>,
}

impl MemoryStateStore {
    pub fn seed_display(&self, display: Display) {
        self.displays
            .write()
            .unwrap()
            .insert(display.id.clone(), display);
    }

    pub fn seed_screen(&self, screen: Screen) {
        self.screens
            .write()
            .unwrap()
            .insert(screen.id.clone(), screen);
    }

    pub fn seed_state(&self, state: ScreenState) {
        self.states
            .write()
            .unwrap()
            .insert(state.screen_id.clone(), state);
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn list_displays(&self) -> Result<Vec<Display>> {
        let mut displays: Vec<Display> = self.displays.read().unwrap().values().cloned().collect();
        displays.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(displays)
    }

    async fn list_screens(&self, display_id: &str) -> Result<Vec<Screen>> {
        let mut screens: Vec<Screen> = self
            .screens
            .read()
            .unwrap()
            .values()
            .filter(|screen| screen.display_id == display_id)
            .cloned()
            .collect();
        screens.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(screens)
    }

    async fn list_states(&self) -> Result<Vec<ScreenState>> {
        let mut states: Vec<ScreenState> = self.states.read().unwrap().values().cloned().collect();
        states.sort_by(|a, b| a.screen_id.cmp(&b.screen_id));
        Ok(states)
    }

    async fn upsert_state(&self, state: ScreenState) -> Result<()> {
        self.states
            .write()
            .unwrap()
            .insert(state.screen_id.clone(), state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn state(screen_id: &str, src: &str) -> ScreenState {
        ScreenState {
            screen_id: screen_id.into(),
            src: Some(src.into()),
            scenario: None,
            slideshow: None,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn upsert_replaces_state_for_screen() {
        let store = MemoryStateStore::default();
        store.upsert_state(state("s1", "/content/a.png")).await.unwrap();
        store.upsert_state(state("s1", "/content/b.png")).await.unwrap();
        let states = store.list_states().await.unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].src.as_deref(), Some("/content/b.png"));
    }

    #[tokio::test]
    async fn screens_are_filtered_by_display() {
        let store = MemoryStateStore::default();
        store.seed_screen(Screen {
            id: "s1".into(),
            display_id: "lobby".into(),
            rect: marquee_proto::Rect { x: 0, y: 0, width: 1920, height: 1080 },
            name: None,
            location: None,
        });
        store.seed_screen(Screen {
            id: "s2".into(),
            display_id: "atrium".into(),
            rect: marquee_proto::Rect { x: 0, y: 0, width: 1920, height: 1080 },
            name: None,
            location: None,
        });
        let screens = store.list_screens("lobby").await.unwrap();
        assert_eq!(screens.len(), 1);
        assert_eq!(screens[0].id, "s1");
    }
}
