//! Push-channel broadcaster.
//!
//! Holds no display state of its own: every snapshot is a fresh read of the
//! authoritative store, serialized once and fanned out to every open
//! connection. Connections that fail to take a send are skipped; connections
//! that stop answering liveness probes are evicted.

use anyhow::Result;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use marquee_proto::{PushMessage, ScreenState, TerminalCommand};

use crate::store::StateStore;

/// Fixed cadence of the liveness probe. A connection that never answers is
/// gone within two intervals.
pub const PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Frames queued toward one connection's forwarder task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Pre-serialized snapshot text; identical for every target of one
    /// broadcast.
    Snapshot(String),
    /// Liveness probe, sent as a WS ping frame.
    Probe,
    /// Close the socket; the registry entry is already gone.
    Terminate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Liveness {
    Alive,
    AwaitingPong,
}

struct TerminalConn {
    tx: mpsc::UnboundedSender<Outbound>,
    liveness: Liveness,
}

pub struct Broadcaster {
    conns: DashMap<String, TerminalConn>,
    store: Arc<dyn StateStore>,
}

impl Broadcaster {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            conns: DashMap::new(),
            store,
        }
    }

    pub fn register(&self, conn_id: &str, tx: mpsc::UnboundedSender<Outbound>) {
        self.conns.insert(
            conn_id.to_string(),
            TerminalConn {
                tx,
                liveness: Liveness::Alive,
            },
        );
        debug!(conn = %conn_id, total = self.conns.len(), "push connection registered");
    }

    pub fn unregister(&self, conn_id: &str) {
        self.conns.remove(conn_id);
        debug!(conn = %conn_id, total = self.conns.len(), "push connection removed");
    }

    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    async fn snapshot_text(&self) -> Result<String> {
        let states = self.store.list_states().await?;
        Ok(serde_json::to_string(&PushMessage::state_from(&states))?)
    }

    /// Send one full snapshot to a newly connected terminal. Storage read
    /// failures propagate to the caller; an inconsistent push is worse than
    /// a delayed one.
    pub async fn on_connect(&self, conn_id: &str) -> Result<()> {
        let text = self.snapshot_text().await?;
        if let Some(conn) = self.conns.get(conn_id) {
            let _ = conn.tx.send(Outbound::Snapshot(text));
        }
        Ok(())
    }

    /// Re-read authoritative state once and push the identical snapshot to
    /// every open connection. A connection that refuses the send is skipped;
    /// it never aborts the rest of the broadcast.
    pub async fn on_mutation(&self) -> Result<()> {
        let text = self.snapshot_text().await?;
        let mut skipped = 0usize;
        for conn in self.conns.iter() {
            if conn.tx.send(Outbound::Snapshot(text.clone())).is_err() {
                skipped += 1;
            }
        }
        if skipped > 0 {
            debug!(skipped, "broadcast skipped closed connections");
        }
        Ok(())
    }

    /// Handle one inbound text frame. The single recognized command is
    /// `setImage`; unrecognized tags are ignored, malformed payloads are
    /// logged and dropped without closing the connection.
    pub async fn on_command(&self, conn_id: &str, text: &str) -> Result<()> {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(err) => {
                warn!(conn = %conn_id, error = %err, "dropping malformed command payload");
                return Ok(());
            }
        };
        match serde_json::from_value::<TerminalCommand>(value.clone()) {
            Ok(TerminalCommand::SetImage { screen, src, scenario }) => {
                info!(conn = %conn_id, screen = %screen, src = %src, "set image command");
                let state = ScreenState {
                    screen_id: screen,
                    src: Some(src),
                    scenario,
                    slideshow: None,
                    updated_at: chrono::Utc::now(),
                };
                self.store.upsert_state(state).await?;
                self.on_mutation().await
            }
            Err(err) => {
                match value.get("type").and_then(|tag| tag.as_str()) {
                    Some(tag) if tag != "setImage" => {
                        debug!(conn = %conn_id, %tag, "ignoring unrecognized command type");
                    }
                    _ => {
                        warn!(conn = %conn_id, error = %err, "dropping malformed command payload");
                    }
                }
                Ok(())
            }
        }
    }

    /// Record a pong for a connection, returning it to `Alive`.
    pub fn mark_pong(&self, conn_id: &str) {
        if let Some(mut conn) = self.conns.get_mut(conn_id) {
            conn.liveness = Liveness::Alive;
        }
    }

    /// One probe cycle: evict connections still awaiting the previous pong,
    /// then probe the rest.
    pub fn probe_tick(&self) {
        let dead: Vec<String> = self
            .conns
            .iter()
            .filter(|conn| conn.liveness == Liveness::AwaitingPong)
            .map(|conn| conn.key().clone())
            .collect();
        for conn_id in dead {
            if let Some((_, conn)) = self.conns.remove(&conn_id) {
                let _ = conn.tx.send(Outbound::Terminate);
                info!(conn = %conn_id, "terminating unresponsive push connection");
            }
        }
        for mut conn in self.conns.iter_mut() {
            conn.liveness = Liveness::AwaitingPong;
            let _ = conn.tx.send(Outbound::Probe);
        }
    }

    /// Start the probe loop. The returned handle owns the task; drop it or
    /// call [`ProberHandle::stop`] to tear the timer down deterministically.
    pub fn start_prober(self: Arc<Self>, interval: Duration) -> ProberHandle {
        let broadcaster = self;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // the first tick fires immediately; skip it so a fresh
            // connection is not probed before it finishes registering
            ticker.tick().await;
            loop {
                ticker.tick().await;
                broadcaster.probe_tick();
            }
        });
        ProberHandle { task }
    }
}

pub struct ProberHandle {
    task: JoinHandle<()>,
}

impl ProberHandle {
    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for ProberHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStateStore;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use chrono::Utc;
    use marquee_proto::{Display, Screen};

    fn state(screen_id: &str, src: &str) -> ScreenState {
        ScreenState {
            screen_id: screen_id.into(),
            src: Some(src.into()),
            scenario: None,
            slideshow: None,
            updated_at: Utc::now(),
        }
    }

    fn seeded_broadcaster() -> (Arc<Broadcaster>, Arc<MemoryStateStore>) {
        let store = Arc::new(MemoryStateStore::default());
        store.seed_state(state("s1", "/content/a.png"));
        let broadcaster = Arc::new(Broadcaster::new(store.clone()));
        (broadcaster, store)
    }

    fn attach(broadcaster: &Broadcaster, conn_id: &str) -> mpsc::UnboundedReceiver<Outbound> {
        let (tx, rx) = mpsc::unbounded_channel();
        broadcaster.register(conn_id, tx);
        rx
    }

    fn expect_snapshot(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> String {
        match rx.try_recv().expect("frame queued") {
            Outbound::Snapshot(text) => text,
            other => panic!("expected snapshot, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn connect_receives_full_snapshot() {
        let (broadcaster, _) = seeded_broadcaster();
        let mut rx = attach(&broadcaster, "t1");
        broadcaster.on_connect("t1").await.unwrap();
        let text = expect_snapshot(&mut rx);
        assert!(text.contains(r#""type":"state""#));
        assert!(text.contains("/content/a.png"));
    }

    #[tokio::test]
    async fn broadcast_after_mutation_is_byte_identical_everywhere() {
        let (broadcaster, _) = seeded_broadcaster();
        let mut rx1 = attach(&broadcaster, "t1");
        let mut rx2 = attach(&broadcaster, "t2");
        broadcaster
            .on_command("t1", r#"{"type":"setImage","screen":"s1","src":"/content/b.png"}"#)
            .await
            .unwrap();
        let first = expect_snapshot(&mut rx1);
        let second = expect_snapshot(&mut rx2);
        assert_eq!(first, second);
        assert!(first.contains("/content/b.png"));
    }

    #[tokio::test]
    async fn set_image_upserts_before_broadcasting() {
        let (broadcaster, store) = seeded_broadcaster();
        broadcaster
            .on_command(
                "t1",
                r#"{"type":"setImage","screen":"s2","src":"/content/c.png","scenario":"night"}"#,
            )
            .await
            .unwrap();
        let states = store.list_states().await.unwrap();
        let added = states.iter().find(|s| s.screen_id == "s2").unwrap();
        assert_eq!(added.src.as_deref(), Some("/content/c.png"));
        assert_eq!(added.scenario.as_deref(), Some("night"));
    }

    #[tokio::test]
    async fn unrecognized_command_type_is_ignored() {
        let (broadcaster, store) = seeded_broadcaster();
        let mut rx = attach(&broadcaster, "t1");
        broadcaster
            .on_command("t1", r#"{"type":"reboot","screen":"s1"}"#)
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(store.list_states().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn malformed_payload_is_dropped_without_closing() {
        let (broadcaster, _) = seeded_broadcaster();
        let mut rx = attach(&broadcaster, "t1");
        broadcaster.on_command("t1", "not json at all").await.unwrap();
        broadcaster
            .on_command("t1", r#"{"type":"setImage","screen":"s1"}"#)
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(broadcaster.connection_count(), 1);
    }

    #[tokio::test]
    async fn closed_connection_does_not_abort_broadcast() {
        let (broadcaster, _) = seeded_broadcaster();
        let dead_rx = attach(&broadcaster, "dead");
        drop(dead_rx);
        let mut live_rx = attach(&broadcaster, "live");
        broadcaster.on_mutation().await.unwrap();
        expect_snapshot(&mut live_rx);
    }

    #[tokio::test]
    async fn unanswered_probe_evicts_within_two_ticks() {
        let (broadcaster, _) = seeded_broadcaster();
        let mut rx = attach(&broadcaster, "t1");
        broadcaster.probe_tick();
        assert_eq!(rx.try_recv().unwrap(), Outbound::Probe);
        assert_eq!(broadcaster.connection_count(), 1);
        broadcaster.probe_tick();
        assert_eq!(rx.try_recv().unwrap(), Outbound::Terminate);
        assert_eq!(broadcaster.connection_count(), 0);
    }

    #[tokio::test]
    async fn pong_keeps_connection_alive() {
        let (broadcaster, _) = seeded_broadcaster();
        let mut rx = attach(&broadcaster, "t1");
        broadcaster.probe_tick();
        assert_eq!(rx.try_recv().unwrap(), Outbound::Probe);
        broadcaster.mark_pong("t1");
        broadcaster.probe_tick();
        assert_eq!(rx.try_recv().unwrap(), Outbound::Probe);
        assert_eq!(broadcaster.connection_count(), 1);
    }

    struct FailingStore;

    #[async_trait]
    impl StateStore for FailingStore {
        async fn list_displays(&self) -> Result<Vec<Display>> {
            Err(anyhow!("storage offline"))
        }
        async fn list_screens(&self, _display_id: &str) -> Result<Vec<Screen>> {
            Err(anyhow!("storage offline"))
        }
        async fn list_states(&self) -> Result<Vec<ScreenState>> {
            Err(anyhow!("storage offline"))
        }
        async fn upsert_state(&self, _state: ScreenState) -> Result<()> {
            Err(anyhow!("storage offline"))
        }
    }

    #[tokio::test]
    async fn storage_read_failure_surfaces_to_caller() {
        let broadcaster = Arc::new(Broadcaster::new(Arc::new(FailingStore)));
        let _rx = attach(&broadcaster, "t1");
        assert!(broadcaster.on_connect("t1").await.is_err());
        assert!(broadcaster.on_mutation().await.is_err());
    }
}
