//! Terminal-side push-channel client.
//!
//! One long-lived task owns the connection lifecycle:
//! `Disconnected -> Connecting -> Connected -> Disconnected -> ...` with a
//! doubling reconnect delay that resets on every successful connect. Inbound
//! snapshots are handed to the subscriber verbatim; outbound commands are
//! only accepted while the connection is open, anything else is dropped on
//! the floor and recovered by the server's connect-time snapshot.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use marquee_proto::{PushMessage, ScreenStateMap, TerminalCommand};

pub const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub url: Url,
    pub initial_reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
}

impl ClientConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            initial_reconnect_delay: INITIAL_RECONNECT_DELAY,
            max_reconnect_delay: MAX_RECONNECT_DELAY,
        }
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub(crate) fn next_delay(delay: Duration, max: Duration) -> Duration {
    (delay * 2).min(max)
}

pub struct ConnectionClient {
    config: ClientConfig,
    state: watch::Sender<ConnState>,
    snapshots: mpsc::UnboundedSender<ScreenStateMap>,
    commands_tx: mpsc::UnboundedSender<TerminalCommand>,
    commands_rx: Mutex<mpsc::UnboundedReceiver<TerminalCommand>>,
    shutdown: watch::Sender<bool>,
}

impl ConnectionClient {
    /// Build the client and the snapshot subscription it feeds.
    pub fn new(config: ClientConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<ScreenStateMap>) {
        let (snapshots_tx, snapshots_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnState::Disconnected);
        let (shutdown, _) = watch::channel(false);
        let client = Arc::new(Self {
            config,
            state,
            snapshots: snapshots_tx,
            commands_tx,
            commands_rx: Mutex::new(commands_rx),
            shutdown,
        });
        (client, snapshots_rx)
    }

    /// Current connection state, observable as a watch channel.
    pub fn state(&self) -> watch::Receiver<ConnState> {
        self.state.subscribe()
    }

    /// Queue a command for the server. Dropped with a debug log when the
    /// connection is not open; the next reconnect plus the server's
    /// connect-time snapshot is the recovery path.
    pub fn send(&self, command: TerminalCommand) {
        if *self.state.borrow() != ConnState::Connected {
            debug!("push channel not open; dropping outbound command");
            return;
        }
        let _ = self.commands_tx.send(command);
    }

    /// Clean teardown: closes the socket if open and cancels the reconnect
    /// timer.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Connection lifecycle loop. Runs until [`stop`](Self::stop).
    pub async fn run(self: Arc<Self>) {
        let mut commands = self.commands_rx.lock().await;
        let mut shutdown = self.shutdown.subscribe();
        let mut delay = self.config.initial_reconnect_delay;
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.state.send_replace(ConnState::Connecting);
            match connect_async(self.config.url.as_str()).await {
                Ok((stream, _)) => {
                    info!(url = %self.config.url, "push channel connected");
                    delay = self.config.initial_reconnect_delay;
                    self.state.send_replace(ConnState::Connected);
                    self.drive(stream, &mut commands, &mut shutdown).await;
                    self.state.send_replace(ConnState::Disconnected);
                    info!("push channel disconnected");
                    // anything still queued was accepted against a
                    // connection that no longer exists
                    while commands.try_recv().is_ok() {}
                }
                Err(err) => {
                    self.state.send_replace(ConnState::Disconnected);
                    debug!(error = %err, "push channel connect failed");
                }
            }
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
            delay = next_delay(delay, self.config.max_reconnect_delay);
        }
        self.state.send_replace(ConnState::Disconnected);
    }

    async fn drive(
        &self,
        stream: WsStream,
        commands: &mut mpsc::UnboundedReceiver<TerminalCommand>,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        let (mut sink, mut source) = stream.split();
        loop {
            tokio::select! {
                frame = source.next() => {
                    let Some(frame) = frame else { break };
                    match frame {
                        Ok(Message::Text(text)) => self.handle_payload(text.as_str()),
                        Ok(Message::Ping(payload)) => {
                            if sink.send(Message::Pong(payload)).await.is_err() {
                                break;
                            }
                        }
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(err) => {
                            debug!(error = %err, "push channel read failed");
                            break;
                        }
                    }
                }
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    let text = match serde_json::to_string(&command) {
                        Ok(text) => text,
                        Err(err) => {
                            warn!(error = %err, "failed to encode command");
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        }
    }

    /// The only recognized inbound tag carries a full snapshot; everything
    /// else is logged and ignored with the connection left open.
    fn handle_payload(&self, text: &str) {
        match serde_json::from_str::<PushMessage>(text) {
            Ok(PushMessage::State { screens }) => {
                debug!(screens = screens.len(), "received state snapshot");
                let _ = self.snapshots.send(screens);
            }
            Err(err) => {
                warn!(error = %err, "ignoring unrecognized push payload");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_delay_doubles_to_the_cap() {
        let max = Duration::from_millis(30_000);
        let mut delay = Duration::from_millis(1_000);
        let mut observed = vec![delay.as_millis() as u64];
        for _ in 0..6 {
            delay = next_delay(delay, max);
            observed.push(delay.as_millis() as u64);
        }
        assert_eq!(observed, vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000]);
    }

    #[tokio::test]
    async fn send_while_disconnected_drops_the_command() {
        let config = ClientConfig::new(Url::parse("ws://127.0.0.1:9/ws/state").unwrap());
        let (client, _snapshots) = ConnectionClient::new(config);
        client.send(TerminalCommand::SetImage {
            screen: "s1".into(),
            src: "/content/a.png".into(),
            scenario: None,
        });
        // nothing was queued for a future connection
        assert!(client.commands_rx.lock().await.try_recv().is_err());
    }
}
