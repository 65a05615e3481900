use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

use marquee_proto::{PushMessage, TerminalCommand};

#[derive(Parser, Debug)]
#[command(name = "marquee-control")]
#[command(about = "Marquee control plane and operator client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Serve from an in-process state store instead of Redis
    #[arg(long)]
    pub memory: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Assign an image to a screen through a running control plane
    SetImage {
        /// Control plane URL (e.g., ws://localhost:8080)
        #[arg(short, long, default_value = "ws://localhost:8080")]
        url: String,

        /// Target screen id
        #[arg(short, long)]
        screen: String,

        /// Media reference to assign
        #[arg(long)]
        src: String,

        /// Scenario name recorded with the assignment
        #[arg(long)]
        scenario: Option<String>,
    },
}

/// Operator-side command sender: joins the push channel, issues one
/// `setImage`, and waits until the resulting broadcast confirms the upsert.
pub async fn run_set_image(
    url: String,
    screen: String,
    src: String,
    scenario: Option<String>,
) -> Result<()> {
    let ws_url = format!("{}/ws/state", url);
    debug!(url = %ws_url, "connecting operator client");

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&ws_url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => return Err(anyhow!("connection failed: {}", err)),
        Err(_) => return Err(anyhow!("connection timeout - is the control plane running?")),
    };
    let (mut write, mut read) = ws_stream.split();

    let command = TerminalCommand::SetImage {
        screen: screen.clone(),
        src: src.clone(),
        scenario,
    };
    let text = serde_json::to_string(&command)?;
    write.send(Message::Text(text.into())).await?;

    let confirmed = timeout(Duration::from_secs(10), async {
        while let Some(frame) = read.next().await {
            if let Message::Text(text) = frame? {
                match serde_json::from_str::<PushMessage>(text.as_str()) {
                    Ok(PushMessage::State { screens }) => {
                        if screens
                            .get(&screen)
                            .is_some_and(|entry| entry.src.as_deref() == Some(src.as_str()))
                        {
                            return Ok::<_, anyhow::Error>(());
                        }
                    }
                    Err(_) => {}
                }
            }
        }
        Err(anyhow!("connection closed before the broadcast arrived"))
    })
    .await;

    match confirmed {
        Ok(Ok(())) => {
            println!("screen {} now shows {}", screen, src);
        }
        Ok(Err(err)) => return Err(err),
        Err(_) => return Err(anyhow!("timed out waiting for the state broadcast")),
    }

    write.send(Message::Close(None)).await?;
    Ok(())
}
