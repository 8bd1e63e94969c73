// src/main.rs - Replay tool: reads JSON chat messages from stdin and prints one decision per line

use anyhow::{Context, Result};
use log::{info, warn};
use std::env;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::time::Duration;

use chatwarden::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables and initialize logging
    dotenv::dotenv().ok();
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    info!("Starting Chatwarden v{}", chatwarden::VERSION);

    let config_path = env::args()
        .nth(1)
        .or_else(|| env::var("CHATWARDEN_CONFIG").ok())
        .unwrap_or_else(|| "chatwarden.yaml".to_string());
    let config = EngineConfig::from_path(&config_path)
        .await
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;

    let live = env::var("CHATWARDEN_OFFLINE").is_err();
    let category = env::var("CHATWARDEN_CATEGORY").ok();
    let stream = Arc::new(ManualStream::new(live, category.as_deref()));
    let detector = SpamDetector::new(config, stream).context("Invalid configuration")?;

    let mut driver = WheelDriver::new(Duration::from_millis(100));
    detector.register(&mut driver);
    let timers = driver.spawn();

    info!("Reading messages from stdin (live: {}, category: {:?})", live, category);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut checked = 0usize;
    let mut flagged = 0usize;

    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        let msg: ChatMessage = match serde_json::from_str(&line) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Skipping malformed message: {}", e);
                continue;
            }
        };

        let action = detector.check(&msg);
        checked += 1;
        if !action.is_none() {
            flagged += 1;
        }

        let out = serde_json::json!({
            "message_id": msg.message_id,
            "username": msg.username,
            "action": action,
        });
        stdout
            .write_all(format!("{}\n", out).as_bytes())
            .await
            .context("Failed to write decision")?;
    }
    stdout.flush().await.ok();

    info!("Checked {} messages, {} actions", checked, flagged);
    timers.shutdown().await;
    Ok(())
}
