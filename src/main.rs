// walink — binary entry point.
//
// Wires the production adapters together: config from disk, Telegram over
// the Bot API, WhatsApp through the Evolution-style sidecar. Only a config
// load failure is allowed to kill the process; everything later degrades to
// logged errors and chat notifications.

use log::{error, info};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use walink::atoms::error::{BridgeError, BridgeResult};
use walink::engine::bridge::EventBridge;
use walink::engine::config::ConfigStore;
use walink::engine::telegram::HttpTelegram;
use walink::engine::whatsapp::{EvolutionClient, EvolutionSettings};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run().await {
        error!("[walink] Fatal: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> BridgeResult<()> {
    let config_path =
        std::env::args().nth(1).unwrap_or_else(|| "./config.json".to_string());
    let store = Arc::new(ConfigStore::load(&config_path)?);

    let token = resolve_bot_token(&store)?;
    let telegram = HttpTelegram::new(token)?;
    let bot_username = telegram.get_me().await?;
    info!("[walink] Connected to Telegram as @{}", bot_username);

    let stop = Arc::new(AtomicBool::new(false));

    let client = Arc::new(EvolutionClient::new(EvolutionSettings::from_env()));
    client.spawn_webhook_listener(stop.clone());

    let bridge = EventBridge::new(store, client, Arc::new(telegram));

    // Re-pair everything that was linked before the restart.
    bridge.restore_sessions().await;

    // Ctrl-C flips the stop flag; the poll loop notices within one long-poll
    // timeout.
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("[walink] Shutdown requested");
                stop.store(true, Ordering::Relaxed);
            }
        });
    }

    info!("[walink] Bridge running");
    bridge.run(stop).await
}

/// Bot credential resolution order: environment variable, then config file,
/// then an interactive console prompt on first run (saved back to config).
fn resolve_bot_token(store: &Arc<ConfigStore>) -> BridgeResult<String> {
    if let Ok(token) = std::env::var("BOT_TOKEN") {
        if !token.trim().is_empty() {
            return Ok(token.trim().to_string());
        }
    }

    let from_config = store.with(|c| c.bot_token.trim().to_string());
    if !from_config.is_empty() {
        return Ok(from_config);
    }

    print!("Enter your Telegram bot token: ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    let token = answer.trim().to_string();
    if token.is_empty() {
        return Err(BridgeError::Config("no bot token provided".into()));
    }
    store.update(|c| c.bot_token = token.clone())?;
    Ok(token)
}
